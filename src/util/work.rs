use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send>;

/// System work queue. Runs submitted jobs one at a time on a dedicated
/// thread, in submission order, after their optional delays expire.
#[derive(Clone, Debug)]
pub(crate) struct WorkQueue {
    inner: Arc<Inner>,
    tid: ThreadId,
}

#[derive(Debug, Default)]
struct Inner {
    q: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
    join: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Job>,
    delayed: BinaryHeap<Delayed>,
    seq: u64,
    running: bool,
    stop: bool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("ready", &self.ready.len())
            .field("delayed", &self.delayed.len())
            .field("running", &self.running)
            .field("stop", &self.stop)
            .finish()
    }
}

impl WorkQueue {
    /// Spawns the work queue thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let inner = Arc::new(Inner::default());
        let h = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || inner.run())?
        };
        let tid = h.thread().id();
        *inner.join.lock() = Some(h);
        Ok(Self { inner, tid })
    }

    /// Queues a job for immediate execution.
    #[inline]
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut q = self.inner.q.lock();
        if q.stop {
            return;
        }
        q.ready.push_back(Box::new(job));
        self.inner.work.notify_one();
    }

    /// Queues a job for execution after `delay`.
    pub fn submit_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            return self.submit(job);
        }
        let mut q = self.inner.q.lock();
        if q.stop {
            return;
        }
        q.seq += 1;
        let d = Delayed {
            at: Instant::now() + delay,
            seq: q.seq,
            job: Box::new(job),
        };
        q.delayed.push(d);
        self.inner.work.notify_one();
    }

    /// Blocks until all jobs that are ready to run, including delayed jobs
    /// whose deadline has passed, have finished.
    pub fn flush(&self) {
        debug_assert!(!self.is_current(), "flush from the work queue thread");
        let now = Instant::now();
        let mut q = self.inner.q.lock();
        loop {
            let due = q.delayed.peek().map_or(false, |d| d.at <= now);
            if q.stop || (q.ready.is_empty() && !q.running && !due) {
                return;
            }
            self.inner.idle.wait(&mut q);
        }
    }

    /// Returns whether the caller is running on the work queue thread.
    #[inline]
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.tid
    }

    /// Stops the work queue thread, dropping any queued jobs.
    pub fn stop(&self) {
        let dropped = {
            let mut q = self.inner.q.lock();
            q.stop = true;
            self.inner.work.notify_all();
            self.inner.idle.notify_all();
            (std::mem::take(&mut q.ready), std::mem::take(&mut q.delayed))
        };
        drop(dropped);
        if self.is_current() {
            return;
        }
        if let Some(h) = self.inner.join.lock().take() {
            let _ = h.join();
        }
    }
}

impl Inner {
    fn run(&self) {
        debug!("Work queue started");
        while let Some(job) = self.next() {
            job();
            let mut q = self.q.lock();
            q.running = false;
            self.idle.notify_all();
        }
        debug!("Work queue stopped");
    }

    fn next(&self) -> Option<Job> {
        let mut q = self.q.lock();
        loop {
            if q.stop {
                return None;
            }
            let now = Instant::now();
            while q.delayed.peek().map_or(false, |d| d.at <= now) {
                if let Some(d) = q.delayed.pop() {
                    trace!("Delayed job {} is due", d.seq);
                    q.ready.push_back(d.job);
                }
            }
            if let Some(job) = q.ready.pop_front() {
                q.running = true;
                return Some(job);
            }
            self.idle.notify_all();
            match q.delayed.peek().map(|d| d.at) {
                Some(at) => {
                    self.work.wait_until(&mut q, at);
                }
                None => self.work.wait(&mut q),
            }
        }
    }
}

/// Job scheduled to run at a specific time. Ordered so that the earliest
/// deadline is at the top of a max-heap.
struct Delayed {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Delayed work item that can be rescheduled or cancelled. Scheduling again
/// supersedes any previously scheduled run that has not started yet.
#[derive(Debug, Default)]
pub(crate) struct DelayedWork(Arc<AtomicU64>);

impl DelayedWork {
    /// Schedules `f` to run after `delay`, replacing any earlier schedule.
    pub fn schedule(&self, wq: &WorkQueue, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let gen = Arc::clone(&self.0);
        let g = gen.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        wq.submit_after(delay, move || {
            if gen.load(AtomicOrdering::Acquire) == g {
                f();
            }
        });
    }

    /// Cancels any scheduled run that has not started yet.
    #[inline]
    pub fn cancel(&self) {
        self.0.fetch_add(1, AtomicOrdering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn order() {
        let wq = WorkQueue::new("test-wq").unwrap();
        let v = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let v = Arc::clone(&v);
            wq.submit(move || v.lock().push(i));
        }
        wq.flush();
        assert_eq!(*v.lock(), [0, 1, 2, 3]);
        wq.stop();
    }

    #[test]
    fn reschedule() {
        let wq = WorkQueue::new("test-wq").unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        let w = DelayedWork::default();
        for _ in 0..3 {
            let n = Arc::clone(&n);
            w.schedule(&wq, Duration::from_millis(5), move || {
                n.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        thread::sleep(Duration::from_millis(20));
        wq.flush();
        assert_eq!(n.load(AtomicOrdering::Relaxed), 1);

        let m = Arc::clone(&n);
        w.schedule(&wq, Duration::from_millis(5), move || {
            m.fetch_add(1, AtomicOrdering::Relaxed);
        });
        w.cancel();
        thread::sleep(Duration::from_millis(20));
        wq.flush();
        assert_eq!(n.load(AtomicOrdering::Relaxed), 1);
        wq.stop();
    }

    #[test]
    fn current() {
        let wq = WorkQueue::new("test-wq").unwrap();
        assert!(!wq.is_current());
        let on = Arc::new(Mutex::new(false));
        {
            let (wq2, on) = (wq.clone(), Arc::clone(&on));
            wq.submit(move || *on.lock() = wq2.is_current());
        }
        wq.flush();
        assert!(*on.lock());
        wq.stop();
    }
}
