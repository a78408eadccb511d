use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{Action, Error, Result, Round, Sequence, Timer};

/// Asynchronous read completion callback.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// Hardware operations supplied by an ADC driver.
pub trait SamplingDriver: Send + Sync + Sized + 'static {
    /// Starts conversions of all channels in `round`. The driver calls
    /// [`AcquisitionContext::on_sampling_done`] once every channel was read,
    /// or [`AcquisitionContext::complete`] with an error.
    fn start_sampling(&self, ctx: &AcquisitionContext<Self>, round: &Round);

    /// Moves the output position to the next round, or back to the start of
    /// the current one if `repeat` is set.
    fn update_buffer_pointer(&self, ctx: &AcquisitionContext<Self>, repeat: bool);
}

/// Caller mode captured by [`AcquisitionContext::lock`].
pub enum Mode {
    /// The caller blocks in [`AcquisitionContext::wait_for_completion`].
    Sync,
    /// The result is delivered to the completion callback and the lock is
    /// held until then.
    Async(Completion),
}

/// Ownership state of the context lock.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LockState {
    #[default]
    Idle,
    HeldSync,
    HeldAsyncPending,
}

/// Proof of lock ownership returned by [`AcquisitionContext::lock`]. Ties
/// the remaining calls of a read to the caller's own operation.
#[derive(Debug)]
#[must_use]
pub struct Claim {
    epoch: u64,
    asynchronous: bool,
}

impl Claim {
    /// Returns whether the claim was taken in asynchronous mode.
    #[inline(always)]
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.asynchronous
    }
}

/// Sequencer shared by the read path and the driver's completion path.
pub struct AcquisitionContext<D>(Arc<Inner<D>>);

struct Inner<D> {
    driver: D,
    timer: Box<dyn Timer>,
    requested: AtomicUsize,
    st: Mutex<State>,
    cv: Condvar,
}

struct State {
    lock: LockState,
    epoch: u64,
    completion: Option<Completion>,
    status: Result<()>,
    seq: Option<Sequence>,
    index: usize,
    timer: bool,
    done: Option<Result<()>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            lock: LockState::Idle,
            epoch: 0,
            completion: None,
            status: Ok(()),
            seq: None,
            index: 0,
            timer: false,
            done: None,
        }
    }
}

impl<D: SamplingDriver> AcquisitionContext<D> {
    /// Creates a context for `driver`. The context starts out locked until
    /// device initialization calls [`Self::unlock_unconditionally`].
    #[must_use]
    pub fn new(driver: D, timer: impl Timer + 'static) -> Self {
        Self(Arc::new(Inner {
            driver,
            timer: Box::new(timer),
            requested: AtomicUsize::new(0),
            st: Mutex::new(State {
                lock: LockState::HeldSync,
                ..State::default()
            }),
            cv: Condvar::new(),
        }))
    }

    /// Returns the driver.
    #[inline(always)]
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.0.driver
    }

    /// Returns the current lock state.
    #[inline]
    #[must_use]
    pub fn lock_state(&self) -> LockState {
        self.0.st.lock().lock
    }

    /// Blocks until the context is idle and takes it for one read.
    pub fn lock(&self, mode: Mode) -> Claim {
        let mut st = self.0.st.lock();
        while st.lock != LockState::Idle {
            self.0.cv.wait(&mut st);
        }
        st.epoch = st.epoch.wrapping_add(1);
        st.done = None;
        let asynchronous = match mode {
            Mode::Sync => {
                st.lock = LockState::HeldSync;
                false
            }
            Mode::Async(f) => {
                st.lock = LockState::HeldAsyncPending;
                st.completion = Some(f);
                true
            }
        };
        trace!("ADC locked ({:?}, epoch {})", st.lock, st.epoch);
        Claim {
            epoch: st.epoch,
            asynchronous,
        }
    }

    /// Arms `seq` and starts the first round, or starts the sampling timer
    /// if the sequence has a non-zero interval.
    pub fn start_read(&self, claim: &Claim, seq: Sequence) -> Result<()> {
        seq.validate()?;
        let interval = seq.interval();
        {
            let mut st = self.0.st.lock();
            debug_assert_eq!(st.epoch, claim.epoch);
            st.seq = Some(seq);
            st.status = Ok(());
            st.index = 0;
            st.timer = interval.is_some();
        }
        let Some(period) = interval else {
            self.start_sampling();
            return Ok(());
        };
        self.0.requested.store(0, Ordering::Release);
        let ctx = Arc::downgrade(&self.0);
        let r = (self.0.timer).start(period, Box::new(move || Self::tick(&ctx)));
        if r.is_err() {
            let mut st = self.0.st.lock();
            (st.seq, st.timer) = (None, false);
        }
        r
    }

    /// Returns the final status of a synchronous read. Asynchronous callers
    /// get `Ok(())` immediately.
    pub fn wait_for_completion(&self, claim: &Claim) -> Result<()> {
        if claim.asynchronous {
            return Ok(());
        }
        let mut st = self.0.st.lock();
        debug_assert_eq!(st.epoch, claim.epoch);
        loop {
            if let Some(r) = st.done.take() {
                return r;
            }
            self.0.cv.wait(&mut st);
        }
    }

    /// Ends the caller's part of a read. The lock is kept only by a
    /// successful asynchronous read, which releases it on completion.
    /// Returns `status`.
    pub fn release(&self, claim: Claim, status: Result<()>) -> Result<()> {
        if !(claim.asynchronous && status.is_ok()) {
            self.unlock(claim.epoch);
        }
        status
    }

    /// Called on every timer expiry. Starts a round if none is running.
    /// Otherwise the request is recorded and the read will report an
    /// overrun.
    pub fn request_next_sampling(&self) {
        if self.0.requested.fetch_add(1, Ordering::AcqRel) == 0 {
            self.start_sampling();
            return;
        }
        let mut st = self.0.st.lock();
        if st.status.is_ok() {
            debug!("ADC sampling overrun");
            st.status = Err(Error::Overrun);
        }
    }

    /// Called by the driver once all channels of the current round were
    /// read.
    pub fn on_sampling_done(&self) {
        let opts = {
            let mut st = self.0.st.lock();
            let idx = st.index;
            let Some(seq) = st.seq.as_mut() else {
                warn!("ADC sampling done without an active sequence");
                return;
            };
            (seq.options.as_mut()).map(|o| (o.callback.take(), idx, o.extra_samplings, o.interval))
        };
        let Some((mut cb, idx, extra, interval)) = opts else {
            return self.complete(Ok(()));
        };
        let action = cb.as_mut().map_or(Action::Continue, |f| f(idx));
        let finish = {
            let mut st = self.0.st.lock();
            let Some(o) = st.seq.as_mut().and_then(|s| s.options.as_mut()) else {
                // Completed with an error by the driver
                return;
            };
            o.callback = cb;
            match action {
                Action::Repeat => false,
                Action::Continue if st.index < extra => {
                    st.index += 1;
                    false
                }
                Action::Continue | Action::Finish => true,
            }
        };
        if finish {
            return self.complete(Ok(()));
        }
        self.0.driver.update_buffer_pointer(self, action == Action::Repeat);
        if interval.is_zero() {
            self.start_sampling();
            return;
        }
        // Expiries missed during this round collapse into one extra round
        let prev = (self.0.requested)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(usize::from(n > 1)))
            .unwrap_or_else(|n| n);
        if prev > 1 {
            self.start_sampling();
        }
    }

    /// Finishes the current read. An error overrides the status of the read,
    /// but success does not clear an earlier overrun.
    pub fn complete(&self, status: Result<()>) {
        let (completion, status, epoch, timer) = {
            let mut st = self.0.st.lock();
            if st.seq.take().is_none() {
                warn!("ADC completion without an active sequence");
                return;
            }
            if let Err(e) = status {
                st.status = Err(e);
            }
            let status = st.status;
            let timer = std::mem::take(&mut st.timer);
            match st.lock {
                LockState::HeldAsyncPending => (st.completion.take(), status, Some(st.epoch), timer),
                LockState::HeldSync => {
                    st.done = Some(status);
                    self.0.cv.notify_all();
                    (None, status, None, timer)
                }
                LockState::Idle => {
                    warn!("ADC completion while unlocked");
                    (None, status, None, timer)
                }
            }
        };
        if timer {
            self.0.timer.stop();
        }
        debug!("ADC read complete: {status:?}");
        if let Some(epoch) = epoch {
            if let Some(f) = completion {
                f(status);
            }
            self.unlock(epoch);
        }
    }

    /// Forces the context into the idle state. Used at device
    /// initialization.
    pub fn unlock_unconditionally(&self) {
        let mut st = self.0.st.lock();
        st.lock = LockState::Idle;
        st.completion = None;
        self.0.cv.notify_all();
    }

    /// Starts one round of the armed sequence.
    fn start_sampling(&self) {
        let round = {
            let st = self.0.st.lock();
            st.seq.as_ref().map(|s| Round::new(s, st.index))
        };
        match round {
            Some(r) => {
                trace!("ADC round {} channels {:#X}", r.index, r.channels);
                self.0.driver.start_sampling(self, &r);
            }
            None => warn!("ADC sampling requested without an active sequence"),
        }
    }

    /// Releases the lock if it is still held by the specified operation.
    fn unlock(&self, epoch: u64) {
        let mut st = self.0.st.lock();
        if st.epoch == epoch && st.lock != LockState::Idle {
            st.lock = LockState::Idle;
            st.completion = None;
            self.0.cv.notify_all();
        }
    }

    fn tick(ctx: &Weak<Inner<D>>) {
        if let Some(inner) = ctx.upgrade() {
            Self(inner).request_next_sampling();
        }
    }
}

impl<D> Clone for AcquisitionContext<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D> Debug for AcquisitionContext<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let st = self.0.st.lock();
        f.debug_struct("AcquisitionContext")
            .field("lock", &st.lock)
            .field("status", &st.status)
            .field("index", &st.index)
            .finish_non_exhaustive()
    }
}
