use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};

use tracing::{debug, error, trace, warn};

use crate::hci::Boundary;

use super::*;

/// Completion callback for an outbound frame. Called exactly once with
/// `Ok(())` after the controller acknowledges the final fragment, or with an
/// error if the connection is lost first.
pub type TxCallback = Box<dyn FnOnce(&Conn, Result<()>) + Send>;

/// TX context drawn from the shared free-list.
pub(super) struct Tx {
    cb: TxCallback,
    /// Number of callback-free fragments sent after this one that must be
    /// acknowledged before the next context.
    pending_no_cb: u32,
}

/// Queued outbound L2CAP frame.
pub(super) struct Frame {
    buf: Vec<u8>,
    tx: Option<Tx>,
}

/// Per-connection TX bookkeeping.
#[derive(Default)]
pub(super) struct TxState {
    queue: VecDeque<Frame>,
    pending: VecDeque<Tx>,
    pending_no_cb: u32,
    complete: VecDeque<(Tx, Result<()>)>,
}

impl TxState {
    /// Returns whether no frames are queued or awaiting acknowledgment.
    #[inline]
    pub(super) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty() && self.pending_no_cb == 0
    }

    /// Prepares the state for a new connection.
    pub(super) fn reset(&mut self) {
        debug_assert!(self.is_idle(), "stale TX state");
        self.queue.clear();
        self.pending_no_cb = 0;
    }
}

impl Debug for TxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxState")
            .field("queue", &self.queue.len())
            .field("pending", &self.pending.len())
            .field("pending_no_cb", &self.pending_no_cb)
            .field("complete", &self.complete.len())
            .finish()
    }
}

/// Bookkeeping entry to undo when the controller rejects a fragment.
#[derive(Clone, Copy, Debug)]
enum Undo {
    Pending,
    Tail,
    Conn,
}

impl Shared {
    /// Takes a TX context from the free-list. The work queue thread must not
    /// block because it is the one that returns contexts.
    fn tx_alloc(&self) -> Result<()> {
        if self.wq.is_current() {
            if !self.txs.try_take() {
                warn!("Unable to allocate TX context");
                return Err(Error::NoBuffers);
            }
        } else {
            self.txs.take();
        }
        Ok(())
    }
}

impl Conn {
    /// Queues an L2CAP frame, including its basic header, for transmission.
    /// The callback, if any, reports when the controller acknowledged it.
    pub fn send(&self, buf: Vec<u8>, cb: Option<TxCallback>) -> Result<()> {
        if self.state() != State::Connected {
            debug!("{self:?} not connected");
            return Err(Error::NotConnected);
        }
        let tx = match cb {
            Some(cb) => {
                self.shared.tx_alloc()?;
                Some(Tx {
                    cb,
                    pending_no_cb: 0,
                })
            }
            None => None,
        };
        {
            let l = self.slot().link.lock();
            // Allocation may have blocked
            if l.state != State::Connected {
                drop(l);
                if tx.is_some() {
                    self.shared.txs.give();
                }
                debug!("{self:?} disconnected while allocating TX context");
                return Err(Error::NotConnected);
            }
            self.slot().tx.lock().queue.push_back(Frame { buf, tx });
        }
        self.shared.signal.raise();
        Ok(())
    }

    /// Processes controller acknowledgment of `n` packets.
    pub(crate) fn num_completed(&self, n: u16) {
        let mut done = false;
        for _ in 0..n {
            let mut t = self.slot().tx.lock();
            if t.pending_no_cb > 0 {
                t.pending_no_cb -= 1;
                drop(t);
                self.shared.credits.give();
                continue;
            }
            let Some(mut tx) = t.pending.pop_front() else {
                error!("{self:?} packets count mismatch");
                break;
            };
            t.pending_no_cb = std::mem::take(&mut tx.pending_no_cb);
            t.complete.push_back((tx, Ok(())));
            drop(t);
            self.shared.credits.give();
            done = true;
        }
        if done {
            self.schedule_notify();
        }
    }

    /// Returns credits for all unacknowledged packets and fails their TX
    /// contexts.
    pub(super) fn process_unack_tx(&self) {
        let mut failed = false;
        {
            let mut t = self.slot().tx.lock();
            loop {
                if t.pending_no_cb > 0 {
                    t.pending_no_cb -= 1;
                    self.shared.credits.give();
                    continue;
                }
                let Some(mut tx) = t.pending.pop_front() else {
                    break;
                };
                t.pending_no_cb = std::mem::take(&mut tx.pending_no_cb);
                t.complete.push_back((tx, Err(Error::NotConnected)));
                self.shared.credits.give();
                failed = true;
            }
        }
        if failed {
            self.schedule_notify();
        }
    }

    /// Delivers completed TX callbacks in acknowledgment order.
    pub(super) fn tx_notify(&self) {
        let _serial = self.slot().notify.lock();
        loop {
            let next = self.slot().tx.lock().complete.pop_front();
            let Some((tx, r)) = next else {
                return;
            };
            trace!("{self:?} TX complete: {r:?}");
            self.shared.txs.give();
            (tx.cb)(self, r);
        }
    }

    /// Fails all queued frames and schedules the final disconnection work.
    /// Called by the TX thread after the connection becomes Disconnected.
    pub(super) fn cleanup(&self) {
        debug!("{self:?} cleanup");
        let failed = {
            let mut t = self.slot().tx.lock();
            let frames = std::mem::take(&mut t.queue);
            let mut failed = false;
            for tx in frames.into_iter().filter_map(|f| f.tx) {
                t.complete.push_back((tx, Err(Error::NotConnected)));
                failed = true;
            }
            debug_assert!(t.pending.is_empty(), "pending TX contexts after disconnect");
            debug_assert_eq!(t.pending_no_cb, 0, "pending packets after disconnect");
            failed
        };
        if failed {
            self.schedule_notify();
        }
        self.slot().link.lock().rx = None;
        self.schedule_deferred(Duration::ZERO);
    }

    /// Sends the next queued frame, if any. Returns `false` if the queue was
    /// empty.
    fn send_next(&self) -> bool {
        let next = self.slot().tx.lock().queue.pop_front();
        let Some(Frame { buf, mut tx }) = next else {
            return false;
        };
        let Some(cn) = self.handle() else {
            self.tx_fail(tx);
            return true;
        };
        let mtu = self.shared.cfg.acl_mtu.max(1);
        let (mut off, mut pb) = (0, Boundary::FirstNonFlushable);
        loop {
            let end = (off + mtu).min(buf.len());
            let last = end == buf.len();
            let frag_tx = if last { tx.take() } else { None };
            if !self.send_frag(cn, pb, &buf[off..end], frag_tx) {
                // Final fragment fails its own context
                self.tx_fail(tx);
                return true;
            }
            if last {
                return true;
            }
            off = end;
            pb = Boundary::Continuing;
        }
    }

    /// Sends one ACL fragment, blocking until a controller buffer is
    /// available.
    fn send_frag(&self, cn: ConnHandle, pb: Boundary, data: &[u8], tx: Option<Tx>) -> bool {
        self.shared.credits.take();
        let undo = {
            // Holding the link lock orders this against process_unack_tx
            let l = self.slot().link.lock();
            if self.shared.stop.load(Ordering::Acquire) || l.state != State::Connected {
                drop(l);
                self.shared.credits.give();
                self.tx_fail(tx);
                return false;
            }
            let mut t = self.slot().tx.lock();
            match tx {
                Some(tx) => {
                    t.pending.push_back(tx);
                    Undo::Pending
                }
                None => match t.pending.back_mut() {
                    Some(tail) => {
                        tail.pending_no_cb += 1;
                        Undo::Tail
                    }
                    None => {
                        t.pending_no_cb += 1;
                        Undo::Conn
                    }
                },
            }
        };
        trace!("{self:?} sending {pb:?} fragment of {} bytes", data.len());
        let Err(e) = self.shared.ctl.acl_data(&hci::acl_packet(cn, pb, data)) else {
            return true;
        };
        error!("{self:?} unable to send to driver: {e}");
        let tx = {
            let l = self.slot().link.lock();
            if l.state != State::Connected {
                // process_unack_tx owns the fragment's credit and context
                debug!("{self:?} disconnected during failed send");
                return false;
            }
            let mut t = self.slot().tx.lock();
            let t = &mut *t;
            let tx = match undo {
                Undo::Pending => t.pending.pop_back(),
                // The tail context may have been acknowledged, moving its
                // count to the connection.
                Undo::Tail | Undo::Conn => {
                    let n = match t.pending.back_mut() {
                        Some(tail) if matches!(undo, Undo::Tail) => &mut tail.pending_no_cb,
                        _ => &mut t.pending_no_cb,
                    };
                    let Some(v) = n.checked_sub(1) else {
                        error!("{self:?} no packet to undo");
                        return false;
                    };
                    *n = v;
                    None
                }
            };
            tx
        };
        self.shared.credits.give();
        self.tx_fail(tx);
        false
    }

    /// Fails a TX context that never reached the controller.
    fn tx_fail(&self, tx: Option<Tx>) {
        if let Some(tx) = tx {
            (self.slot().tx.lock().complete).push_back((tx, Err(Error::NotConnected)));
            self.schedule_notify();
        }
    }

    /// Schedules callback delivery on the work queue.
    fn schedule_notify(&self) {
        let conn = self.clone();
        self.shared.wq.submit(move || conn.tx_notify());
    }
}

/// TX thread main loop.
pub(super) fn run(shared: &Arc<Shared>) {
    debug!("TX thread started");
    while !shared.stop.load(Ordering::Acquire) {
        let mut busy = false;
        for idx in 0..shared.slots.len() {
            let Some(conn) = Conn::try_ref(shared, idx) else {
                continue;
            };
            let cleanup = {
                let mut l = conn.slot().link.lock();
                let c = l.state == State::Disconnected && l.flags.contains(Flags::CLEANUP);
                if c {
                    l.flags.remove(Flags::CLEANUP);
                }
                c
            };
            if cleanup {
                conn.cleanup();
            } else {
                busy |= conn.send_next();
            }
        }
        if !busy {
            shared.signal.wait();
        }
    }
    debug!("TX thread stopped");
}
