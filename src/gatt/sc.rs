//! Service Changed indication batching ([Vol 3] Part G, Section 7.1).

use parking_lot::Mutex;
use tracing::debug;

use crate::att::HandleRange;
use crate::util::DelayedWork;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct Flags: u8 {
        /// Database range changed since the last indication.
        const RANGE_CHANGED = 1 << 0;
        /// Indication is waiting for confirmation.
        const INDICATE_PENDING = 1 << 1;
    }
}

#[derive(Debug, Default)]
struct State {
    flags: Flags,
    range: Option<HandleRange>,
}

/// Accumulates changed handle ranges and serializes their indication. At
/// most one Service Changed indication is outstanding at any time.
#[derive(Debug, Default)]
pub(crate) struct ServiceChanged {
    st: Mutex<State>,
    pub work: DelayedWork,
}

/// Action requested by the batching logic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Action {
    /// Nothing to do.
    None,
    /// (Re)schedule processing after the debounce delay.
    Schedule,
    /// Schedule processing immediately.
    Now,
}

impl ServiceChanged {
    /// Adds a changed range.
    pub fn changed(&self, r: HandleRange) -> Action {
        let mut st = self.st.lock();
        if st.flags.contains(Flags::RANGE_CHANGED) {
            let cur = st.range.unwrap_or(r);
            let merged = cur.merge(r);
            if merged == cur {
                return Action::None;
            }
            st.range = Some(merged);
        } else {
            st.flags.insert(Flags::RANGE_CHANGED);
            st.range = Some(r);
        }
        if st.flags.contains(Flags::INDICATE_PENDING) {
            debug!("Service Changed indication pending, deferring {r}");
            return Action::None;
        }
        Action::Schedule
    }

    /// Takes the accumulated range for indication.
    pub fn take(&self) -> Option<HandleRange> {
        let mut st = self.st.lock();
        if st.flags.contains(Flags::INDICATE_PENDING) {
            return None;
        }
        st.flags.remove(Flags::RANGE_CHANGED);
        st.range.take()
    }

    /// Records whether the indication reached at least one peer.
    pub fn sent(&self, pending: bool) {
        self.st.lock().flags.set(Flags::INDICATE_PENDING, pending);
    }

    /// Handles indication completion.
    pub fn confirmed(&self) -> Action {
        let mut st = self.st.lock();
        st.flags.remove(Flags::INDICATE_PENDING);
        if st.flags.contains(Flags::RANGE_CHANGED) {
            Action::Now
        } else {
            Action::None
        }
    }

    /// Returns whether an indication is waiting for confirmation.
    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.st.lock().flags.contains(Flags::INDICATE_PENDING)
    }
}
