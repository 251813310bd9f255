//! Cancellable tokens for scheduled work.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::SendTask;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// A cancellable reference to a pending timer or I/O watcher.
///
/// Cloning shares the same underlying state. `cancel` may be called from
/// any thread and is idempotent; cancelling after the callback fired is
/// a no-op, and a cancelled handle never invokes its callback.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU8,
    on_cancel: Mutex<Option<SendTask>>,
}

impl Handle {
    pub(crate) fn new(on_cancel: Option<SendTask>) -> Handle {
        Handle {
            inner: Arc::new(Inner {
                state: AtomicU8::new(PENDING),
                on_cancel: Mutex::new(on_cancel),
            }),
        }
    }

    /// Cancels the pending action. Loses the race silently if the
    /// action fired first.
    pub fn cancel(&self) {
        if self
            .inner
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let hook = self.inner.on_cancel.lock().expect("handle lock").take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Marks the handle cancelled without running the cancel hook; used
    /// by the scheduler when it removes the entry itself.
    pub(crate) fn cancel_silent(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transitions pending → fired. Returns false when the handle was
    /// already cancelled or fired; callers must then drop the callback.
    pub(crate) fn try_fire(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FIRED
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("Handle").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = hits.clone();
        let handle = Handle::new(Some(Box::new(move || {
            hook_hits.fetch_add(1, Ordering::SeqCst);
        })));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_wins_over_later_cancel() {
        let handle = Handle::new(None);
        assert!(handle.try_fire());
        handle.cancel();
        assert!(handle.has_fired());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn cancelled_handle_never_fires() {
        let handle = Handle::new(None);
        handle.cancel();
        assert!(!handle.try_fire());
    }
}
