//! Generation-counted wakeup condition.

use std::sync::Mutex;

use super::scheduler::SchedulerHandle;
use super::SendTask;

/// A cross-thread condition with a monotonically increasing generation.
///
/// Waiters register a task together with the generation they observed;
/// each `wakeup` advances the generation and releases every waiter whose
/// observed generation is now in the past. Tasks are posted to the
/// scheduler the waiter registered on, never run inline.
#[derive(Default)]
pub struct Wakeup {
    inner: Mutex<WakeupInner>,
}

#[derive(Default)]
struct WakeupInner {
    generation: u64,
    waiters: Vec<Waiter>,
}

struct Waiter {
    observed: u64,
    task: SendTask,
    target: SchedulerHandle,
}

impl Wakeup {
    pub fn new() -> Wakeup {
        Wakeup::default()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("wakeup lock").generation
    }

    /// Advances the generation and releases all satisfied waiters.
    pub fn wakeup(&self) {
        let released = {
            let mut inner = self.inner.lock().expect("wakeup lock");
            inner.generation += 1;
            let gen = inner.generation;
            let mut released = Vec::new();
            let mut i = 0;
            while i < inner.waiters.len() {
                if inner.waiters[i].observed < gen {
                    released.push(inner.waiters.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            released
        };
        for waiter in released {
            waiter.target.execute_boxed(waiter.task);
        }
    }

    /// Fires `task` on `target` once the generation advances past
    /// `observed`; immediately if it already has.
    pub(crate) fn wait(&self, observed: u64, task: SendTask, target: SchedulerHandle) {
        {
            let mut inner = self.inner.lock().expect("wakeup lock");
            if inner.generation <= observed {
                inner.waiters.push(Waiter {
                    observed,
                    task,
                    target,
                });
                return;
            }
        }
        target.execute_boxed(task);
    }
}
