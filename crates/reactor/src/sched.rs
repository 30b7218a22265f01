use monad::Result;
use std::sync::Mutex;

pub(crate) type SchedFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Run-on-next-tick queue. The only reactor queue other threads may
/// touch: enqueueing is guarded by a mutex, and callers follow up with
/// a wake-pipe write so the blocking poll returns.
pub(crate) struct SchedQueue {
    rets: Mutex<Vec<SchedFn>>,
}

impl SchedQueue {
    pub fn new() -> Self {
        SchedQueue {
            rets: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, ret: SchedFn) {
        self.rets.lock().expect("sched queue lock").push(ret);
    }

    /// Swap out the pending entries. The caller invokes them without
    /// holding the lock, so entries enqueued during dispatch land on
    /// the next tick's snapshot.
    pub fn drain(&self) -> Vec<SchedFn> {
        std::mem::take(&mut *self.rets.lock().expect("sched queue lock"))
    }

    pub fn has_pending(&self) -> bool {
        !self.rets.lock().expect("sched queue lock").is_empty()
    }

    pub fn len(&self) -> usize {
        self.rets.lock().expect("sched queue lock").len()
    }
}
