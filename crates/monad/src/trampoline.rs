//! Thread-local trampoline which turns synchronous continuation chains
//! into an iterative drain loop, so arbitrarily deep `and_then` chains
//! resolve without growing the stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

thread_local! {
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

// A panicking thunk is a programming error, but the flag must not
// stay stuck or the thread would never drain again.
struct Restore(bool);

impl Drop for Restore {
    fn drop(&mut self) {
        DRAINING.with(|draining| draining.set(self.0));
    }
}

/// Enqueue `thunk`. If no drain is active on this thread, drain the
/// queue to completion (including anything the thunks themselves
/// enqueue); otherwise the active drain will pick it up.
pub fn bounce(thunk: Box<dyn FnOnce()>) {
    QUEUE.with(|queue| queue.borrow_mut().push_back(thunk));
    if DRAINING.with(Cell::get) {
        return;
    }
    let _restore = Restore(DRAINING.with(|draining| draining.replace(true)));
    run_queue();
}

/// Drain pending thunks now, even from inside an active drain.
///
/// An inline reactor driver (`run_until`) may execute nested within a
/// continuation callback; resolutions it triggers would otherwise sit
/// queued behind the suspended outer drain and never run.
pub fn drain() {
    let _restore = Restore(DRAINING.with(|draining| draining.replace(true)));
    run_queue();
}

fn run_queue() {
    loop {
        let next = QUEUE.with(|queue| queue.borrow_mut().pop_front());
        match next {
            Some(thunk) => thunk(),
            None => break,
        }
    }
}
