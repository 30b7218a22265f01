//! Bridge between continuations and Rust's native async blocks.
//!
//! `cont(async { .. })` turns an async block into a `Cont`, and `Cont`
//! implements `IntoFuture` so continuations can be awaited inside such
//! blocks. Together they are the framework's do-notation: an await
//! yields the inner value of the awaited result, and `?` propagates the
//! embedded error.

use crate::cont::RetFn;
use crate::trampoline;
use crate::{Cont, Result};
use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

struct Task<T> {
    future: Option<Pin<Box<dyn Future<Output = Result<T>>>>>,
    ret: Option<RetFn<T>>,
}

/// Continuation from an async block. The block is polled by a
/// single-task stepper whose waker re-enqueues the step on the thread
/// trampoline.
pub fn cont<T: 'static>(future: impl Future<Output = Result<T>> + 'static) -> Cont<T> {
    Cont::from_runner(Box::new(move |ret| {
        let task = Rc::new(RefCell::new(Task {
            future: Some(Box::pin(future)),
            ret: Some(ret),
        }));
        step(task);
    }))
}

fn step<T: 'static>(task: Rc<RefCell<Task<T>>>) {
    let waker = {
        let step_task = task.clone();
        waker(move || {
            let task = step_task.clone();
            trampoline::bounce(Box::new(move || step(task)));
        })
    };
    let mut cx = Context::from_waker(&waker);

    let polled = {
        // A wake landing while this task is already being polled lower
        // on the stack has nothing to do; the active poll observes
        // whatever state that wake signalled.
        let Ok(mut task) = task.try_borrow_mut() else {
            return;
        };
        match task.future.as_mut() {
            Some(future) => future.as_mut().poll(&mut cx),
            None => return, // already finished; spurious wake
        }
    };

    if let Poll::Ready(result) = polled {
        let ret = {
            let mut task = task.borrow_mut();
            task.future = None;
            task.ret.take()
        };
        if let Some(ret) = ret {
            ret(result);
        }
    }
}

// The waker wraps an `Rc`-counted hook. The `Waker` contract asks for
// Send + Sync, but every wake in this framework originates from a
// continuation resolved on the owning thread: the reactor is
// single-threaded and cross-thread completions are marshalled through
// its schedule queue before any `ret` runs. The raw vtable below
// therefore only ever executes on the thread that created it.
struct Wake {
    hook: Box<dyn Fn()>,
}

fn waker(hook: impl Fn() + 'static) -> Waker {
    let data = Rc::into_raw(Rc::new(Wake {
        hook: Box::new(hook),
    })) as *const ();
    // Safety: `data` came from `Rc::into_raw` above and the vtable
    // functions round-trip it with matched from_raw/into_raw pairs.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    let rc = Rc::from_raw(data as *const Wake);
    let cloned = rc.clone();
    let _ = Rc::into_raw(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let rc = Rc::from_raw(data as *const Wake);
    (rc.hook)();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let rc = Rc::from_raw(data as *const Wake);
    (rc.hook)();
    let _ = Rc::into_raw(rc);
}

unsafe fn drop_raw(data: *const ()) {
    drop(Rc::from_raw(data as *const Wake));
}

/// Future adapter which starts the continuation on first poll.
pub struct ContFuture<T> {
    cont: Option<Cont<T>>,
    shared: Rc<RefCell<AwaitState<T>>>,
}

struct AwaitState<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
}

impl<T: 'static> IntoFuture for Cont<T> {
    type Output = Result<T>;
    type IntoFuture = ContFuture<T>;

    fn into_future(self) -> ContFuture<T> {
        ContFuture {
            cont: Some(self),
            shared: Rc::new(RefCell::new(AwaitState {
                result: None,
                waker: None,
            })),
        }
    }
}

impl<T> Unpin for ContFuture<T> {}

impl<T: 'static> Future for ContFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let me = self.get_mut();
        if let Some(cont) = me.cont.take() {
            let shared = me.shared.clone();
            cont.run(move |result| {
                let waker = {
                    let mut state = shared.borrow_mut();
                    state.result = Some(result);
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
        }
        let mut state = me.shared.borrow_mut();
        match state.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Error, Ret};
    use std::rc::Rc;

    fn sample<T: 'static>(cont: Cont<T>) -> Rc<RefCell<Option<Result<T>>>> {
        let out = Rc::new(RefCell::new(None));
        let slot = out.clone();
        cont.run(move |result| *slot.borrow_mut() = Some(result));
        out
    }

    #[test]
    fn test_async_block_awaits_continuations() {
        let out = sample(cont(async {
            let a = Cont::unit(20).await?;
            let b = Cont::unit(22).await?;
            Ok(a + b)
        }));
        assert_eq!(*out.borrow(), Some(Ok(42)));
    }

    #[test]
    fn test_error_at_await_site_propagates() {
        let out = sample(cont(async {
            let v: i64 = Cont::error(Error::user("boom")).await?;
            Ok(v + 1)
        }));
        assert_eq!(*out.borrow(), Some(Err(Error::user("boom"))));
    }

    #[test]
    fn test_error_can_be_handled_at_await_site() {
        let out = sample(cont(async {
            match Cont::<i64>::error(Error::broken_pipe("closed")).await {
                Ok(v) => Ok(v),
                Err(error) if error.is_broken_pipe() => Ok(-1),
                Err(error) => Err(error),
            }
        }));
        assert_eq!(*out.borrow(), Some(Ok(-1)));
    }

    #[test]
    fn test_deferred_resolution_wakes_the_block() {
        let pending: Rc<RefCell<Option<Ret<i64>>>> = Rc::new(RefCell::new(None));
        let hold = pending.clone();
        let waited = Cont::new(move |ret| {
            *hold.borrow_mut() = Some(ret);
            Ok(())
        });
        let out = sample(cont(async move { Ok(waited.await? * 2) }));
        assert_eq!(*out.borrow(), None);
        pending.borrow_mut().take().unwrap().value(8);
        assert_eq!(*out.borrow(), Some(Ok(16)));
    }

    #[test]
    fn test_tail_return_of_a_continuation() {
        let out = sample(cont(async { Cont::unit("tail").await }));
        assert_eq!(*out.borrow(), Some(Ok("tail")));
    }
}
