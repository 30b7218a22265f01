use crate::cont::RetFn;
use crate::{Cont, Result};
use std::cell::RefCell;
use std::rc::Rc;

enum State<T> {
    Pending(Vec<RetFn<T>>),
    Done(Result<T>),
}

/// A started continuation with a cached result.
///
/// Later bindings either receive the cached result immediately or queue
/// for completion. The resolution path is a `FnOnce`, so a second
/// completion cannot be expressed at all.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Start `cont` and cache its eventual result.
    pub fn start(cont: Cont<T>) -> Self {
        let state = Rc::new(RefCell::new(State::Pending(Vec::new())));
        let resolved = state.clone();
        cont.run(move |result| {
            let waiters = {
                let mut state = resolved.borrow_mut();
                match std::mem::replace(&mut *state, State::Done(result.clone())) {
                    State::Pending(waiters) => waiters,
                    State::Done(_) => unreachable!("promise runner is FnOnce"),
                }
            };
            for ret in waiters {
                ret(result.clone());
            }
        });
        Promise { state }
    }

    /// An unresolved promise plus the handle that resolves it. For
    /// completion sources which are not continuation-shaped.
    pub fn pending() -> (Promise<T>, crate::Ret<T>) {
        let state = Rc::new(RefCell::new(State::Pending(Vec::new())));
        let resolved = state.clone();
        let ret = crate::Ret::new(move |result: Result<T>| {
            let waiters = {
                let mut state = resolved.borrow_mut();
                match std::mem::replace(&mut *state, State::Done(result.clone())) {
                    State::Pending(waiters) => waiters,
                    State::Done(_) => unreachable!("pending ret resolves once"),
                }
            };
            for ret in waiters {
                ret(result.clone());
            }
        });
        (Promise { state }, ret)
    }

    pub fn completed(&self) -> bool {
        matches!(&*self.state.borrow(), State::Done(_))
    }

    /// The cached result, if completed.
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.state.borrow() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Monad form: resolves with the cached result, now or later.
    pub fn cont(&self) -> Cont<T> {
        let state = self.state.clone();
        Cont::from_runner(Box::new(move |ret| {
            let mut ret = Some(ret);
            let cached = {
                let mut state = state.borrow_mut();
                match &mut *state {
                    State::Done(result) => Some(result.clone()),
                    State::Pending(waiters) => {
                        waiters.push(ret.take().expect("ret is present"));
                        None
                    }
                }
            };
            if let Some(result) = cached {
                (ret.expect("ret was not queued"))(result);
            }
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Error, Ret};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_result_is_cached_for_late_bindings() {
        let promise = Cont::unit(3).promise();
        assert!(promise.completed());
        assert_eq!(promise.result(), Some(Ok(3)));

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        promise
            .cont()
            .run(move |result| *slot.borrow_mut() = Some(result));
        assert_eq!(*seen.borrow(), Some(Ok(3)));
    }

    #[test]
    fn test_waiters_queue_until_completion() {
        let pending: Rc<RefCell<Option<Ret<i64>>>> = Rc::new(RefCell::new(None));
        let hold = pending.clone();
        let promise = Cont::new(move |ret| {
            *hold.borrow_mut() = Some(ret);
            Ok(())
        })
        .promise();
        assert!(!promise.completed());

        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let slot = seen.clone();
            promise
                .cont()
                .run(move |result| slot.borrow_mut().push(result));
        }
        assert!(seen.borrow().is_empty());

        pending.borrow_mut().take().unwrap().value(11);
        assert_eq!(*seen.borrow(), vec![Ok(11), Ok(11)]);
        assert_eq!(promise.result(), Some(Ok(11)));
    }

    #[test]
    fn test_error_results_are_shared() {
        let promise = Cont::<i64>::error(Error::canceled("gone")).promise();
        assert_eq!(promise.result(), Some(Err(Error::canceled("gone"))));
    }
}
