use crate::trampoline;
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub(crate) type RetFn<T> = Box<dyn FnOnce(Result<T>)>;

/// Continuation monad.
///
/// A `Cont<T>` owns a runner which, once started with `run`, eventually
/// invokes its return function at most once with a `Result<T>`. All
/// starts and resolutions bounce through the thread trampoline, so long
/// synchronously-resolving chains never grow the stack.
///
/// Continuations are single-shot and not individually cancellable;
/// cooperative cancellation is `work.or(signal)`.
pub struct Cont<T> {
    runner: Box<dyn FnOnce(RetFn<T>)>,
}

/// Call-once resolution handle handed to `Cont::new` blocks and stored
/// by reactor queues. Cloning shares the same underlying slot: the
/// first `resolve` wins and later ones report `false`.
pub struct Ret<T> {
    slot: Rc<Cell<Option<RetFn<T>>>>,
}

impl<T> Clone for Ret<T> {
    fn clone(&self) -> Self {
        Ret {
            slot: self.slot.clone(),
        }
    }
}

impl<T: 'static> Ret<T> {
    fn wrap(ret: RetFn<T>) -> Self {
        Ret {
            slot: Rc::new(Cell::new(Some(ret))),
        }
    }

    /// Stand-alone resolution handle around a callback.
    pub fn new(ret: impl FnOnce(Result<T>) + 'static) -> Self {
        Self::wrap(Box::new(ret))
    }

    /// Resolve the continuation. Returns whether this call won the slot.
    pub fn resolve(&self, result: Result<T>) -> bool {
        match self.slot.take() {
            Some(ret) => {
                ret(result);
                true
            }
            None => false,
        }
    }

    pub fn value(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn error(&self, error: Error) -> bool {
        self.resolve(Err(error))
    }

    pub fn resolved(&self) -> bool {
        // Peek without consuming.
        let ret = self.slot.take();
        let resolved = ret.is_none();
        self.slot.set(ret);
        resolved
    }
}

impl<T: 'static> Cont<T> {
    /// Continuation from a block which receives the resolution handle.
    /// An error returned by the block resolves the continuation unless
    /// the block already resolved it itself.
    pub fn new(block: impl FnOnce(Ret<T>) -> Result<()> + 'static) -> Self {
        Cont::from_runner(Box::new(move |ret| {
            let ret = Ret::wrap(ret);
            if let Err(error) = block(ret.clone()) {
                ret.resolve(Err(error));
            }
        }))
    }

    pub(crate) fn from_runner(runner: Box<dyn FnOnce(RetFn<T>)>) -> Self {
        Cont { runner }
    }

    /// unit: always resolves with `Ok(value)`.
    pub fn unit(value: T) -> Self {
        Cont::from_result(Ok(value))
    }

    pub fn error(error: Error) -> Self {
        Cont::from_result(Err(error))
    }

    pub fn from_result(result: Result<T>) -> Self {
        Cont::from_runner(Box::new(move |ret| ret(result)))
    }

    /// Start the continuation. `ret` is invoked at most once.
    pub fn run(self, ret: impl FnOnce(Result<T>) + 'static) {
        let runner = self.runner;
        trampoline::bounce(Box::new(move || runner(Box::new(ret))));
    }

    /// Start and discard the result, logging errors other than
    /// cancellation. For fire-and-forget coroutines.
    pub fn run_detached(self) {
        self.run(|result| {
            if let Err(error) = result {
                if !error.is_canceled() {
                    tracing::error!(%error, trace = error.trace(), "detached continuation failed");
                }
            }
        });
    }

    /// bind: on `Ok(v)` continue with `next(v)`, on `Err` short-circuit.
    pub fn and_then<U: 'static>(self, next: impl FnOnce(T) -> Cont<U> + 'static) -> Cont<U> {
        Cont::from_runner(Box::new(move |ret| {
            self.run(move |result| match result {
                Ok(value) => next(value).run(move |result| ret(result)),
                Err(error) => ret(Err(error)),
            })
        }))
    }

    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Cont<U> {
        self.and_then(move |value| Cont::unit(f(value)))
    }

    pub fn map_err(self, f: impl FnOnce(Error) -> Error + 'static) -> Cont<T> {
        Cont::from_runner(Box::new(move |ret| {
            self.run(move |result| ret(result.map_err(f)))
        }))
    }

    /// then: sequence, discarding this continuation's value.
    pub fn then<U: 'static>(self, next: Cont<U>) -> Cont<U> {
        self.and_then(move |_| next)
    }

    /// First-wins race. The winner resolves exactly once; the loser's
    /// later completion is discarded.
    pub fn or(self, other: Cont<T>) -> Cont<T> {
        Cont::from_runner(Box::new(move |ret| {
            let ret = Ret::wrap(ret);
            let other_ret = ret.clone();
            self.run(move |result| {
                ret.resolve(result);
            });
            other.run(move |result| {
                other_ret.resolve(result);
            });
        }))
    }

    /// All-wait aggregation. Completes when every child has completed;
    /// result slots keep input order; the first error in slot order
    /// becomes the aggregate error.
    pub fn all(conts: Vec<Cont<T>>) -> Cont<Vec<T>> {
        Cont::from_runner(Box::new(move |ret| {
            if conts.is_empty() {
                return ret(Ok(Vec::new()));
            }
            let count = conts.len();
            let slots: Rc<RefCell<Vec<Option<Result<T>>>>> =
                Rc::new(RefCell::new((0..count).map(|_| None).collect()));
            let pending = Rc::new(Cell::new(count));
            let ret = Rc::new(Cell::new(Some(ret)));

            for (index, cont) in conts.into_iter().enumerate() {
                let slots = slots.clone();
                let pending = pending.clone();
                let ret = ret.clone();
                cont.run(move |result| {
                    slots.borrow_mut()[index] = Some(result);
                    pending.set(pending.get() - 1);
                    if pending.get() != 0 {
                        return;
                    }
                    let mut values = Vec::with_capacity(count);
                    let mut failed = None;
                    for slot in slots.borrow_mut().drain(..) {
                        match slot.expect("every slot is filled") {
                            Ok(value) => values.push(value),
                            Err(error) => {
                                failed.get_or_insert(error);
                            }
                        }
                    }
                    if let Some(ret) = ret.take() {
                        ret(match failed {
                            Some(error) => Err(error),
                            None => Ok(values),
                        });
                    }
                });
            }
        }))
    }

    /// A continuation which never resolves. Useful as a race loser and
    /// in tests.
    pub fn never() -> Self {
        Cont::from_runner(Box::new(|ret| {
            // Hold the return function forever.
            std::mem::forget(ret);
        }))
    }
}

impl<T: Clone + 'static> Cont<T> {
    /// Start the continuation, caching its eventual result.
    pub fn promise(self) -> crate::Promise<T> {
        crate::Promise::start(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sample<T: 'static>(cont: Cont<T>) -> Rc<RefCell<Option<Result<T>>>> {
        let out = Rc::new(RefCell::new(None));
        let slot = out.clone();
        cont.run(move |result| *slot.borrow_mut() = Some(result));
        out
    }

    #[test]
    fn test_unit_bind_left_identity() {
        let f = |v: i64| Cont::unit(v * 2);
        let lhs = sample(Cont::unit(21).and_then(f));
        let rhs = sample(f(21));
        assert_eq!(*lhs.borrow(), *rhs.borrow());
        assert_eq!(*lhs.borrow(), Some(Ok(42)));
    }

    #[test]
    fn test_bind_right_identity() {
        let out = sample(Cont::unit(7).and_then(Cont::unit));
        assert_eq!(*out.borrow(), Some(Ok(7)));
    }

    #[test]
    fn test_bind_associativity() {
        let f = |v: i64| Cont::unit(v + 1);
        let g = |v: i64| Cont::unit(v * 3);
        let lhs = sample(Cont::unit(5).and_then(f).and_then(g));
        let rhs = sample(Cont::unit(5).and_then(move |v| f(v).and_then(g)));
        assert_eq!(*lhs.borrow(), *rhs.borrow());
        assert_eq!(*lhs.borrow(), Some(Ok(18)));
    }

    #[test]
    fn test_bind_short_circuits_on_error() {
        let touched = Rc::new(Cell::new(false));
        let t = touched.clone();
        let out = sample(Cont::<i64>::error(Error::value("nope")).and_then(move |v| {
            t.set(true);
            Cont::unit(v)
        }));
        assert_eq!(*out.borrow(), Some(Err(Error::value("nope"))));
        assert!(!touched.get());
    }

    #[test]
    fn test_or_first_wins_and_loser_is_discarded() {
        let slow: Rc<RefCell<Option<Ret<i64>>>> = Rc::new(RefCell::new(None));
        let parked = slow.clone();
        let late = Cont::new(move |ret| {
            *parked.borrow_mut() = Some(ret);
            Ok(())
        });
        let out = sample(Cont::unit(1).or(late));
        assert_eq!(*out.borrow(), Some(Ok(1)));

        // The loser completing afterwards is a no-op.
        let ret = slow.borrow_mut().take().unwrap();
        assert!(!ret.value(2));
        assert_eq!(*out.borrow(), Some(Ok(1)));
    }

    #[test]
    fn test_or_against_never_behaves_as_self() {
        let out = sample(Cont::unit(9).or(Cont::never()));
        assert_eq!(*out.borrow(), Some(Ok(9)));
        let out = sample(Cont::<i64>::error(Error::user("boom")).or(Cont::never()));
        assert_eq!(*out.borrow(), Some(Err(Error::user("boom"))));
    }

    #[test]
    fn test_all_empty_and_order() {
        let out = sample(Cont::<i64>::all(Vec::new()));
        assert_eq!(*out.borrow(), Some(Ok(Vec::new())));

        // Resolve out of order; slots keep input order.
        let first: Rc<RefCell<Option<Ret<i64>>>> = Rc::new(RefCell::new(None));
        let hold = first.clone();
        let held = Cont::new(move |ret| {
            *hold.borrow_mut() = Some(ret);
            Ok(())
        });
        let out = sample(Cont::all(vec![held, Cont::unit(2), Cont::unit(3)]));
        assert_eq!(*out.borrow(), None);
        first.borrow_mut().take().unwrap().value(1);
        assert_eq!(*out.borrow(), Some(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn test_all_reports_first_error_in_slot_order() {
        let out = sample(Cont::all(vec![
            Cont::unit(1),
            Cont::error(Error::value("first")),
            Cont::error(Error::value("second")),
        ]));
        assert_eq!(*out.borrow(), Some(Err(Error::value("first"))));
    }

    #[test]
    fn test_new_block_error_resolves() {
        let out = sample(Cont::<i64>::new(|_ret| Err(Error::key("missing"))));
        assert_eq!(*out.borrow(), Some(Err(Error::key("missing"))));
    }

    #[test]
    fn test_new_block_error_after_resolution_is_ignored() {
        let out = sample(Cont::new(|ret| {
            ret.value(5);
            Err(Error::user("too late"))
        }));
        assert_eq!(*out.borrow(), Some(Ok(5)));
    }

    #[test]
    fn test_deep_bind_chain_is_stack_safe() {
        let mut cont = Cont::unit(0u64);
        for _ in 0..100_000 {
            cont = cont.and_then(|v| Cont::unit(v + 1));
        }
        let out = sample(cont);
        assert_eq!(*out.borrow(), Some(Ok(100_000)));
    }
}
