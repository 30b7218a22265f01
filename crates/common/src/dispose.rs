use monad::Cont;
use std::cell::RefCell;
use std::rc::Rc;

/// Action which runs at most once.
pub struct FuncDisp {
    action: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl FuncDisp {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        FuncDisp {
            action: RefCell::new(Some(Box::new(action))),
        }
    }

    pub fn disposed(&self) -> bool {
        self.action.borrow().is_none()
    }

    /// Run the action. Returns whether this call performed the disposal.
    pub fn dispose(&self) -> bool {
        match self.action.borrow_mut().take() {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }
}

impl Drop for FuncDisp {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Composite disposer: an ordered set of release actions run in LIFO
/// order, shared by clone. Every acquired descriptor, pipe, child
/// process or hub registration hangs its release off one of these.
pub struct CompDisp {
    actions: Rc<RefCell<Option<Vec<Box<dyn FnOnce()>>>>>,
}

impl Clone for CompDisp {
    fn clone(&self) -> Self {
        CompDisp {
            actions: self.actions.clone(),
        }
    }
}

impl Default for CompDisp {
    fn default() -> Self {
        Self::new()
    }
}

impl CompDisp {
    pub fn new() -> Self {
        CompDisp {
            actions: Rc::new(RefCell::new(Some(Vec::new()))),
        }
    }

    /// Register a release action. If the composite is already disposed
    /// the action runs immediately and `false` is returned.
    pub fn add_action(&self, action: impl FnOnce() + 'static) -> bool {
        let mut actions = self.actions.borrow_mut();
        match actions.as_mut() {
            Some(actions) => {
                actions.push(Box::new(action));
                true
            }
            None => {
                drop(actions);
                action();
                false
            }
        }
    }

    pub fn disposed(&self) -> bool {
        self.actions.borrow().is_none()
    }

    pub fn len(&self) -> usize {
        self.actions.borrow().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything in LIFO order. Returns whether this call
    /// performed the disposal.
    pub fn dispose(&self) -> bool {
        let actions = self.actions.borrow_mut().take();
        match actions {
            Some(actions) => {
                for action in actions.into_iter().rev() {
                    action();
                }
                true
            }
            None => false,
        }
    }

    /// Monad form: resolves once the composite has been disposed.
    pub fn monad(&self) -> Cont<()> {
        let this = self.clone();
        Cont::new(move |ret| {
            this.add_action(move || {
                ret.value(());
            });
            Ok(())
        })
    }
}
