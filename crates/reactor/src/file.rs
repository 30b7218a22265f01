use crate::poll::{Mask, Poller, POLL_DISCONNECT, POLL_ERROR};
use monad::{Error, Result, Ret};
use std::os::fd::RawFd;

/// Per-descriptor interest state: the combined registered mask and the
/// list of (interest, ret) entries waiting on it.
pub(crate) struct FileQueue {
    fd: RawFd,
    mask: Mask,
    handlers: Vec<(Mask, Ret<Mask>)>,
}

impl FileQueue {
    pub fn new(fd: RawFd) -> Self {
        FileQueue {
            fd,
            mask: 0,
            handlers: Vec::new(),
        }
    }

    pub fn mask(&self) -> Mask {
        self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register interest. Requesting an empty mask, or one which
    /// intersects an already-pending interest, is an invariant
    /// violation.
    pub fn add(&mut self, mask: Mask, ret: Ret<Mask>, poller: &mut dyn Poller) -> Result<()> {
        if mask == 0 {
            return Err(Error::value("empty interest mask"));
        }
        if self.mask & mask != 0 {
            return Err(Error::value(format!(
                "interest mask {mask:#x} intersects pending {:#x} on fd {}",
                self.mask, self.fd
            )));
        }
        if self.mask != 0 {
            poller.modify(self.fd, self.mask | mask)?;
        } else {
            poller.register(self.fd, mask)?;
        }
        self.mask |= mask;
        self.handlers.push((mask, ret));
        Ok(())
    }

    /// Disable every entry whose interest intersects `mask`, updating
    /// the poller registration. Returns the disabled rets for the
    /// caller to resolve outside any borrow.
    pub fn off(&mut self, mask: Mask, poller: &mut dyn Poller) -> Vec<Ret<Mask>> {
        if mask & self.mask == 0 {
            return Vec::new();
        }

        let mut disabled = Vec::new();
        let mut enabled = Vec::new();
        for (interest, ret) in self.handlers.drain(..) {
            if interest & mask != 0 {
                self.mask &= !interest;
                disabled.push(ret);
            } else {
                enabled.push((interest, ret));
            }
        }
        self.handlers = enabled;

        let update = if self.mask != 0 {
            poller.modify(self.fd, self.mask)
        } else {
            poller.unregister(self.fd)
        };
        if let Err(error) = update {
            tracing::warn!(fd = self.fd, %error, "poller update failed");
        }
        disabled
    }

    /// Compute resolutions for delivered readiness bits. Error-only
    /// deliveries tear the whole descriptor down.
    pub fn dispatch(
        &mut self,
        events: Mask,
        poller: &mut dyn Poller,
    ) -> Vec<(Ret<Mask>, Result<Mask>)> {
        if events & !POLL_ERROR != 0 {
            self.off(events, poller)
                .into_iter()
                .map(|ret| (ret, Ok(events)))
                .collect()
        } else {
            let error = if events & POLL_DISCONNECT != 0 {
                Error::broken_pipe(format!("hang-up on fd {}", self.fd))
            } else {
                Error::connection(format!("error condition on fd {}", self.fd))
            };
            self.close(error, poller)
        }
    }

    /// Resolve every pending entry with `error` and clear the poller
    /// registration.
    pub fn close(
        &mut self,
        error: Error,
        poller: &mut dyn Poller,
    ) -> Vec<(Ret<Mask>, Result<Mask>)> {
        self.off(self.mask, poller)
            .into_iter()
            .map(|ret| (ret, Err(error.clone())))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::poll::{POLL_READ, POLL_WRITE};
    use monad::Cont;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn noop_poller() -> Box<dyn Poller> {
        struct Noop;
        impl Poller for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn register(&mut self, _: RawFd, _: Mask) -> Result<()> {
                Ok(())
            }
            fn modify(&mut self, _: RawFd, _: Mask) -> Result<()> {
                Ok(())
            }
            fn unregister(&mut self, _: RawFd) -> Result<()> {
                Ok(())
            }
            fn poll(&mut self, _: Duration, _: &mut Vec<(RawFd, Mask)>) -> Result<()> {
                Ok(())
            }
        }
        Box::new(Noop)
    }

    fn waiter(queue: &Rc<RefCell<FileQueue>>, poller: &Rc<RefCell<Box<dyn Poller>>>, mask: Mask) -> Rc<RefCell<Option<Result<Mask>>>> {
        let out = Rc::new(RefCell::new(None));
        let slot = out.clone();
        let queue = queue.clone();
        let poller = poller.clone();
        Cont::new(move |ret| {
            queue
                .borrow_mut()
                .add(mask, ret, poller.borrow_mut().as_mut())
        })
        .run(move |result| *slot.borrow_mut() = Some(result));
        out
    }

    #[test]
    fn test_empty_and_overlapping_masks_fail() {
        let queue = Rc::new(RefCell::new(FileQueue::new(3)));
        let poller = Rc::new(RefCell::new(noop_poller()));

        let empty = waiter(&queue, &poller, 0);
        assert_eq!(
            empty.borrow().as_ref().unwrap().as_ref().unwrap_err().kind(),
            monad::ErrorKind::Value
        );

        let read = waiter(&queue, &poller, POLL_READ);
        assert!(read.borrow().is_none());

        let overlap = waiter(&queue, &poller, POLL_READ | POLL_WRITE);
        assert_eq!(
            overlap.borrow().as_ref().unwrap().as_ref().unwrap_err().kind(),
            monad::ErrorKind::Value
        );
    }

    #[test]
    fn test_readiness_resolves_matching_entries_only() {
        let queue = Rc::new(RefCell::new(FileQueue::new(3)));
        let poller = Rc::new(RefCell::new(noop_poller()));

        let read = waiter(&queue, &poller, POLL_READ);
        let write = waiter(&queue, &poller, POLL_WRITE);

        let resolved = queue
            .borrow_mut()
            .dispatch(POLL_READ, poller.borrow_mut().as_mut());
        for (ret, result) in resolved {
            ret.resolve(result);
        }
        assert_eq!(*read.borrow(), Some(Ok(POLL_READ)));
        assert!(write.borrow().is_none());
        assert_eq!(queue.borrow().mask(), POLL_WRITE);
    }

    #[test]
    fn test_hangup_breaks_all_entries() {
        let queue = Rc::new(RefCell::new(FileQueue::new(3)));
        let poller = Rc::new(RefCell::new(noop_poller()));

        let read = waiter(&queue, &poller, POLL_READ);
        let write = waiter(&queue, &poller, POLL_WRITE);

        let resolved = queue
            .borrow_mut()
            .dispatch(POLL_DISCONNECT, poller.borrow_mut().as_mut());
        for (ret, result) in resolved {
            ret.resolve(result);
        }
        for out in [read, write] {
            let out = out.borrow();
            let error = out.as_ref().unwrap().as_ref().unwrap_err();
            assert!(error.is_broken_pipe());
        }
        assert!(queue.borrow().is_empty());
    }
}
