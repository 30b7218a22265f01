use bytes::Bytes;
use monad::{Cont, Error, Result};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Base asynchronous byte stream.
///
/// `read` resolves with 1..=max bytes or a broken-pipe error at end of
/// stream; `write` may write partially and resolves with the count
/// written. Reads and writes are each serialized per stream: a second
/// concurrent operation in the same direction is an invariant
/// violation surfaced through the direction's `Guard`.
pub trait Stream {
    fn read(&self, max: usize) -> Cont<Bytes>;
    fn write(&self, data: Bytes) -> Cont<usize>;
    fn flush(&self) -> Cont<()>;
    fn dispose(&self);
    fn disposed(&self) -> bool;
    fn fd(&self) -> Option<RawFd> {
        None
    }
}

/// Single-direction reentry guard. Entering while held reports a value
/// error naming the direction.
pub struct Guard {
    held: Rc<Cell<bool>>,
    label: &'static str,
}

#[derive(Debug)]
pub struct GuardHeld {
    held: Rc<Cell<bool>>,
}

impl Guard {
    pub fn new(label: &'static str) -> Self {
        Guard {
            held: Rc::new(Cell::new(false)),
            label,
        }
    }

    pub fn enter(&self) -> Result<GuardHeld> {
        if self.held.get() {
            return Err(Error::value(format!("concurrent {} on stream", self.label)));
        }
        self.held.set(true);
        Ok(GuardHeld {
            held: self.held.clone(),
        })
    }

    pub fn held(&self) -> bool {
        self.held.get()
    }
}

impl Drop for GuardHeld {
    fn drop(&mut self) {
        self.held.set(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guard_serializes_a_direction() {
        let guard = Guard::new("read");
        let held = guard.enter().unwrap();
        assert!(guard.held());
        let err = guard.enter().unwrap_err();
        assert_eq!(err.kind(), monad::ErrorKind::Value);
        drop(held);
        assert!(!guard.held());
        guard.enter().unwrap();
    }
}
