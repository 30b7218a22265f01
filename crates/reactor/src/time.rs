use monad::Ret;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Upper bound for blocking waits. A positive bound is easier to work
/// with than branching on negative timeouts, and an occasional idle
/// wake-up is harmless.
pub const CORE_TIMEOUT: Duration = Duration::from_secs(3600);

struct Entry {
    deadline: Instant,
    seq: u64,
    ret: Ret<Instant>,
}

// Min-heap on (deadline, seq); seq breaks ties in insertion order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Entry {}

/// Continuations keyed by deadline.
pub(crate) struct TimeQueue {
    queue: BinaryHeap<Entry>,
    seq: u64,
}

impl TimeQueue {
    pub fn new() -> Self {
        TimeQueue {
            queue: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, deadline: Instant, ret: Ret<Instant>) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Entry { deadline, seq, ret });
    }

    /// Pop every entry due at `now`. The caller resolves the returned
    /// pairs outside any queue borrow, so resolution code may push new
    /// entries (they run on a later tick).
    pub fn dispatch(&mut self, now: Instant) -> Vec<(Ret<Instant>, Instant)> {
        let mut due = Vec::new();
        while let Some(head) = self.queue.peek() {
            if head.deadline > now {
                break;
            }
            let entry = self.queue.pop().expect("peeked entry exists");
            due.push((entry.ret, entry.deadline));
        }
        due
    }

    /// Time until the earliest deadline, clamped to [0, CORE_TIMEOUT].
    pub fn timeout(&self, now: Instant) -> Duration {
        match self.queue.peek() {
            Some(head) => head.deadline.saturating_duration_since(now).min(CORE_TIMEOUT),
            None => CORE_TIMEOUT,
        }
    }

    pub fn drain(&mut self) -> Vec<Ret<Instant>> {
        // Swap first, then walk the local heap: resolution callbacks may
        // push fresh entries and must not see them drained.
        let queue = std::mem::take(&mut self.queue);
        queue.into_iter().map(|entry| entry.ret).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use monad::Cont;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_dispatch_order_breaks_ties_by_insertion() {
        let queue = Rc::new(RefCell::new(TimeQueue::new()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        for tag in [2, 0, 1] {
            let queue = queue.clone();
            let seen = seen.clone();
            let deadline = now + Duration::from_millis(if tag == 2 { 5 } else { 0 });
            Cont::new(move |ret| {
                queue.borrow_mut().push(deadline, ret);
                Ok(())
            })
            .map(move |_| tag)
            .run(move |result| seen.borrow_mut().push(result.unwrap()));
        }

        let due = queue.borrow_mut().dispatch(now + Duration::from_millis(10));
        for (ret, deadline) in due {
            ret.value(deadline);
        }
        // Same-deadline entries in insertion order, later deadline last.
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let queue = Rc::new(RefCell::new(TimeQueue::new()));
        let now = Instant::now();
        assert_eq!(queue.borrow().timeout(now), CORE_TIMEOUT);

        // An overdue deadline clamps to zero.
        let push = queue.clone();
        Cont::new(move |ret| {
            push.borrow_mut().push(now - Duration::from_secs(1), ret);
            Ok(())
        })
        .run(|_| ());
        assert_eq!(queue.borrow().timeout(now), Duration::ZERO);
        assert_eq!(queue.borrow().len(), 1);
    }

    #[test]
    fn test_drain_resolves_the_snapped_entries() {
        let queue = Rc::new(RefCell::new(TimeQueue::new()));
        let now = Instant::now();
        let push = queue.clone();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        Cont::new(move |ret| {
            push.borrow_mut().push(now, ret);
            Ok(())
        })
        .run(move |result| *slot.borrow_mut() = Some(result));

        let rets = queue.borrow_mut().drain();
        assert_eq!(queue.borrow().len(), 0);
        for ret in rets {
            ret.error(monad::Error::canceled("time queue has been disposed"));
        }
        assert_eq!(
            *seen.borrow(),
            Some(Err(monad::Error::canceled("time queue has been disposed")))
        );
    }
}
