use monad::Cont;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type Handler<T> = Box<dyn FnMut(&T) -> bool>;

/// Multicast event. Handlers returning `false` unsubscribe; handlers
/// subscribed while an event is being fired see only later events.
pub struct Event<T> {
    handlers: Rc<RefCell<Vec<Handler<T>>>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Event {
            handlers: self.handlers.clone(),
        }
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Event {
            handlers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Fire the event, dispatching to a snapshot of the handler list.
    pub fn fire(&self, value: &T) {
        let snapshot = std::mem::take(&mut *self.handlers.borrow_mut());
        let mut kept = Vec::with_capacity(snapshot.len());
        for mut handler in snapshot {
            if handler(value) {
                kept.push(handler);
            }
        }
        // Handlers subscribed during dispatch are already in the live
        // list; the survivors go back in front of them.
        let mut handlers = self.handlers.borrow_mut();
        kept.append(&mut handlers);
        *handlers = kept;
    }

    pub fn on(&self, handler: impl FnMut(&T) -> bool + 'static) {
        self.handlers.borrow_mut().push(Box::new(handler));
    }

    pub fn on_once(&self, handler: impl FnOnce(&T) + 'static) {
        let mut handler = Some(handler);
        self.on(move |value| {
            if let Some(handler) = handler.take() {
                handler(value);
            }
            false
        });
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }
}

impl<T: Clone + 'static> Event<T> {
    /// Monad form: resolves with the next fired value.
    pub fn next(&self) -> Cont<T> {
        let event = self.clone();
        Cont::new(move |ret| {
            event.on_once(move |value| {
                ret.value(value.clone());
            });
            Ok(())
        })
    }
}

/// Event which buffers fired values while no handler is attached, so
/// values fired early are not lost.
pub struct EventQueue<T> {
    event: Event<T>,
    queue: Rc<RefCell<VecDeque<T>>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        EventQueue {
            event: self.event.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<T: 'static> EventQueue<T> {
    pub fn new() -> Self {
        EventQueue {
            event: Event::new(),
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn fire(&self, value: T) {
        if self.event.handler_count() == 0 {
            self.queue.borrow_mut().push_back(value);
        } else {
            self.event.fire(&value);
        }
    }

    pub fn on(&self, handler: impl FnMut(&T) -> bool + 'static) {
        self.event.on(handler);
        loop {
            if self.event.handler_count() == 0 {
                break;
            }
            let value = match self.queue.borrow_mut().pop_front() {
                Some(value) => value,
                None => break,
            };
            self.event.fire(&value);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl<T: 'static> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_false_return_unsubscribes() {
        let event = Event::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut remaining = 2;
        event.on(move |value: &i64| {
            sink.borrow_mut().push(*value);
            remaining -= 1;
            remaining > 0
        });
        for value in [1, 2, 3] {
            event.fire(&value);
        }
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(event.handler_count(), 0);
    }

    #[test]
    fn test_next_resolves_with_first_value_only() {
        let event = Event::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        event
            .next()
            .run(move |result| *sink.borrow_mut() = Some(result));
        event.fire(&10);
        event.fire(&20);
        assert_eq!(*seen.borrow(), Some(Ok(10)));
    }

    #[test]
    fn test_subscribe_during_fire_sees_later_events_only() {
        let event: Event<i64> = Event::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let inner = event.clone();
        let sink = seen.clone();
        event.on(move |value| {
            if *value == 1 {
                let sink = sink.clone();
                inner.on(move |value| {
                    sink.borrow_mut().push(*value);
                    true
                });
            }
            true
        });
        event.fire(&1);
        event.fire(&2);
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn test_queue_buffers_until_subscribed() {
        let queue = EventQueue::new();
        queue.fire(1);
        queue.fire(2);
        assert_eq!(queue.len(), 2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        queue.on(move |value: &i64| {
            sink.borrow_mut().push(*value);
            true
        });
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert!(queue.is_empty());

        queue.fire(3);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }
}
