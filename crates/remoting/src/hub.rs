use crate::value::Value;
use monad::{Cont, Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Routing path: an ordered sequence of opaque segments.
///
/// Equality and hashing consider only the trailing segment. That is
/// what makes routing reversible across a transport: a connection
/// appends its own mailbox segment to an address it forwards, the
/// routed address still dispatches to the connection's handler on this
/// side, and the peer pops the segment to recover the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address(Vec<u64>);

impl Address {
    pub fn single(segment: u64) -> Address {
        Address(vec![segment])
    }

    pub fn from_segments(segments: Vec<u64>) -> Address {
        Address(segments)
    }

    pub fn segments(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_local(&self) -> bool {
        self.0.len() == 1
    }

    /// Append `suffix`, producing the routed address.
    pub fn route(&self, suffix: &Address) -> Address {
        let mut segments = self.0.clone();
        segments.extend_from_slice(&suffix.0);
        Address(segments)
    }

    /// Pop the trailing segment.
    pub fn unroute(&self) -> Result<Address> {
        if self.0.is_empty() {
            return Err(Error::value("empty address cannot be unrouted"));
        }
        Ok(Address(self.0[..self.0.len() - 1].to_vec()))
    }

    fn last(&self) -> Option<u64> {
        self.0.last().copied()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.last() == other.last()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.last().hash(state);
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in self.0.iter().rev() {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        Ok(())
    }
}

type Handler = Box<dyn FnMut(Value, &Address, Option<Sender>) -> Result<bool>>;

struct HubInner {
    handlers: RefCell<HashMap<Address, Rc<RefCell<Handler>>>>,
    counter: Cell<u64>,
}

/// In-process message router keyed by address.
///
/// One handler per address; a handler returning `false` or failing is
/// unregistered (a faulty handler does not silently stay subscribed).
/// Handlers may send from within a handler; only a reentrant send to
/// the address currently being dispatched is refused.
pub struct Hub {
    inner: Rc<HubInner>,
}

impl Clone for Hub {
    fn clone(&self) -> Self {
        Hub {
            inner: self.inner.clone(),
        }
    }
}

thread_local! {
    static LOCAL: RefCell<Option<Hub>> = const { RefCell::new(None) };
}

impl Hub {
    pub fn new() -> Hub {
        Hub {
            inner: Rc::new(HubInner {
                handlers: RefCell::new(HashMap::new()),
                counter: Cell::new(0),
            }),
        }
    }

    /// This thread's hub, created on first use.
    pub fn local() -> Hub {
        LOCAL.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(hub) => hub.clone(),
                None => {
                    let hub = Hub::new();
                    *slot = Some(hub.clone());
                    hub
                }
            }
        })
    }

    pub fn set_local(hub: &Hub) {
        LOCAL.with(|slot| *slot.borrow_mut() = Some(hub.clone()));
    }

    pub fn same_hub(a: &Hub, b: &Hub) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// A fresh local (single-segment) address.
    pub fn addr(&self) -> Address {
        let next = self.inner.counter.get() + 1;
        self.inner.counter.set(next);
        Address::single(next)
    }

    pub fn send(&self, msg: Value, dst: &Address, src: Option<Sender>) -> Result<()> {
        if !self.try_send(msg, dst, src)? {
            return Err(Error::value(format!("no receiver for address: {dst}")));
        }
        Ok(())
    }

    /// Deliver to the handler registered at `dst`. Returns whether a
    /// handler existed. A handler error removes it and re-raises here.
    pub fn try_send(&self, msg: Value, dst: &Address, src: Option<Sender>) -> Result<bool> {
        let handler = self.inner.handlers.borrow().get(dst).cloned();
        let Some(handler) = handler else {
            return Ok(false);
        };
        let outcome = {
            let mut guard = handler.try_borrow_mut().map_err(|_| {
                Error::value(format!(
                    "reentrant send to the address being dispatched: {dst}"
                ))
            })?;
            (*guard)(msg, dst, src)
        };
        match outcome {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.remove_exact(dst, &handler);
                Ok(true)
            }
            Err(error) => {
                self.remove_exact(dst, &handler);
                Err(error)
            }
        }
    }

    fn remove_exact(&self, dst: &Address, handler: &Rc<RefCell<Handler>>) {
        let mut handlers = self.inner.handlers.borrow_mut();
        if let Some(current) = handlers.get(dst) {
            if Rc::ptr_eq(current, handler) {
                handlers.remove(dst);
            }
        }
    }

    /// Register `handler` at `dst`. A second handler on the same
    /// address fails.
    pub fn recv(
        &self,
        dst: &Address,
        handler: impl FnMut(Value, &Address, Option<Sender>) -> Result<bool> + 'static,
    ) -> Result<()> {
        let mut handlers = self.inner.handlers.borrow_mut();
        if handlers.contains_key(dst) {
            return Err(Error::value(format!(
                "multiple receive handlers for address: {dst}"
            )));
        }
        handlers.insert(dst.clone(), Rc::new(RefCell::new(Box::new(handler))));
        Ok(())
    }

    /// Register a handler which fires once and unregisters itself.
    pub fn recv_once(
        &self,
        dst: &Address,
        handler: impl FnOnce(Value, Option<Sender>) + 'static,
    ) -> Result<()> {
        let mut handler = Some(handler);
        self.recv(dst, move |msg, _dst, src| {
            if let Some(handler) = handler.take() {
                handler(msg, src);
            }
            Ok(false)
        })
    }

    pub fn unrecv(&self, dst: &Address) -> bool {
        self.inner.handlers.borrow_mut().remove(dst).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handlers.borrow().is_empty()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending end of a hub registration. Serializable: crossing a
/// connection rewrites its address so replies route back through the
/// transport.
pub struct Sender {
    hub: Hub,
    addr: Address,
}

impl Clone for Sender {
    fn clone(&self) -> Self {
        Sender {
            hub: self.hub.clone(),
            addr: self.addr.clone(),
        }
    }
}

impl Sender {
    pub fn new(hub: Hub, addr: Address) -> Sender {
        Sender { hub, addr }
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn send(&self, msg: Value, src: Option<Sender>) -> Result<()> {
        self.hub.send(msg, &self.addr, src)
    }

    pub fn try_send(&self, msg: Value) -> Result<bool> {
        self.hub.try_send(msg, &self.addr, None)
    }

    /// Request/response: install a one-shot reply handler, send with
    /// it as the source, resolve with the first reply. An error reply
    /// value resolves as the embedded error.
    pub fn call(&self, msg: Value) -> Cont<Value> {
        let sender = self.clone();
        Cont::new(move |ret| {
            let reply_addr = sender.hub.addr();
            sender.hub.recv_once(&reply_addr, move |msg, _src| {
                ret.resolve(match msg {
                    Value::Error(error) => Err(error),
                    value => Ok(value),
                });
            })?;
            let reply_to = Sender::new(sender.hub.clone(), reply_addr.clone());
            if let Err(error) = sender.send(msg, Some(reply_to)) {
                sender.hub.unrecv(&reply_addr);
                return Err(error);
            }
            Ok(())
        })
    }
}

impl PartialEq for Sender {
    fn eq(&self, other: &Self) -> bool {
        Hub::same_hub(&self.hub, &other.hub) && self.addr.segments() == other.addr.segments()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sender(addr:{})", self.addr)
    }
}

/// Receiving end of a hub registration; owns a local address.
pub struct Receiver {
    hub: Hub,
    addr: Address,
}

impl Receiver {
    pub fn new(hub: Hub, addr: Address) -> Result<Receiver> {
        if !addr.is_local() {
            return Err(Error::value(format!("non-local address: {addr}")));
        }
        Ok(Receiver { hub, addr })
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn recv(
        &self,
        handler: impl FnMut(Value, &Address, Option<Sender>) -> Result<bool> + 'static,
    ) -> Result<()> {
        self.hub.recv(&self.addr, handler)
    }

    /// Monad form: the next message delivered to this address.
    pub fn next(&self) -> Cont<(Value, Option<Sender>)> {
        let hub = self.hub.clone();
        let addr = self.addr.clone();
        Cont::new(move |ret| {
            hub.recv_once(&addr, move |msg, src| {
                ret.value((msg, src));
            })
        })
    }

    pub fn dispose(&self) {
        self.hub.unrecv(&self.addr);
    }
}

/// Fresh receiver/sender pair on `hub`.
pub fn pair(hub: &Hub) -> (Receiver, Sender) {
    let addr = hub.addr();
    let receiver = Receiver::new(hub.clone(), addr.clone()).expect("fresh addresses are local");
    (receiver, Sender::new(hub.clone(), addr))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_route_unroute_round_trip() {
        let base = Address::from_segments(vec![7, 8]);
        let hop = Address::single(9);
        let routed = base.route(&hop);
        assert_eq!(routed.segments(), &[7, 8, 9]);
        assert_eq!(routed.unroute().unwrap().segments(), base.segments());
        assert!(Address::from_segments(Vec::new()).unroute().is_err());
    }

    #[test]
    fn test_equality_is_by_trailing_segment() {
        let short = Address::single(5);
        let long = Address::from_segments(vec![1, 2, 5]);
        assert_eq!(short, long);
        assert_ne!(short, Address::single(6));
    }

    #[test]
    fn test_double_subscription_fails() {
        let hub = Hub::new();
        let addr = hub.addr();
        hub.recv(&addr, |_msg, _dst, _src| Ok(true)).unwrap();
        assert!(hub.recv(&addr, |_msg, _dst, _src| Ok(true)).is_err());
    }

    #[test]
    fn test_send_to_unregistered_address_raises() {
        let hub = Hub::new();
        let addr = hub.addr();
        let err = hub.send(Value::Null, &addr, None).unwrap_err();
        assert_eq!(err.kind(), monad::ErrorKind::Value);
        assert!(!hub.try_send(Value::Null, &addr, None).unwrap());
    }

    #[test]
    fn test_handler_returning_false_is_unregistered() {
        let hub = Hub::new();
        let addr = hub.addr();
        hub.recv(&addr, |_msg, _dst, _src| Ok(false)).unwrap();
        assert!(hub.try_send(Value::Null, &addr, None).unwrap());
        assert!(!hub.try_send(Value::Null, &addr, None).unwrap());
    }

    #[test]
    fn test_faulty_handler_is_removed_and_reraises() {
        let hub = Hub::new();
        let addr = hub.addr();
        hub.recv(&addr, |_msg, _dst, _src| Err(monad::Error::user("kaput")))
            .unwrap();
        let err = hub.send(Value::Null, &addr, None).unwrap_err();
        assert_eq!(err, monad::Error::user("kaput"));
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn test_handlers_may_send_to_other_addresses() {
        let hub = Hub::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (sink_recv, sink_send) = pair(&hub);
        {
            let seen = seen.clone();
            sink_recv
                .recv(move |msg, _dst, _src| {
                    seen.borrow_mut().push(msg);
                    Ok(true)
                })
                .unwrap();
        }

        let front = hub.addr();
        hub.recv(&front, move |_msg, _dst, _src| {
            sink_send.send(Value::Int(1), None)?;
            Ok(true)
        })
        .unwrap();

        hub.send(Value::Null, &front, None).unwrap();
        assert_eq!(*seen.borrow(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_call_resolves_with_first_reply() {
        let hub = Hub::new();
        let (recv, send) = pair(&hub);
        recv.recv(|msg, _dst, src| {
            let reply = match msg {
                Value::Int(n) => Value::Int(n * 2),
                other => other,
            };
            src.expect("call provides a reply address")
                .send(reply, None)?;
            Ok(true)
        })
        .unwrap();

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        send.call(Value::Int(21))
            .run(move |result| *slot.borrow_mut() = Some(result));
        assert_eq!(*seen.borrow(), Some(Ok(Value::Int(42))));
    }

    #[test]
    fn test_call_rolls_back_reply_handler_on_send_failure() {
        let hub = Hub::new();
        let nobody = Sender::new(hub.clone(), hub.addr());
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        nobody
            .call(Value::Null)
            .run(move |result| *slot.borrow_mut() = Some(result));
        assert!(matches!(*seen.borrow(), Some(Err(_))));
        assert_eq!(hub.len(), 0);
    }
}
