use crate::expr::{Env, Expr};
use crate::hub::{pair, Address, Hub, Receiver, Sender};
use crate::proxy::Proxy;
use crate::registry::{ModuleRecord, Registry};
use crate::value::{NativeObject, Value};
use crate::wire::{self, Frame, WireCodec, WireSender, TAG_ROUTE, TAG_UNROUTE};
use bytes::Bytes;
use common::{CompDisp, StateMachine};
use monad::{cont, Cont, Error, ErrorKind, Result};
use reactor::Reactor;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub const INIT: usize = 0;
pub const CONNECTING: usize = 1;
pub const CONNECTED: usize = 2;
pub const DISPOSED: usize = 3;

const STATE_NAMES: &[&str] = &["not-connected", "connecting", "connected", "disposed"];

struct ConnInner {
    hub: Hub,
    core: Reactor,
    registry: Registry,
    receiver: Receiver,
    sender: Sender,
    state: StateMachine,
    module_map: RefCell<HashMap<String, String>>,
    importer: RefCell<Option<Sender>>,
    import_misses: RefCell<HashMap<String, ()>>,
    disp: CompDisp,
}

/// Transport-independent connection core.
///
/// Owns the local mailbox (a receiver/sender pair on the hub), the
/// peer-module translation map, and the framed dispatch logic. A
/// transport installs the outgoing writer with `start_sending` and
/// feeds received frames to `dispatch`.
pub struct Connection {
    inner: Rc<ConnInner>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Connection {
            inner: self.inner.clone(),
        }
    }
}

enum Step {
    Done,
    Dispose,
    Evaluate {
        expr: Expr,
        src: Option<Sender>,
    },
}

impl Connection {
    pub fn new(hub: &Hub, core: &Reactor) -> Connection {
        let (receiver, sender) = pair(hub);
        let conn = Connection {
            inner: Rc::new(ConnInner {
                hub: hub.clone(),
                core: core.clone(),
                registry: Registry::local(),
                receiver,
                sender,
                state: StateMachine::new(
                    &[
                        (INIT, &[CONNECTING, DISPOSED]),
                        (CONNECTING, &[CONNECTED, DISPOSED]),
                        (CONNECTED, &[DISPOSED]),
                        (DISPOSED, &[DISPOSED]),
                    ],
                    STATE_NAMES,
                ),
                module_map: RefCell::new(HashMap::new()),
                importer: RefCell::new(None),
                import_misses: RefCell::new(HashMap::new()),
                disp: CompDisp::new(),
            }),
        };
        let receiver = conn.clone();
        conn.inner
            .disp
            .add_action(move || receiver.inner.receiver.dispose());
        conn
    }

    pub fn hub(&self) -> Hub {
        self.inner.hub.clone()
    }

    pub fn core(&self) -> Reactor {
        self.inner.core.clone()
    }

    pub fn registry(&self) -> Registry {
        self.inner.registry.clone()
    }

    /// The connection's mailbox sender: anything sent through it ends
    /// up framed on the wire.
    pub fn sender(&self) -> Sender {
        self.inner.sender.clone()
    }

    pub fn state(&self) -> usize {
        self.inner.state.state()
    }

    pub fn connected(&self) -> bool {
        self.inner.state.is(CONNECTED)
    }

    pub fn disposed(&self) -> bool {
        self.inner.state.is(DISPOSED)
    }

    /// Proxy whose expression evaluates `target` on the peer side.
    pub fn proxy(&self, target: Value) -> Proxy {
        Proxy::new(self.sender(), Expr::Const(target))
    }

    /// Map a peer module name onto a local one for deserialization.
    pub fn map_module(&self, from: impl Into<String>, to: impl Into<String>) {
        self.inner
            .module_map
            .borrow_mut()
            .insert(from.into(), to.into());
    }

    pub(crate) fn set_importer(&self, sender: Sender) {
        *self.inner.importer.borrow_mut() = Some(sender);
    }

    pub(crate) fn importer_sender(&self) -> Option<Sender> {
        self.inner.importer.borrow().clone()
    }

    pub(crate) fn note_import_miss(&self, module: &str) {
        self.inner
            .import_misses
            .borrow_mut()
            .insert(module.to_string(), ());
    }

    pub(crate) fn import_missed(&self, module: &str) -> bool {
        self.inner.import_misses.borrow().contains_key(module)
    }

    pub fn add_disposal(&self, action: impl FnOnce() + 'static) {
        self.inner.disp.add_action(action);
    }

    pub(crate) fn transition(&self, state: usize) -> Result<()> {
        self.inner.state.transition(state).map(|_| ())
    }

    /// Install the outgoing path: every message delivered to the
    /// mailbox is serialized with address rewriting and handed to
    /// `write`.
    pub(crate) fn start_sending(
        &self,
        write: impl Fn(Bytes) -> Result<()> + 'static,
    ) -> Result<()> {
        let conn = self.clone();
        self.inner.receiver.recv(move |msg, dst, src| {
            let codec = ConnCodec { conn: &conn };
            let frame = Frame {
                msg: msg.freeze(&codec)?,
                dst: dst.segments().to_vec(),
                src: match &src {
                    Some(src) => Some(codec.freeze_sender(src)?),
                    None => None,
                },
            };
            write(Bytes::from(wire::encode(&frame)?))?;
            Ok(true)
        })
    }

    /// Handle one received frame. Dispatch detaches from the reading
    /// coroutine first: a handler may drive a nested reactor loop (the
    /// importer) and must not block the reader.
    pub(crate) fn dispatch(&self, data: Bytes) -> Cont<()> {
        let conn = self.clone();
        cont(async move {
            conn.inner.core.schedule().await?;
            loop {
                match conn.step(&data) {
                    Ok(Step::Done) => return Ok(()),
                    Ok(Step::Dispose) => {
                        conn.dispose();
                        return Ok(());
                    }
                    Ok(Step::Evaluate { expr, src }) => {
                        conn.evaluate(expr, src).await;
                        return Ok(());
                    }
                    Err(error) if error.kind() == ErrorKind::Interrupt => {
                        // A required module is being fetched right now.
                        // Wait for loading to settle, then retry the
                        // frame on a fresh tick: the message which
                        // resumes us may itself complete that fetch.
                        conn.inner.registry.loaded().await?;
                        conn.inner.core.schedule().await?;
                    }
                    Err(error) => {
                        if !conn.disposed() {
                            tracing::error!(%error, trace = error.trace(), "frame dispatch failed");
                        }
                        return Ok(());
                    }
                }
            }
        })
    }

    fn step(&self, data: &Bytes) -> Result<Step> {
        let frame = wire::decode(data)?;
        let codec = ConnCodec { conn: self };

        let src = match &frame.src {
            Some(src) => Some(codec.thaw_sender(src)?),
            None => None,
        };
        let msg = match Value::thaw(&frame.msg, &codec) {
            Ok(msg) => msg,
            Err(error) if error.kind() == ErrorKind::Interrupt => return Err(error),
            Err(error) => {
                reply_error(&src, error);
                return Ok(Step::Done);
            }
        };

        // Strip our own mailbox segment, appended by the peer's
        // serializer, to recover the original destination.
        let dst = Address::from_segments(frame.dst).unroute()?;
        if !dst.is_empty() {
            // Another hop: forward through the hub.
            if let Err(error) = self.inner.hub.send(msg, &dst, src.clone()) {
                reply_error(&src, error);
            }
            return Ok(Step::Done);
        }

        match msg {
            Value::Null => Ok(Step::Dispose),
            Value::Expr(expr) => Ok(Step::Evaluate { expr: *expr, src }),
            other => {
                reply_error(
                    &src,
                    Error::value(format!(
                        "connection message must be an expression, got {}",
                        other.type_name()
                    )),
                );
                Ok(Step::Done)
            }
        }
    }

    /// Evaluate an expression addressed to the connection itself, with
    /// the connection as the environment argument, and reply to `src`.
    /// A monadic result is awaited before replying.
    async fn evaluate(&self, expr: Expr, src: Option<Sender>) {
        let env = Rc::new(Env::with_arg(
            "conn",
            Value::native(ConnNative { conn: self.clone() }),
        ));
        let mut result = expr.eval(&env).await;
        if let Ok(Value::Native(native)) = &result {
            if let Ok(pending) = native.0.monad() {
                result = pending.await;
            }
        }
        match (src, result) {
            (Some(src), Ok(value)) => {
                if let Err(error) = src.send(value, None) {
                    tracing::warn!(%error, "reply could not be delivered");
                }
            }
            (Some(src), Err(error)) => {
                let error = error.hop(format!("evaluated at peer {}", self.inner.sender.addr()));
                reply_error(&Some(src), error);
            }
            (None, Ok(_)) => {}
            (None, Err(error)) => {
                tracing::error!(%error, trace = error.trace(), "unaddressed evaluation failure");
            }
        }
    }

    /// Tear down: the mailbox handler goes away, transports close
    /// their streams (cancelling pending I/O), composed resources are
    /// released in LIFO order.
    pub fn dispose(&self) {
        if !matches!(self.inner.state.transition(DISPOSED), Ok(true)) {
            return;
        }
        self.inner.disp.dispose();
        tracing::debug!(addr = %self.inner.sender.addr(), "connection disposed");
    }
}

fn reply_error(src: &Option<Sender>, error: Error) {
    match src {
        Some(src) => {
            if let Err(send_error) = src.send(Value::Error(error), None) {
                tracing::warn!(%send_error, "error reply could not be delivered");
            }
        }
        None => {
            tracing::error!(%error, trace = error.trace(), "message failed with no reply address");
        }
    }
}

/// Address-rewriting codec bound to one connection.
///
/// Outgoing senders either carry their full address (ROUTE) or, when
/// they were previously received from this peer, the unrouted tail
/// (UNROUTE). Incoming senders get the inverse treatment, so a sender
/// crossing the same connection twice round-trips to its original
/// address.
struct ConnCodec<'a> {
    conn: &'a Connection,
}

impl WireCodec for ConnCodec<'_> {
    fn freeze_sender(&self, sender: &Sender) -> Result<WireSender> {
        let inner = &self.conn.inner;
        if !Hub::same_hub(sender.hub(), &inner.hub) {
            return Err(Error::value(
                "sender's hub must match the hub used by the connection",
            ));
        }
        if sender.addr() == inner.sender.addr() {
            // Received from this peer earlier; strip our mailbox so the
            // peer sees its own unrouted address.
            Ok(WireSender {
                tag: TAG_UNROUTE,
                addr: sender.addr().unroute()?.segments().to_vec(),
            })
        } else {
            Ok(WireSender {
                tag: TAG_ROUTE,
                addr: sender.addr().segments().to_vec(),
            })
        }
    }

    fn thaw_sender(&self, wire: &WireSender) -> Result<Sender> {
        let inner = &self.conn.inner;
        let addr = Address::from_segments(wire.addr.clone());
        match wire.tag {
            TAG_ROUTE => Ok(Sender::new(
                inner.hub.clone(),
                addr.route(inner.sender.addr()),
            )),
            TAG_UNROUTE => Ok(Sender::new(
                inner.hub.clone(),
                if addr.is_empty() {
                    inner.sender.addr().clone()
                } else {
                    addr
                },
            )),
            other => Err(Error::value(format!("unknown sender tag: {other}"))),
        }
    }

    fn thaw_closure(&self, module: &str, name: &str) -> Result<crate::registry::Closure> {
        let translated = self
            .conn
            .inner
            .module_map
            .borrow()
            .get(module)
            .cloned()
            .unwrap_or_else(|| module.to_string());
        let registry = &self.conn.inner.registry;
        if registry.is_loading(&translated) {
            return Err(Error::new(
                ErrorKind::Interrupt,
                format!("module {translated} is being loaded"),
            ));
        }
        if !registry.has_module(&translated) {
            // Fall through to the remote importer, if one is installed.
            crate::importer::fetch(self.conn, &translated)?;
        }
        Ok(crate::registry::Closure::new(translated, name))
    }
}

/// The connection's native face, reachable from peer expressions as
/// the `conn` argument.
struct ConnNative {
    conn: Connection,
}

impl NativeObject for ConnNative {
    fn type_name(&self) -> &'static str {
        "connection"
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        let conn = self.conn.clone();
        match name {
            "install_importer" => Ok(Value::native_fn("install_importer", move |args, _| {
                let [sender] = arity::<1>(args)?;
                conn.set_importer(sender.as_sender()?.clone());
                Ok(Value::Null)
            })),
            "map_module" => Ok(Value::native_fn("map_module", move |args, _| {
                let [from, to] = arity::<2>(args)?;
                conn.map_module(from.as_str()?, to.as_str()?);
                Ok(Value::Null)
            })),
            "add_module" => Ok(Value::native_fn("add_module", move |args, _| {
                let [record] = arity::<1>(args)?;
                conn.registry().add_module(ModuleRecord::from_value(&record)?)?;
                Ok(Value::Null)
            })),
            other => Err(Error::value(format!(
                "connection has no attribute {other:?}"
            ))),
        }
    }
}

fn arity<const N: usize>(args: Vec<Value>) -> Result<[Value; N]> {
    let count = args.len();
    args.try_into()
        .map_err(|_| Error::value(format!("expected {N} arguments, got {count}")))
}
