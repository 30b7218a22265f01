//! End-to-end scenarios over a forked peer process: the bootstrap
//! handshake, framed exchange, address rewriting, the remote importer,
//! and teardown, all against the real `pretzel-peer` binary.

use pretzel::{
    pair, Closure, ForkConnection, Hub, Lambda, ModuleDef, ModuleRecord, Reactor, Registry, Value,
    WireExpr,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Mutex;

// Child reaping is process-wide; run the fork scenarios one at a time.
static REAP: Mutex<()> = Mutex::new(());

fn peer_command() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_pretzel-peer").to_string()]
}

struct Forked {
    core: Reactor,
    hub: Hub,
    conn: ForkConnection,
}

fn forked() -> Forked {
    let core = Reactor::new().unwrap();
    let hub = Hub::new();
    let connect = ForkConnection::connect(
        Some(peer_command()),
        vec![("PRETZEL_TEST_MARK".to_string(), "1".to_string())],
        None,
        &hub,
        &core,
    )
    .promise();
    let conn = core.run_until(&connect).unwrap();
    Forked { core, hub, conn }
}

fn dispose_and_reap(forked: Forked) {
    let status = forked.conn.process().status();
    forked.conn.dispose();
    // The child sees EOF, tears its connection down and exits clean.
    assert_eq!(forked.core.run_until(&status).unwrap(), 0);
    forked.core.dispose();
}

#[test]
fn test_echo_over_fork() {
    let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
    let forked = forked();

    let echo = forked
        .conn
        .conn()
        .proxy(Value::Closure(Closure::new("builtins", "identity")))
        .call(vec![Value::Bytes(bytes_of(b"0123456789"))])
        .eval()
        .promise();
    assert_eq!(
        forked.core.run_until(&echo).unwrap(),
        Value::Bytes(bytes_of(b"0123456789"))
    );

    dispose_and_reap(forked);
}

#[test]
fn test_remote_attribute_chain_over_fork() {
    let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
    let forked = forked();

    let mut inner = BTreeMap::new();
    inner.insert("b".to_string(), Value::Int(42));
    let mut outer = BTreeMap::new();
    outer.insert("a".to_string(), Value::Map(inner));

    let chained = forked
        .conn
        .conn()
        .proxy(Value::Map(outer))
        .index(Value::Str("a".into()))
        .index(Value::Str("b".into()))
        .eval()
        .promise();
    assert_eq!(forked.core.run_until(&chained).unwrap(), Value::Int(42));

    dispose_and_reap(forked);
}

#[test]
fn test_sender_round_trip_over_fork() {
    let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
    let forked = forked();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (receiver, sender) = pair(&forked.hub);
    {
        let seen = seen.clone();
        receiver
            .recv(move |msg, _dst, _src| {
                seen.borrow_mut().push(msg);
                Ok(true)
            })
            .unwrap();
    }
    let original = sender.addr().segments().to_vec();

    let returned = forked
        .conn
        .conn()
        .proxy(Value::Closure(Closure::new("builtins", "identity")))
        .call(vec![Value::Sender(sender)])
        .eval()
        .promise();
    let Value::Sender(round_tripped) = forked.core.run_until(&returned).unwrap() else {
        panic!("expected a sender back")
    };
    assert_eq!(round_tripped.addr().segments(), original.as_slice());

    round_tripped.send(Value::Str("hi".into()), None).unwrap();
    assert_eq!(*seen.borrow(), vec![Value::Str("hi".into())]);

    dispose_and_reap(forked);
}

#[test]
fn test_importer_ships_modules_on_demand() {
    let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
    let forked = forked();

    // Registered only after connect, so the bootstrap did not carry
    // it: the peer must fetch it back through the importer when the
    // closure reference arrives.
    let def = ModuleDef {
        defs: vec![(
            "double".to_string(),
            Lambda {
                params: vec!["x".to_string()],
                body: WireExpr::Call {
                    func: Box::new(WireExpr::Const(pretzel::WireValue::Closure {
                        module: "builtins".into(),
                        name: "add".into(),
                    })),
                    args: vec![WireExpr::Arg("x".into()), WireExpr::Arg("x".into())],
                    kwargs: BTreeMap::new(),
                },
            },
        )],
    };
    let record = ModuleRecord::from_def("shiptest", &def).unwrap();
    Registry::local().add_module(record).unwrap();

    let doubled = forked
        .conn
        .conn()
        .proxy(Value::Closure(Closure::new("shiptest", "double")))
        .call(vec![Value::Int(21)])
        .bind()
        .eval()
        .promise();
    assert_eq!(forked.core.run_until(&doubled).unwrap(), Value::Int(42));

    dispose_and_reap(forked);
}

fn bytes_of(data: &'static [u8]) -> bytes::Bytes {
    bytes::Bytes::from_static(data)
}
