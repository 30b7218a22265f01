//! Shell transport: the peer's stdin/stdout become the framed
//! transport, with the bootstrap riding ahead on stdin.

use pretzel::{Closure, Hub, Reactor, ShellConnection, Value};
use std::sync::Mutex;

static REAP: Mutex<()> = Mutex::new(());

#[test]
fn test_echo_over_shell_transport() {
    let _guard = REAP.lock().unwrap_or_else(|poison| poison.into_inner());
    let core = Reactor::new().unwrap();
    let hub = Hub::new();

    // An empty command prefix execs the peer binary directly; a real
    // deployment would put e.g. an ssh invocation in front.
    let connect = ShellConnection::connect(
        Vec::new(),
        env!("CARGO_BIN_EXE_pretzel-peer").to_string(),
        Vec::new(),
        None,
        &hub,
        &core,
    )
    .promise();
    let conn = core.run_until(&connect).unwrap();

    let echo = conn
        .conn()
        .proxy(Value::Closure(Closure::new("builtins", "concat")))
        .call(vec![Value::Str("pret".into()), Value::Str("zel".into())])
        .eval()
        .promise();
    assert_eq!(core.run_until(&echo).unwrap(), Value::Str("pretzel".into()));

    let status = conn.process().status();
    conn.dispose();
    assert_eq!(core.run_until(&status).unwrap(), 0);
    core.dispose();
}
