//! Facade over the framework crates, plus the application runner.

pub use common::{bufsize, test_timeout, CompDisp, Event, EventQueue, FuncDisp, StateMachine};
pub use monad::{cont, Cont, Error, ErrorKind, Promise, Result, Ret};
pub use process::{process_call, process_chain_call, Process, ProcessOpts, ProcessPipe, Stdio};
pub use reactor::{Reactor, Remote, POLL_ERROR, POLL_READ, POLL_WRITE};
pub use remoting::{
    pair, proxify, proxify_func, Address, Closure, Connection, Expr, ForkConnection, Hub,
    Importer, Lambda, ModuleDef, ModuleRecord, Native, NativeObject, Proxy, Receiver, Registry,
    Sender, ShellConnection, SshConnection, SshOpts, StreamConnection, Value, WireExpr, WireValue,
};
pub use stream::{Buffer, BufferedStream, File, Pipe, Socket, Stream};

pub mod app {
    use monad::{Cont, Result};
    use reactor::Reactor;

    /// Build this thread's reactor, run `main` to completion on it,
    /// and tear the reactor down on every exit path.
    pub fn run<T: Clone + 'static>(main: impl FnOnce(&Reactor) -> Cont<T>) -> Result<T> {
        let core = Reactor::local()?;
        let outcome = main(&core).promise();
        let result = core.run_until(&outcome);
        core.dispose();
        result
    }
}
