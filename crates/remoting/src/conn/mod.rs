//! Connections: framed message transport with address rewriting.

#[allow(clippy::module_inception)]
mod conn;
mod fork;
mod shell;
mod ssh;
mod stream;

pub use conn::{Connection, CONNECTED, CONNECTING, DISPOSED, INIT};
pub use fork::{default_peer_command, ForkConnection};
pub use shell::ShellConnection;
pub use ssh::{SshConnection, SshOpts};
pub use stream::StreamConnection;
