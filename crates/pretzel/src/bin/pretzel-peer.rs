//! Peer trampoline: spawned by the fork/shell/ssh transports. Reads
//! the environment table and bootstrap payload from stdin, then serves
//! a stream connection until the other side goes away.

use anyhow::Context;

fn main() -> anyhow::Result<()> {
    // Frames own stdin/stdout; diagnostics go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    remoting::peer::peer_main().context("peer runtime failed")?;
    Ok(())
}
