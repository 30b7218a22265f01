//! Peer runtime: what a spawned transport child runs.
//!
//! Reads the environment table and bootstrap payload from stdin,
//! installs both, wires a stream connection over the descriptors the
//! payload names (or stdin/stdout), and serves until the connection is
//! torn down.

use crate::boot;
use crate::conn::StreamConnection;
use crate::hub::Hub;
use crate::registry::Registry;
use monad::Result;
use reactor::Reactor;
use std::os::fd::RawFd;
use std::rc::Rc;
use stream::{BufferedStream, File};

pub fn peer_main() -> Result<()> {
    let (environ, payload) = boot::read_bootstrap(0)?;
    for (key, value) in environ {
        std::env::set_var(key, value);
    }

    let core = Reactor::new()?;
    Reactor::set_local(&core);
    let hub = Hub::new();
    Hub::set_local(&hub);
    let registry = Registry::new();
    Registry::set_local(&registry);

    for record in payload.modules.clone() {
        registry.add_module(record)?;
    }

    let conn = StreamConnection::new(&hub, &core);
    for (from, to) in &payload.module_map {
        conn.conn().map_module(from.clone(), to.clone());
    }

    let bufsize = payload.bufsize.map(|size| size as usize);
    let wrap = |fd: RawFd| -> Result<BufferedStream> {
        Ok(BufferedStream::new(
            Rc::new(File::new(fd, true, &core)?),
            bufsize,
        ))
    };
    let (reader, writer) = match (payload.reader_fd, payload.writer_fd) {
        (Some(reader_fd), Some(writer_fd)) => (wrap(reader_fd)?, wrap(writer_fd)?),
        _ => (wrap(0)?, wrap(1)?),
    };

    {
        let core = core.clone();
        conn.conn().add_disposal(move || core.stop());
    }

    let connected = conn.connect(reader, writer).promise();
    core.run_until(&connected)?;

    if !conn.conn().disposed() {
        core.run()?;
    }
    conn.dispose();
    core.dispose();
    Ok(())
}
