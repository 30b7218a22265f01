use crate::file::{fd_cloexec, File};
use monad::{Error, Result};
use reactor::Reactor;
use std::os::fd::RawFd;

/// Asynchronous pipe: both ends wrapped as descriptor streams on the
/// same reactor.
pub struct Pipe {
    pub reader: File,
    pub writer: File,
}

impl Pipe {
    pub fn new(core: &Reactor, cloexec: Option<bool>) -> Result<Pipe> {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds points at a live two-element array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::connection(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        if cloexec.unwrap_or(true) {
            fd_cloexec(fds[0], true)?;
            fd_cloexec(fds[1], true)?;
        }
        Ok(Pipe {
            reader: File::new(fds[0], true, core)?,
            writer: File::new(fds[1], true, core)?,
        })
    }

    pub fn dispose(&self) {
        use crate::stream::Stream;
        self.reader.dispose();
        self.writer.dispose();
    }
}
