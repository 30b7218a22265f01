use crate::stream::{Guard, Stream};
use bytes::Bytes;
use monad::{cont, Cont, Error, Result};
use reactor::{Reactor, POLL_READ, POLL_WRITE};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Set or clear O_NONBLOCK on a descriptor.
pub fn fd_blocking(fd: RawFd, blocking: bool) -> Result<()> {
    // Safety: fcntl on a caller-owned descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(fd_error(fd, "F_GETFL"));
        }
        let flags = if blocking {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(fd_error(fd, "F_SETFL"));
        }
    }
    Ok(())
}

/// Set or clear FD_CLOEXEC on a descriptor.
pub fn fd_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    // Safety: fcntl on a caller-owned descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(fd_error(fd, "F_GETFD"));
        }
        let flags = if cloexec {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(fd_error(fd, "F_SETFD"));
        }
    }
    Ok(())
}

fn fd_error(fd: RawFd, op: &str) -> Error {
    Error::connection(format!(
        "fcntl({op}) on fd {fd}: {}",
        std::io::Error::last_os_error()
    ))
}

struct Inner {
    fd: Cell<RawFd>,
    closefd: bool,
    core: Reactor,
    reading: Guard,
    writing: Guard,
}

/// Non-blocking descriptor stream driven by the reactor's readiness
/// queue.
pub struct File {
    inner: Rc<Inner>,
}

impl Clone for File {
    fn clone(&self) -> Self {
        File {
            inner: self.inner.clone(),
        }
    }
}

impl File {
    /// Wrap `fd`, switching it to non-blocking mode. With `closefd` the
    /// descriptor is closed on dispose.
    pub fn new(fd: RawFd, closefd: bool, core: &Reactor) -> Result<File> {
        fd_blocking(fd, false)?;
        Ok(File {
            inner: Rc::new(Inner {
                fd: Cell::new(fd),
                closefd,
                core: core.clone(),
                reading: Guard::new("read"),
                writing: Guard::new("write"),
            }),
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd.get()
    }

    pub fn cloexec(&self, enable: bool) -> Result<()> {
        fd_cloexec(self.raw_fd(), enable)
    }

    /// Take ownership of the descriptor back, restoring blocking mode.
    /// Pending polls resolve with a broken-pipe error.
    pub fn detach(&self) -> Result<RawFd> {
        let fd = self.inner.fd.replace(-1);
        if fd < 0 {
            return Err(Error::value("file stream is disposed"));
        }
        self.inner.core.unpoll(fd);
        fd_blocking(fd, true)?;
        Ok(fd)
    }
}

fn read_fd(fd: RawFd, max: usize) -> std::result::Result<Bytes, std::io::Error> {
    let mut buffer = vec![0u8; max];
    // Safety: reading into a live, correctly sized local buffer.
    let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, max) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buffer.truncate(n as usize);
    Ok(Bytes::from(buffer))
}

fn write_fd(fd: RawFd, data: &[u8]) -> std::result::Result<usize, std::io::Error> {
    // Safety: writing from a live slice.
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn would_block(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR)
    )
}

fn is_pipe_error(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ESHUTDOWN))
}

impl Stream for File {
    fn read(&self, max: usize) -> Cont<Bytes> {
        let inner = self.inner.clone();
        cont(async move {
            if max == 0 {
                return Ok(Bytes::new());
            }
            let _held = inner.reading.enter()?;
            loop {
                let fd = inner.fd.get();
                if fd < 0 {
                    return Err(Error::canceled("file stream is disposed"));
                }
                match read_fd(fd, max) {
                    Ok(data) if data.is_empty() => {
                        return Err(Error::broken_pipe(format!("end of file on fd {fd}")))
                    }
                    Ok(data) => return Ok(data),
                    Err(err) if would_block(&err) => {}
                    Err(err) if is_pipe_error(&err) => {
                        return Err(Error::broken_pipe(err.to_string()))
                    }
                    Err(err) => return Err(err.into()),
                }
                inner.core.poll_fd(fd, POLL_READ).await?;
            }
        })
    }

    fn write(&self, data: Bytes) -> Cont<usize> {
        let inner = self.inner.clone();
        cont(async move {
            if data.is_empty() {
                return Ok(0);
            }
            let _held = inner.writing.enter()?;
            loop {
                let fd = inner.fd.get();
                if fd < 0 {
                    return Err(Error::canceled("file stream is disposed"));
                }
                match write_fd(fd, &data) {
                    Ok(n) => return Ok(n),
                    Err(err) if would_block(&err) => {}
                    Err(err) if is_pipe_error(&err) => {
                        return Err(Error::broken_pipe(err.to_string()))
                    }
                    Err(err) => return Err(err.into()),
                }
                inner.core.poll_fd(fd, POLL_WRITE).await?;
            }
        })
    }

    fn flush(&self) -> Cont<()> {
        // Descriptors have no userspace buffering of their own.
        Cont::unit(())
    }

    fn dispose(&self) {
        let fd = self.inner.fd.replace(-1);
        if fd >= 0 {
            self.inner.core.unpoll(fd);
            if self.inner.closefd {
                // Safety: closing a descriptor we own exactly once.
                unsafe { libc::close(fd) };
            }
        }
    }

    fn disposed(&self) -> bool {
        self.inner.fd.get() < 0
    }

    fn fd(&self) -> Option<RawFd> {
        let fd = self.inner.fd.get();
        (fd >= 0).then_some(fd)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 && self.closefd {
            // Safety: last reference; nothing else owns the descriptor.
            unsafe { libc::close(fd) };
        }
    }
}
