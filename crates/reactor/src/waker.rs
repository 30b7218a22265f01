use monad::{Error, Result};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Self-pipe used to interrupt the blocking poll. Any thread (and the
/// SIGCHLD handler) may write to it; the owning reactor keeps the read
/// end registered for readability and drains it.
pub struct WakePipe {
    reader: AtomicI32,
    writer: AtomicI32,
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    // Safety: fcntl on a descriptor we just created.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::connection("fcntl(F_SETFL) on wake pipe failed"));
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(Error::connection("fcntl(F_SETFD) on wake pipe failed"));
        }
    }
    Ok(())
}

impl WakePipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds points at a live two-element array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::connection(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(WakePipe {
            reader: AtomicI32::new(fds[0]),
            writer: AtomicI32::new(fds[1]),
        })
    }

    pub fn reader(&self) -> RawFd {
        self.reader.load(Ordering::SeqCst)
    }

    pub fn writer(&self) -> RawFd {
        self.writer.load(Ordering::SeqCst)
    }

    /// Write one byte. A full pipe already guarantees a pending wake.
    pub fn wake(&self) {
        let fd = self.writer();
        if fd >= 0 {
            // Safety: write(2) on a descriptor we own; EAGAIN ignored.
            unsafe { libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1) };
        }
    }

    /// Drain buffered wake bytes. Returns false once the pipe is gone.
    pub fn drain(&self) -> bool {
        let fd = self.reader();
        if fd < 0 {
            return false;
        }
        let mut buffer = [0u8; 4096];
        loop {
            // Safety: reading into a live local buffer.
            let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
            if n > 0 {
                continue;
            }
            if n == 0 {
                return false;
            }
            return std::io::Error::last_os_error().raw_os_error() != Some(libc::EBADF);
        }
    }

    pub fn dispose(&self) {
        for slot in [&self.reader, &self.writer] {
            let fd = slot.swap(-1, Ordering::SeqCst);
            if fd >= 0 {
                // Safety: closing a descriptor we own exactly once.
                unsafe { libc::close(fd) };
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wake_and_drain() {
        let pipe = WakePipe::new().unwrap();
        pipe.wake();
        pipe.wake();
        assert!(pipe.drain());
        // Nothing left; the non-blocking read reports EAGAIN, which
        // still counts as a live pipe.
        assert!(pipe.drain());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let pipe = WakePipe::new().unwrap();
        pipe.dispose();
        pipe.dispose();
        assert_eq!(pipe.reader(), -1);
        pipe.wake(); // no-op on a disposed pipe
    }
}
