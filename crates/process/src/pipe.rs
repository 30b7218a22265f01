use monad::{Error, Result};
use reactor::Reactor;
use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;
use stream::{fd_cloexec, BufferedStream, File};

fn close_fd(fd: RawFd) {
    if fd >= 0 {
        // Safety: closing a descriptor this pipe owns.
        unsafe { libc::close(fd) };
    }
}

/// Parent/child descriptor pair with single-side detach semantics.
///
/// Whichever side detaches becomes the sole owner of its descriptor;
/// the other descriptor is closed on that side. The child end survives
/// exec (no close-on-exec) so transports can pass its number to the
/// spawned peer.
pub struct ProcessPipe {
    parent_fd: Cell<RawFd>,
    child_fd: Cell<RawFd>,
}

impl ProcessPipe {
    /// With `parent_reads` the parent owns the read end and the child
    /// writes; otherwise the reverse.
    pub fn new(parent_reads: bool) -> Result<ProcessPipe> {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds points at a live two-element array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::connection(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        let (parent_fd, child_fd) = if parent_reads {
            (fds[0], fds[1])
        } else {
            (fds[1], fds[0])
        };
        // The parent end must not leak into the child's exec image.
        fd_cloexec(parent_fd, true)?;
        Ok(ProcessPipe {
            parent_fd: Cell::new(parent_fd),
            child_fd: Cell::new(child_fd),
        })
    }

    /// The child-side descriptor number, as shipped to the peer.
    pub fn child_fd(&self) -> RawFd {
        self.child_fd.get()
    }

    /// Child-side detach, called between fork and exec: closes the
    /// parent end and leaves (or dups) the child end for the exec'd
    /// image.
    pub fn detach_child(&self, dup_to: Option<RawFd>) -> Result<RawFd> {
        let child = self.child_fd.replace(-1);
        if child < 0 {
            return Err(Error::value("process pipe is disposed"));
        }
        close_fd(self.parent_fd.replace(-1));
        match dup_to {
            Some(target) if target != child => {
                // Safety: dup2 onto a caller-chosen target descriptor.
                if unsafe { libc::dup2(child, target) } < 0 {
                    return Err(Error::connection(format!(
                        "dup2: {}",
                        std::io::Error::last_os_error()
                    )));
                }
                close_fd(child);
                Ok(target)
            }
            _ => Ok(child),
        }
    }

    /// Parent-side detach: closes the child end and wraps the parent
    /// end as a buffered stream on `core`.
    pub fn into_parent_stream(
        &self,
        core: &Reactor,
        bufsize: Option<usize>,
    ) -> Result<BufferedStream> {
        let parent = self.parent_fd.replace(-1);
        if parent < 0 {
            return Err(Error::value("process pipe is disposed"));
        }
        close_fd(self.child_fd.replace(-1));
        Ok(BufferedStream::new(
            Rc::new(File::new(parent, true, core)?),
            bufsize,
        ))
    }

    /// Parent-side bookkeeping after fork: the child inherited its end,
    /// so the parent just closes it.
    pub fn close_child_end(&self) {
        close_fd(self.child_fd.replace(-1));
    }

    pub fn dispose(&self) {
        close_fd(self.parent_fd.replace(-1));
        close_fd(self.child_fd.replace(-1));
    }
}

impl Drop for ProcessPipe {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use stream::Stream;

    #[test]
    fn test_parent_stream_owns_its_side() {
        let core = Reactor::new().unwrap();
        let pipe = ProcessPipe::new(true).unwrap();
        let child_fd = pipe.child_fd();

        let reader = pipe.into_parent_stream(&core, None).unwrap();
        assert_eq!(pipe.child_fd(), -1);

        // The child end was closed by the parent-side detach, so a
        // write to it must fail.
        let payload = [1u8];
        let n = unsafe { libc::write(child_fd, payload.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, -1);

        reader.dispose();
        core.dispose();
    }

    #[test]
    fn test_child_side_detach_keeps_only_the_child_end() {
        // Parent writes, child reads: after the child-side detach the
        // parent end is closed, so a read on the kept end sees EOF.
        let pipe = ProcessPipe::new(false).unwrap();
        let kept = pipe.detach_child(None).unwrap();
        assert_eq!(pipe.child_fd(), -1);

        let mut probe = [0u8; 1];
        let n = unsafe { libc::read(kept, probe.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 0);
        unsafe { libc::close(kept) };
        assert!(pipe.detach_child(None).is_err());
    }

    #[test]
    fn test_double_detach_is_an_error() {
        let core = Reactor::new().unwrap();
        let pipe = ProcessPipe::new(false).unwrap();
        let writer = pipe.into_parent_stream(&core, None).unwrap();
        assert!(pipe.into_parent_stream(&core, None).is_err());
        writer.dispose();
        core.dispose();
    }

    #[test]
    fn test_round_trip_through_both_ends() {
        let core = Reactor::new().unwrap();
        let pipe = ProcessPipe::new(true).unwrap();

        // Simulate the child side in-process: write through the raw
        // child descriptor.
        let child_fd = pipe.child_fd();
        let reader = {
            // Keep the child end open across the parent-side detach.
            let keep = unsafe { libc::dup(child_fd) };
            let reader = pipe.into_parent_stream(&core, None).unwrap();
            let payload = b"over the wall";
            unsafe {
                libc::write(keep, payload.as_ptr() as *const libc::c_void, payload.len());
                libc::close(keep);
            }
            reader
        };

        let read = reader.read_until_eof().promise();
        assert_eq!(
            core.run_until(&read).unwrap(),
            Bytes::from_static(b"over the wall")
        );
        core.dispose();
    }
}
