//! Readiness pollers. The reactor speaks the crate's own mask bits;
//! each backend translates to and from its native event flags.

use monad::{Error, Result};
use std::os::fd::RawFd;
use std::time::Duration;

pub type Mask = u32;

pub const POLL_READ: Mask = 1 << 0;
pub const POLL_WRITE: Mask = 1 << 1;
pub const POLL_URGENT: Mask = 1 << 2;
/// Peer hang-up.
pub const POLL_DISCONNECT: Mask = 1 << 3;
/// Any error condition, hang-up included.
pub const POLL_ERROR: Mask = (1 << 4) | POLL_DISCONNECT;

pub trait Poller {
    fn name(&self) -> &'static str;
    fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()>;
    fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()>;
    fn unregister(&mut self, fd: RawFd) -> Result<()>;
    /// Wait up to `timeout` and append (fd, readiness) pairs to
    /// `events`. An interrupted wait returns with no events.
    fn poll(&mut self, timeout: Duration, events: &mut Vec<(RawFd, Mask)>) -> Result<()>;
    fn dispose(&mut self) {}
}

/// Build a poller by name, or the platform default (epoll where
/// available, else kqueue, else select).
pub fn from_name(name: Option<&str>) -> Result<Box<dyn Poller>> {
    match name {
        None => default_poller(),
        Some("epoll") => epoll_poller(),
        Some("kqueue") => kqueue_poller(),
        Some("select") => Ok(Box::new(select::SelectPoller::new())),
        Some(other) => Err(Error::value(format!("unknown poller backend: {other}"))),
    }
}

#[cfg(target_os = "linux")]
fn default_poller() -> Result<Box<dyn Poller>> {
    epoll_poller()
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn default_poller() -> Result<Box<dyn Poller>> {
    kqueue_poller()
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn default_poller() -> Result<Box<dyn Poller>> {
    Ok(Box::new(select::SelectPoller::new()))
}

#[cfg(target_os = "linux")]
fn epoll_poller() -> Result<Box<dyn Poller>> {
    Ok(Box::new(epoll::EpollPoller::new()?))
}

#[cfg(not(target_os = "linux"))]
fn epoll_poller() -> Result<Box<dyn Poller>> {
    Err(Error::value("epoll is not supported on this platform"))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn kqueue_poller() -> Result<Box<dyn Poller>> {
    Ok(Box::new(kqueue::KqueuePoller::new()?))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn kqueue_poller() -> Result<Box<dyn Poller>> {
    Err(Error::value("kqueue is not supported on this platform"))
}

fn os_error(op: &str) -> Error {
    let err = std::io::Error::last_os_error();
    Error::connection(format!("{op}: {err}"))
}

fn interrupted() -> bool {
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

#[cfg(target_os = "linux")]
mod epoll {
    use super::*;
    use std::collections::HashSet;

    pub struct EpollPoller {
        epfd: RawFd,
        fds: HashSet<RawFd>,
        buffer: Vec<libc::epoll_event>,
    }

    fn to_native(mask: Mask) -> u32 {
        let mut events = 0;
        if mask & POLL_READ != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if mask & POLL_WRITE != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        if mask & POLL_URGENT != 0 {
            events |= libc::EPOLLPRI as u32;
        }
        events
    }

    fn from_native(events: u32) -> Mask {
        let mut mask = 0;
        if events & libc::EPOLLIN as u32 != 0 {
            mask |= POLL_READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            mask |= POLL_WRITE;
        }
        if events & libc::EPOLLPRI as u32 != 0 {
            mask |= POLL_URGENT;
        }
        if events & libc::EPOLLHUP as u32 != 0 {
            mask |= POLL_DISCONNECT;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            mask |= POLL_ERROR;
        }
        mask
    }

    impl EpollPoller {
        pub fn new() -> Result<Self> {
            // Safety: plain syscall; the returned descriptor is owned here.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(os_error("epoll_create1"));
            }
            Ok(EpollPoller {
                epfd,
                fds: HashSet::new(),
                buffer: Vec::with_capacity(256),
            })
        }

        fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: Mask) -> Result<()> {
            let mut event = libc::epoll_event {
                events: to_native(mask),
                u64: fd as u64,
            };
            // Safety: `event` outlives the call; epfd and fd are live.
            let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
            if rc < 0 {
                return Err(os_error("epoll_ctl"));
            }
            Ok(())
        }
    }

    impl Poller for EpollPoller {
        fn name(&self) -> &'static str {
            "epoll"
        }

        fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, mask)?;
            self.fds.insert(fd);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
        }

        fn unregister(&mut self, fd: RawFd) -> Result<()> {
            if self.fds.remove(&fd) {
                self.ctl(libc::EPOLL_CTL_DEL, fd, 0)?;
            }
            Ok(())
        }

        fn poll(&mut self, timeout: Duration, events: &mut Vec<(RawFd, Mask)>) -> Result<()> {
            // Round a sub-millisecond timeout up so we never busy-spin.
            let millis = if timeout.is_zero() {
                0
            } else {
                timeout.as_millis().clamp(1, i32::MAX as u128) as i32
            };

            self.buffer.clear();
            let capacity = self.buffer.capacity();
            // Safety: epoll_wait writes at most `capacity` entries, and
            // set_len is only called with the count it reports.
            let count = unsafe {
                let count = libc::epoll_wait(
                    self.epfd,
                    self.buffer.as_mut_ptr(),
                    capacity as libc::c_int,
                    millis,
                );
                if count < 0 {
                    if interrupted() {
                        return Ok(());
                    }
                    return Err(os_error("epoll_wait"));
                }
                self.buffer.set_len(count as usize);
                count as usize
            };

            for index in 0..count {
                let event = self.buffer[index];
                events.push((event.u64 as RawFd, from_native(event.events)));
            }
            Ok(())
        }

        fn dispose(&mut self) {
            if self.epfd >= 0 {
                // Safety: closing the descriptor we created.
                unsafe { libc::close(self.epfd) };
                self.epfd = -1;
            }
        }
    }

    impl Drop for EpollPoller {
        fn drop(&mut self) {
            self.dispose();
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue {
    use super::*;
    use std::collections::HashMap;

    pub struct KqueuePoller {
        kq: RawFd,
        fds: HashMap<RawFd, Mask>,
    }

    impl KqueuePoller {
        pub fn new() -> Result<Self> {
            // Safety: plain syscall; the returned descriptor is owned here.
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(os_error("kqueue"));
            }
            Ok(KqueuePoller {
                kq,
                fds: HashMap::new(),
            })
        }

        fn change(&mut self, fd: RawFd, filter: i16, flags: u16) -> Result<()> {
            let change = libc::kevent {
                ident: fd as libc::uintptr_t,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            // Safety: `change` outlives the call.
            let rc = unsafe {
                libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if rc < 0 {
                return Err(os_error("kevent"));
            }
            Ok(())
        }

        fn apply(&mut self, fd: RawFd, old: Mask, new: Mask) -> Result<()> {
            if new & POLL_READ != 0 && old & POLL_READ == 0 {
                self.change(fd, libc::EVFILT_READ, libc::EV_ADD)?;
            }
            if new & POLL_READ == 0 && old & POLL_READ != 0 {
                self.change(fd, libc::EVFILT_READ, libc::EV_DELETE)?;
            }
            if new & POLL_WRITE != 0 && old & POLL_WRITE == 0 {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD)?;
            }
            if new & POLL_WRITE == 0 && old & POLL_WRITE != 0 {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)?;
            }
            Ok(())
        }
    }

    impl Poller for KqueuePoller {
        fn name(&self) -> &'static str {
            "kqueue"
        }

        fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            self.apply(fd, 0, mask)?;
            self.fds.insert(fd, mask);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            let old = self.fds.get(&fd).copied().unwrap_or(0);
            self.apply(fd, old, mask)?;
            self.fds.insert(fd, mask);
            Ok(())
        }

        fn unregister(&mut self, fd: RawFd) -> Result<()> {
            if let Some(old) = self.fds.remove(&fd) {
                self.apply(fd, old, 0)?;
            }
            Ok(())
        }

        fn poll(&mut self, timeout: Duration, events: &mut Vec<(RawFd, Mask)>) -> Result<()> {
            let spec = libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            let mut buffer: [libc::kevent; 64] = unsafe { std::mem::zeroed() };
            // Safety: `buffer` holds up to 64 entries as declared.
            let count = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    buffer.as_mut_ptr(),
                    buffer.len() as libc::c_int,
                    &spec,
                )
            };
            if count < 0 {
                if interrupted() {
                    return Ok(());
                }
                return Err(os_error("kevent"));
            }

            for event in &buffer[..count as usize] {
                let fd = event.ident as RawFd;
                let mut mask = match event.filter {
                    libc::EVFILT_READ => POLL_READ,
                    libc::EVFILT_WRITE => POLL_WRITE,
                    _ => continue,
                };
                if event.flags & libc::EV_EOF != 0 {
                    mask |= POLL_DISCONNECT;
                }
                if event.flags & libc::EV_ERROR != 0 {
                    mask |= POLL_ERROR;
                }
                events.push((fd, mask));
            }
            Ok(())
        }

        fn dispose(&mut self) {
            if self.kq >= 0 {
                // Safety: closing the descriptor we created.
                unsafe { libc::close(self.kq) };
                self.kq = -1;
            }
        }
    }

    impl Drop for KqueuePoller {
        fn drop(&mut self) {
            self.dispose();
        }
    }
}

mod select {
    use super::*;
    use std::collections::HashMap;

    /// Portable fallback built on select(2). Only read/write interest
    /// is supported; error conditions surface on both sets.
    pub struct SelectPoller {
        fds: HashMap<RawFd, Mask>,
    }

    const SUPPORTED: Mask = POLL_READ | POLL_WRITE;

    impl SelectPoller {
        pub fn new() -> Self {
            SelectPoller {
                fds: HashMap::new(),
            }
        }
    }

    impl Poller for SelectPoller {
        fn name(&self) -> &'static str {
            "select"
        }

        fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            if mask & !SUPPORTED != 0 {
                return Err(Error::value(format!("unsupported event mask: {mask:#x}")));
            }
            if fd as usize >= libc::FD_SETSIZE {
                return Err(Error::value(format!(
                    "descriptor {fd} exceeds FD_SETSIZE"
                )));
            }
            self.fds.insert(fd, mask);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
            self.register(fd, mask)
        }

        fn unregister(&mut self, fd: RawFd) -> Result<()> {
            self.fds.remove(&fd);
            Ok(())
        }

        fn poll(&mut self, timeout: Duration, events: &mut Vec<(RawFd, Mask)>) -> Result<()> {
            // Safety: fd_set is plain data; FD_* only touch the sets.
            unsafe {
                let mut read: libc::fd_set = std::mem::zeroed();
                let mut write: libc::fd_set = std::mem::zeroed();
                let mut error: libc::fd_set = std::mem::zeroed();
                libc::FD_ZERO(&mut read);
                libc::FD_ZERO(&mut write);
                libc::FD_ZERO(&mut error);

                let mut max_fd = -1;
                for (fd, mask) in &self.fds {
                    if mask & POLL_READ != 0 {
                        libc::FD_SET(*fd, &mut read);
                    }
                    if mask & POLL_WRITE != 0 {
                        libc::FD_SET(*fd, &mut write);
                    }
                    libc::FD_SET(*fd, &mut error);
                    max_fd = max_fd.max(*fd);
                }

                let mut tv = libc::timeval {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_usec: timeout.subsec_micros() as libc::suseconds_t,
                };
                let rc = libc::select(
                    max_fd + 1,
                    &mut read,
                    &mut write,
                    &mut error,
                    &mut tv,
                );
                if rc < 0 {
                    if interrupted() {
                        return Ok(());
                    }
                    return Err(os_error("select"));
                }

                for (fd, _) in &self.fds {
                    let mut mask = 0;
                    if libc::FD_ISSET(*fd, &read) {
                        mask |= POLL_READ;
                    }
                    if libc::FD_ISSET(*fd, &write) {
                        mask |= POLL_WRITE;
                    }
                    if libc::FD_ISSET(*fd, &error) {
                        mask |= POLL_ERROR;
                    }
                    if mask != 0 {
                        events.push((*fd, mask));
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unknown_backend_is_a_value_error() {
        let err = match from_name(Some("uring")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), monad::ErrorKind::Value);
    }

    #[test]
    fn test_default_backend_builds() {
        let poller = from_name(None).unwrap();
        assert!(!poller.name().is_empty());
    }

    #[test]
    fn test_select_rejects_unsupported_mask() {
        let mut poller = select::SelectPoller::new();
        assert!(poller.register(0, POLL_URGENT).is_err());
    }
}
