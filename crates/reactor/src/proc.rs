//! Child-exit queue and the SIGCHLD funnel.
//!
//! Only one reactor per process may own child reaping: the signal slot
//! and the non-blocking waitpid sweep race otherwise. The handler only
//! sets an atomic flag and writes one byte to the owning reactor's wake
//! pipe, both async-signal-safe.

use monad::{Error, Result, Ret};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SIGCHLD_PENDING: AtomicBool = AtomicBool::new(false);
static SIGCHLD_WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static SIGCHLD_CLAIMED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: libc::c_int) {
    SIGCHLD_PENDING.store(true, Ordering::SeqCst);
    let fd = SIGCHLD_WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // Safety: write(2) is async-signal-safe; a full pipe is fine,
        // the pending flag already records the signal.
        unsafe { libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1) };
    }
}

pub(crate) struct ProcQueue {
    pids: HashMap<libc::pid_t, Ret<i32>>,
    owner: bool,
}

/// Decode a waitpid status: exit code for a normal exit, 128 + signal
/// for a termination by signal.
fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

fn wait_nohang(pid: libc::pid_t) -> Result<Option<i32>> {
    let mut status: libc::c_int = 0;
    // Safety: status points at a live local.
    let done = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if done == pid {
        Ok(Some(decode_status(status)))
    } else if done < 0 {
        let err = std::io::Error::last_os_error();
        Err(Error::process(format!("waitpid({pid}): {err}")))
    } else {
        Ok(None)
    }
}

impl ProcQueue {
    pub fn new() -> Self {
        ProcQueue {
            pids: HashMap::new(),
            owner: false,
        }
    }

    /// Claim the process-wide SIGCHLD slot for this queue.
    fn claim(&mut self, wake_fd: RawFd) -> Result<()> {
        if self.owner {
            return Ok(());
        }
        if SIGCHLD_CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(Error::value(
                "child reaping is already owned by another reactor",
            ));
        }
        self.owner = true;
        SIGCHLD_WAKE_FD.store(wake_fd, Ordering::SeqCst);

        // Safety: installing a handler which only touches atomics and
        // write(2).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigchld as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
        }
        Ok(())
    }

    /// Wait for `pid`. Resolves immediately if the child already exited.
    pub fn add(&mut self, pid: libc::pid_t, ret: Ret<i32>, wake_fd: RawFd) -> Result<()> {
        self.claim(wake_fd)?;
        match wait_nohang(pid)? {
            Some(status) => {
                ret.value(status);
                Ok(())
            }
            None => {
                if self.pids.contains_key(&pid) {
                    return Err(Error::value(format!("pid {pid} is already being waited")));
                }
                self.pids.insert(pid, ret);
                Ok(())
            }
        }
    }

    /// Sweep registered pids if the signal flag is set. Returns the
    /// resolutions for the caller to run outside any borrow.
    pub fn dispatch(&mut self) -> Vec<(Ret<i32>, Result<i32>)> {
        if !SIGCHLD_PENDING.swap(false, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut resolved = Vec::new();
        let pids: Vec<libc::pid_t> = self.pids.keys().copied().collect();
        for pid in pids {
            match wait_nohang(pid) {
                Ok(Some(status)) => {
                    let ret = self.pids.remove(&pid).expect("pid is registered");
                    resolved.push((ret, Ok(status)));
                }
                Ok(None) => {}
                Err(error) => {
                    let ret = self.pids.remove(&pid).expect("pid is registered");
                    resolved.push((ret, Err(error)));
                }
            }
        }
        resolved
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// Release the SIGCHLD slot and swap out the registered waits. The
    /// caller resolves the returned rets; the swapped map, not the
    /// freshly emptied field, is what gets walked.
    pub fn drain(&mut self) -> Vec<Ret<i32>> {
        if self.owner {
            // Safety: restoring the default disposition.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
            }
            SIGCHLD_WAKE_FD.store(-1, Ordering::SeqCst);
            SIGCHLD_CLAIMED.store(false, Ordering::SeqCst);
            self.owner = false;
        }
        let pids = std::mem::take(&mut self.pids);
        pids.into_values().collect()
    }
}
