use crate::file::FileQueue;
use crate::poll::{self, Mask, Poller};
use crate::proc::ProcQueue;
use crate::sched::SchedQueue;
use crate::time::TimeQueue;
use crate::waker::WakePipe;
use common::StateMachine;
use monad::{cont, Cont, Error, Promise, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

pub const IDLE: usize = 0;
pub const EXECUTING: usize = 1;
pub const DISPOSED: usize = 2;

const STATE_NAMES: &[&str] = &["idle", "executing", "disposed"];

struct Inner {
    state: StateMachine,
    tick: Cell<u64>,
    thread: Cell<Option<ThreadId>>,
    time: RefCell<TimeQueue>,
    files: RefCell<HashMap<RawFd, FileQueue>>,
    sched: Arc<SchedQueue>,
    procs: RefCell<ProcQueue>,
    poller: RefCell<Box<dyn Poller>>,
    wake: Arc<WakePipe>,
    pending: RefCell<Vec<(RawFd, Mask)>>,
}

/// Single-threaded cooperative event loop.
///
/// One reactor multiplexes timers, descriptor readiness, scheduled
/// thunks and child exits for the thread that owns it. All methods
/// except `remote()`-mediated scheduling must run on that thread; the
/// reactor binds to the first thread that ticks it and refuses others.
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Clone for Reactor {
    fn clone(&self) -> Self {
        Reactor {
            inner: self.inner.clone(),
        }
    }
}

/// Thread-safe handle for waking the reactor and scheduling thunks
/// from other threads.
#[derive(Clone)]
pub struct Remote {
    sched: Arc<SchedQueue>,
    wake: Arc<WakePipe>,
}

impl Remote {
    /// Enqueue `ret` to run on the reactor thread on its next tick,
    /// and wake the blocking poll.
    pub fn schedule(&self, ret: impl FnOnce(Result<()>) + Send + 'static) {
        self.sched.push(Box::new(ret));
        self.wake.wake();
    }

    pub fn wake(&self) {
        self.wake.wake();
    }
}

thread_local! {
    static LOCAL: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        let poller = poll::from_name(common::poller_name())?;
        let wake = Arc::new(WakePipe::new()?);
        let reactor = Reactor {
            inner: Rc::new(Inner {
                state: StateMachine::new(
                    &[
                        (IDLE, &[IDLE, EXECUTING, DISPOSED]),
                        (EXECUTING, &[IDLE, DISPOSED]),
                        (DISPOSED, &[DISPOSED]),
                    ],
                    STATE_NAMES,
                ),
                tick: Cell::new(0),
                thread: Cell::new(None),
                time: RefCell::new(TimeQueue::new()),
                files: RefCell::new(HashMap::new()),
                sched: Arc::new(SchedQueue::new()),
                procs: RefCell::new(ProcQueue::new()),
                poller: RefCell::new(poller),
                wake,
                pending: RefCell::new(Vec::new()),
            }),
        };
        reactor.spawn_wake_consumer();
        Ok(reactor)
    }

    /// This thread's reactor, created on first use. A disposed local
    /// reactor is replaced by a fresh one.
    pub fn local() -> Result<Reactor> {
        LOCAL.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(reactor) = slot.as_ref() {
                if !reactor.disposed() {
                    return Ok(reactor.clone());
                }
            }
            let reactor = Reactor::new()?;
            *slot = Some(reactor.clone());
            Ok(reactor)
        })
    }

    /// Install `reactor` as this thread's reactor.
    pub fn set_local(reactor: &Reactor) {
        LOCAL.with(|slot| *slot.borrow_mut() = Some(reactor.clone()));
    }

    fn check_alive(inner: &Inner) -> Result<()> {
        if inner.state.is(DISPOSED) {
            return Err(Error::canceled("reactor is disposed"));
        }
        Ok(())
    }

    /// Sleep until `deadline`; resolves with the deadline.
    pub fn sleep_until(&self, deadline: Instant) -> Cont<Instant> {
        let inner = self.inner.clone();
        Cont::new(move |ret| {
            Self::check_alive(&inner)?;
            inner.time.borrow_mut().push(deadline, ret);
            Ok(())
        })
    }

    pub fn sleep(&self, delay: Duration) -> Cont<Instant> {
        self.sleep_until(Instant::now() + delay)
    }

    /// Run on the next tick of this reactor. Same-thread counterpart of
    /// `Remote::schedule`: a zero-deadline timer entry.
    pub fn schedule(&self) -> Cont<()> {
        self.sleep_until(Instant::now()).map(|_| ())
    }

    /// Wait for readiness on `fd`. The mask must be non-empty and must
    /// not intersect an already-pending interest on the same fd.
    pub fn poll_fd(&self, fd: RawFd, mask: Mask) -> Cont<Mask> {
        let inner = self.inner.clone();
        Cont::new(move |ret| {
            Self::check_alive(&inner)?;
            let mut files = inner.files.borrow_mut();
            let queue = files.entry(fd).or_insert_with(|| FileQueue::new(fd));
            let added = queue.add(mask, ret, inner.poller.borrow_mut().as_mut());
            if queue.is_empty() && queue.mask() == 0 {
                files.remove(&fd);
            }
            added
        })
    }

    /// Drop all interest in `fd`, resolving pending waits with a
    /// broken-pipe error. Used when a descriptor is about to be closed.
    pub fn unpoll(&self, fd: RawFd) {
        let resolved = {
            let mut files = self.inner.files.borrow_mut();
            match files.remove(&fd) {
                Some(mut queue) => queue.close(
                    Error::broken_pipe(format!("fd {fd} detached from reactor")),
                    self.inner.poller.borrow_mut().as_mut(),
                ),
                None => Vec::new(),
            }
        };
        for (ret, result) in resolved {
            ret.resolve(result);
        }
    }

    /// Wait for the child `pid` to exit; resolves with its decoded
    /// exit status.
    pub fn waitpid(&self, pid: i32) -> Cont<i32> {
        let inner = self.inner.clone();
        Cont::new(move |ret| {
            Self::check_alive(&inner)?;
            let wake_fd = inner.wake.writer();
            inner.procs.borrow_mut().add(pid as libc::pid_t, ret, wake_fd)
        })
    }

    pub fn remote(&self) -> Remote {
        Remote {
            sched: self.inner.sched.clone(),
            wake: self.inner.wake.clone(),
        }
    }

    pub fn wake(&self) {
        self.inner.wake.wake();
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.tick.get()
    }

    pub fn state(&self) -> usize {
        self.inner.state.state()
    }

    pub fn disposed(&self) -> bool {
        self.inner.state.is(DISPOSED)
    }

    fn dispatch_file(&self, fd: RawFd, events: Mask) {
        let resolved = {
            let mut files = self.inner.files.borrow_mut();
            let Some(queue) = files.get_mut(&fd) else {
                return;
            };
            let resolved = queue.dispatch(events, self.inner.poller.borrow_mut().as_mut());
            if queue.is_empty() {
                files.remove(&fd);
            }
            resolved
        };
        for (ret, result) in resolved {
            ret.resolve(result);
        }
    }

    /// One iteration: dispatch the four queues, then poll for the next
    /// batch of readiness events. Nested ticks (a resolution callback
    /// driving `run_until`) are supported; every dispatch operates on a
    /// drained snapshot.
    pub fn tick(&self, block: bool) -> Result<()> {
        let inner = &self.inner;
        Self::check_alive(inner)?;

        let current = std::thread::current().id();
        match inner.thread.get() {
            None => inner.thread.set(Some(current)),
            Some(owner) if owner == current => {}
            Some(_) => return Err(Error::value("reactor is bound to a different thread")),
        }

        let events = std::mem::take(&mut *inner.pending.borrow_mut());
        for (fd, mask) in events {
            self.dispatch_file(fd, mask);
        }

        let due = inner.time.borrow_mut().dispatch(Instant::now());
        for (ret, deadline) in due {
            ret.value(deadline);
        }

        for ret in inner.sched.drain() {
            ret(Ok(()));
        }

        let reaped = inner.procs.borrow_mut().dispatch();
        for (ret, result) in reaped {
            ret.resolve(result);
        }

        // Let every continuation chain settle before blocking. Ticks
        // may run nested inside a continuation callback (an inline
        // `run_until`), where resolutions queue behind the suspended
        // outer drain; this flushes them.
        monad::trampoline::drain();

        // Control point: a callback above may have stopped or disposed
        // the reactor; do not block on its behalf.
        if inner.state.is(DISPOSED) {
            return Ok(());
        }

        let timeout = if !block || inner.sched.has_pending() {
            Duration::ZERO
        } else {
            inner.time.borrow().timeout(Instant::now())
        };
        {
            let mut pending = inner.pending.borrow_mut();
            inner.poller.borrow_mut().poll(timeout, &mut pending)?;
        }
        inner.tick.set(inner.tick.get() + 1);
        Ok(())
    }

    /// Execute until `stop` or `dispose`.
    pub fn run(&self) -> Result<()> {
        self.inner.state.transition(EXECUTING)?;
        let result = loop {
            if !self.inner.state.is(EXECUTING) {
                break Ok(());
            }
            if let Err(error) = self.tick(true) {
                break Err(error);
            }
        };
        if !self.inner.state.is(DISPOSED) {
            let _ = self.inner.state.transition(IDLE);
        }
        result
    }

    pub fn stop(&self) {
        if self.inner.state.is(EXECUTING) {
            let _ = self.inner.state.transition(IDLE);
        }
    }

    /// Drive ticks inline until `promise` completes. This is how
    /// synchronous call sites (the remote importer) wait for an
    /// asynchronous result, and it nests inside a running reactor.
    pub fn run_until<T: Clone + 'static>(&self, promise: &Promise<T>) -> Result<T> {
        loop {
            if let Some(result) = promise.result() {
                return result;
            }
            Self::check_alive(&self.inner)?;
            self.tick(true)?;
        }
    }

    fn spawn_wake_consumer(&self) {
        let reactor = self.clone();
        let wake = self.inner.wake.clone();
        cont(async move {
            loop {
                if !wake.drain() {
                    break;
                }
                match reactor.poll_fd(wake.reader(), poll::POLL_READ).await {
                    Ok(_) => continue,
                    Err(error) if error.is_canceled() || error.is_broken_pipe() => break,
                    Err(error) => return Err(error),
                }
            }
            Ok(())
        })
        .run_detached();
    }

    /// Tear down: every pending entry on every queue resolves with a
    /// cancellation error, the SIGCHLD slot is released, and the poller
    /// and wake pipe are closed.
    pub fn dispose(&self) {
        if !matches!(self.inner.state.transition(DISPOSED), Ok(true)) {
            return;
        }
        let inner = &self.inner;
        let error = Error::canceled("reactor has been disposed");

        let files = std::mem::take(&mut *inner.files.borrow_mut());
        for (_, mut queue) in files {
            let resolved = queue.close(error.clone(), inner.poller.borrow_mut().as_mut());
            for (ret, result) in resolved {
                ret.resolve(result);
            }
        }

        for ret in inner.time.borrow_mut().drain() {
            ret.error(error.clone());
        }
        for ret in inner.sched.drain() {
            ret(Err(error.clone()));
        }
        for ret in inner.procs.borrow_mut().drain() {
            ret.error(error.clone());
        }

        inner.wake.dispose();
        inner.poller.borrow_mut().dispose();
        monad::trampoline::drain();
        tracing::debug!(ticks = inner.tick.get(), "reactor disposed");
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reactor(state:{}, tick:{})",
            self.inner.state.name(),
            self.inner.tick.get()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::poll::POLL_READ;

    #[test]
    fn test_sleep_race_first_wins() {
        let reactor = Reactor::new().unwrap();
        let fast = reactor.sleep(Duration::from_millis(5)).map(|_| "fast");
        let slow = reactor.sleep(Duration::from_millis(50)).map(|_| "slow");
        let promise = fast.or(slow).promise();
        assert_eq!(reactor.run_until(&promise).unwrap(), "fast");
        reactor.dispose();
    }

    #[test]
    fn test_timer_ordering_within_tick() {
        let reactor = Reactor::new().unwrap();
        let base = Instant::now() + Duration::from_millis(5);
        let order = reactor
            .sleep_until(base)
            .map(|_| 1)
            .and_then({
                let reactor = reactor.clone();
                move |first| {
                    reactor
                        .sleep_until(base + Duration::from_millis(1))
                        .map(move |_| (first, 2))
                }
            })
            .promise();
        assert_eq!(reactor.run_until(&order).unwrap(), (1, 2));
        reactor.dispose();
    }

    #[test]
    fn test_stop_returns_from_run() {
        let reactor = Reactor::new().unwrap();
        let stopper = reactor.clone();
        reactor
            .sleep(Duration::from_millis(1))
            .map(move |_| stopper.stop())
            .run_detached();
        reactor.run().unwrap();
        assert_eq!(reactor.state(), IDLE);
        reactor.dispose();
        assert_eq!(reactor.state(), DISPOSED);
    }

    #[test]
    fn test_pipe_readiness() {
        let reactor = Reactor::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [reader, writer] = fds;

        let readable = reactor.poll_fd(reader, POLL_READ).promise();
        let write_soon = reactor.sleep(Duration::from_millis(1)).map(move |_| {
            let payload = [7u8];
            unsafe { libc::write(writer, payload.as_ptr() as *const libc::c_void, 1) };
        });
        write_soon.run_detached();

        let mask = reactor.run_until(&readable).unwrap();
        assert!(mask & POLL_READ != 0);

        reactor.dispose();
        unsafe {
            libc::close(reader);
            libc::close(writer);
        }
    }

    #[test]
    fn test_remote_schedule_crosses_threads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let reactor = Reactor::new().unwrap();
        let remote = reactor.remote();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            remote.schedule(move |result| {
                assert!(result.is_ok());
                flag.store(true, Ordering::SeqCst);
            });
        });

        // The wake-pipe write interrupts the blocking poll; without it
        // this loop would sit in poll for the full core timeout.
        while !fired.load(Ordering::SeqCst) {
            reactor.tick(true).unwrap();
        }
        reactor.dispose();
    }

    #[test]
    fn test_dispose_cancels_pending_entries() {
        let reactor = Reactor::new().unwrap();
        let parked = reactor.sleep(Duration::from_secs(600)).promise();
        reactor.dispose();
        let error = parked.result().unwrap().unwrap_err();
        assert!(error.is_canceled());

        // New registrations on a disposed reactor fail immediately.
        let late = reactor.sleep(Duration::from_millis(1)).promise();
        assert!(late.result().unwrap().unwrap_err().is_canceled());
    }

    #[test]
    fn test_child_exit_is_reaped() {
        let reactor = Reactor::new().unwrap();
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        // The reactor owns reaping; keep std from waiting on drop.
        std::mem::forget(child);

        let status = reactor.waitpid(pid).promise();
        assert_eq!(reactor.run_until(&status).unwrap(), 0);
        reactor.dispose();
    }
}
