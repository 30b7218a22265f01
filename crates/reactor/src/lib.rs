//! Single-threaded cooperative event loop.
//!
//! The reactor multiplexes four queues (timers, descriptor readiness,
//! scheduled thunks and child exits) and drives them with a blocking
//! poller (epoll, kqueue or select, see `PRETZEL_POLLER`). Cross-thread
//! wake-ups go through a dedicated self-pipe; everything else belongs
//! to the owning thread.

mod file;
mod poll;
mod proc;
mod reactor;
mod sched;
mod time;
mod waker;

pub use poll::{Mask, Poller, POLL_DISCONNECT, POLL_ERROR, POLL_READ, POLL_URGENT, POLL_WRITE};
pub use reactor::{Reactor, Remote, DISPOSED, EXECUTING, IDLE};
pub use time::CORE_TIMEOUT;
pub use waker::WakePipe;
