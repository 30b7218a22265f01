//! Small shared pieces: the state-machine guard, disposer composition,
//! multicast events, and environment configuration.

mod config;
mod dispose;
mod event;
mod state;

pub use config::{bufsize, poller_name, test_timeout, DEFAULT_BUFSIZE};
pub use dispose::{CompDisp, FuncDisp};
pub use event::{Event, EventQueue};
pub use state::StateMachine;
