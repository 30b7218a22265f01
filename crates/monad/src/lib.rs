//! Continuation monad over value-or-error results.
//!
//! `Cont<T>` is the single-shot asynchronous primitive of the framework:
//! a runner which eventually invokes its return function at most once
//! with a `Result<T>`. Sequential composition is `and_then`, racing is
//! `or`, aggregation is `all`, and `cont(async { .. })` bridges Rust's
//! native async blocks into continuations.

mod cont;
mod error;
mod promise;
mod task;
pub mod trampoline;

pub use cont::{Cont, Ret};
pub use error::{Error, ErrorKind};
pub use promise::Promise;
pub use task::{cont, ContFuture};

/// Result alias used throughout the framework.
pub type Result<T, E = Error> = std::result::Result<T, E>;
