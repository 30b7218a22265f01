//! Child-process supervision: fork/exec with full stdio control, a
//! status pipe carrying serialized exec errors, exit collection through
//! the reactor's child queue, and pipeline call helpers.

mod call;
mod pipe;
mod process;

pub use call::{process_call, process_chain_call};
pub use pipe::ProcessPipe;
pub use process::{Process, ProcessOpts, Stdio, EXEC_FAILURE_CODE};
