//! Asynchronous byte streams: the base stream trait, the FIFO rope
//! buffer, buffered streams with pattern reads and coalesced writes,
//! and descriptor-backed streams (files, pipes, sockets).

mod buffer;
mod buffered;
mod file;
mod pipe;
mod sock;
mod stream;

pub use buffer::Buffer;
pub use buffered::BufferedStream;
pub use file::{fd_blocking, fd_cloexec, File};
pub use pipe::Pipe;
pub use sock::{Listener, Socket};
pub use stream::{Guard, GuardHeld, Stream};
