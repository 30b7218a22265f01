use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of framework errors. The kind survives
/// serialization across process boundaries, so peers can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    /// A reactor, queue, connection or scoped resource was disposed
    /// while continuations were still waiting on it.
    #[error("canceled")]
    Canceled,
    /// Hang-up, or EOF on a read that expected more data.
    #[error("broken pipe")]
    BrokenPipe,
    /// Other I/O failure on a descriptor or stream.
    #[error("connection error")]
    Connection,
    /// Child process exited non-zero under check.
    #[error("process error")]
    Process,
    /// Invariant violation: overlapping interest masks, double hub
    /// subscription, expression type errors and the like.
    #[error("value error")]
    Value,
    /// Missing key: expression argument, map entry, registry symbol.
    #[error("key error")]
    Key,
    #[error("timeout")]
    Timeout,
    /// Deserialization touched a module that is still being installed;
    /// the operation should be retried once loading settles.
    #[error("interrupted")]
    Interrupt,
    /// Arbitrary user error propagated verbatim.
    #[error("error")]
    User,
}

/// Framework error: a kind, a message, and a textual trace which
/// accumulates context lines as the error travels through bind chains
/// and across transport hops.
#[derive(Clone, Serialize, Deserialize)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    trace: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn broken_pipe(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BrokenPipe, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The accumulated trace text, oldest context first.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    /// Append a context line to the trace.
    pub fn context(mut self, line: impl AsRef<str>) -> Self {
        self.trace.push_str(line.as_ref());
        self.trace.push('\n');
        self
    }

    /// Append a transport-hop banner, keeping causal chains visible
    /// when the error is re-raised on the other side of a connection.
    pub fn hop(self, banner: impl AsRef<str>) -> Self {
        let line = format!("--- {} ---", banner.as_ref());
        self.context(line)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    pub fn is_broken_pipe(&self) -> bool {
        self.kind == ErrorKind::BrokenPipe
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({}: {})", self.kind, self.message)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

// Trace text is context, not identity.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::BrokenPipe | Io::UnexpectedEof => ErrorKind::BrokenPipe,
            Io::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Connection,
        };
        Error::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trace_accumulates() {
        let err = Error::broken_pipe("socket closed")
            .context("while reading frame header")
            .hop("peer worker-3");
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(
            err.trace(),
            "while reading frame header\n--- peer worker-3 ---\n"
        );
    }

    #[test]
    fn test_equality_ignores_trace() {
        let a = Error::value("bad mask");
        let b = Error::value("bad mask").context("in poll");
        assert_eq!(a, b);
        assert_ne!(a, Error::value("other"));
        assert_ne!(a, Error::key("bad mask"));
    }

    #[test]
    fn test_io_error_mapping() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_broken_pipe());
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
