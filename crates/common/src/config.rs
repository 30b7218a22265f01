//! Environment configuration, read once at first use.

use std::sync::OnceLock;
use std::time::Duration;

/// Default buffered-stream chunk size.
pub const DEFAULT_BUFSIZE: usize = 65536;

/// `PRETZEL_BUFSIZE`: buffered-stream chunk size.
pub fn bufsize() -> usize {
    static BUFSIZE: OnceLock<usize> = OnceLock::new();
    *BUFSIZE.get_or_init(|| {
        std::env::var("PRETZEL_BUFSIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BUFSIZE)
    })
}

/// `PRETZEL_TEST_TIMEOUT`: async test wall-clock timeout in seconds.
pub fn test_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let secs = std::env::var("PRETZEL_TEST_TIMEOUT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(5.0f64);
        Duration::from_secs_f64(secs)
    })
}

/// `PRETZEL_POLLER`: readiness backend name (epoll, kqueue or select).
pub fn poller_name() -> Option<&'static str> {
    static POLLER: OnceLock<Option<String>> = OnceLock::new();
    POLLER
        .get_or_init(|| std::env::var("PRETZEL_POLLER").ok())
        .as_deref()
}
