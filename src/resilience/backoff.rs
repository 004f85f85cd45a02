//! Capped exponential backoff for accept loops.

use std::io;
use std::time::Duration;

/// Delay before the first retry.
pub const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(1);

/// Upper bound for a single retry delay.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Backoff state for consecutive transient accept failures.
///
/// Starts at [`ACCEPT_BACKOFF_BASE`], doubles on every consecutive failure and
/// is capped at [`ACCEPT_BACKOFF_MAX`]. A successful accept resets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptBackoff {
    current: Duration,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next delay and return it.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            ACCEPT_BACKOFF_BASE
        } else {
            (self.current * 2).min(ACCEPT_BACKOFF_MAX)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Whether an accept error is worth retrying.
///
/// Aborted or reset handshakes and descriptor exhaustion clear up on their own;
/// anything else means the listener is unusable.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    // ENFILE / EMFILE
    #[cfg(unix)]
    if matches!(err.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = AcceptBackoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_delay();
        }
        assert_eq!(last, ACCEPT_BACKOFF_MAX);
    }

    #[test]
    fn test_backoff_resets() {
        let mut backoff = AcceptBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_BASE);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_transient(&io::Error::other("listener closed")));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }
}
