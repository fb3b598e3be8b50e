//! Default durations and deadline helpers for blocking waits.

use crate::error::{ProtocolError, Result};
use std::time::{Duration, Instant};

/// Default timeout for connecting and for each handshake step
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a correlated reply
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait of a single socket read before the connection state is re-checked
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Graceful shutdown budget for the server
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Time left before `deadline`, or `ProtocolError::Timeout` once it has passed.
pub fn deadline_remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or(ProtocolError::Timeout)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_remaining() {
        let future = Instant::now() + Duration::from_secs(60);
        assert!(deadline_remaining(future).unwrap() > Duration::from_secs(59));

        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            deadline_remaining(past),
            Err(ProtocolError::Timeout)
        ));
    }
}
