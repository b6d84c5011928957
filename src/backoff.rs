//! Reconnect backoff policy for the websocket transport.
//!
//! The policy is transport-agnostic: it only computes delays. The worker in
//! [`crate::transport::ws`] decides when a delay applies.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive failed attempts before giving up.
    ///
    /// `None` keeps reconnecting forever.
    pub max_attempts: Option<usize>,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(50);

    /// Policy that never reconnects, neither after a failed attempt nor after
    /// a dropped session.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Returns true when another attempt is allowed after `failed` failures.
    pub fn allows_attempt(&self, failed: usize) -> bool {
        self.max_attempts.map_or(true, |max| failed <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Self::INITIAL_BACKOFF,
            max_backoff: Self::MAX_BACKOFF,
            jitter: Self::JITTER,
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
