//! Reconnect policy helpers.
//!
//! The policy here governs long-lived connections only. Authenticated API
//! requests are never routed through it; their single auth retry is handled
//! by the session client itself.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive reconnect attempts before giving up.
    pub max_attempts: usize,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each reconnect delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Returns a default suitable for a browser-dashboard style client:
    /// a handful of attempts spread over several seconds.
    pub fn bounded() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::bounded()
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let span_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if span_nanos == 0 {
        return Duration::ZERO;
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // splitmix64 step; the attempt offset keeps consecutive attempts from
    // drawing near-identical values off the clock.
    let mut word = seed.wrapping_add((attempt as u64).wrapping_mul(0xA076_1D64_78BD_642F));
    word = (word ^ (word >> 33)).wrapping_mul(0xE703_7ED1_A0B4_28DB);
    word ^= word >> 29;
    Duration::from_nanos(word % (span_nanos + 1))
}
