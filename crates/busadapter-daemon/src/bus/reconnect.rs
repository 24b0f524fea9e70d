//! Back-off schedule used by the MQTT dispatch task between reconnect
//! attempts.

use std::time::Duration;

const FIRST_RETRY: Duration = Duration::from_secs(1);
const LONGEST_WAIT: Duration = Duration::from_secs(60);

/// How long the dispatch task sleeps after the broker connection drops.
///
/// The wait starts at `initial_delay` and is multiplied by `multiplier`
/// after every failed reconnect, up to `max_delay`. A successful CONNACK
/// resets the count. With `max_attempts` set, the dispatcher stops after
/// that many failures and every subscription stream closes.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` keeps reconnecting for as long as the client is open.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: FIRST_RETRY,
            max_delay: LONGEST_WAIT,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever, waiting `delay` between attempts.
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// A policy that gives up after the first lost connection.
    pub const fn never() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: Some(0),
        }
    }

    /// Delay before attempt `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
