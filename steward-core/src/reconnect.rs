//! Reconnection back-off tracking.
//!
//! Workers and clients that lose their broker reconnect with exponential
//! back-off: the first delay is the configured base interval and every
//! subsequent attempt doubles it up to a cap.

use crate::config::FabricConfig;
use std::time::Duration;

/// Tracks reconnection attempts and computes the next back-off delay.
///
/// # Example
///
/// ```rust
/// use steward_core::reconnect::ReconnectState;
/// use steward_core::config::FabricConfig;
/// use std::time::Duration;
///
/// let config = FabricConfig::default()
///     .with_reconnect_interval(Duration::from_millis(100))
///     .with_reconnect_max(Duration::from_secs(10));
///
/// let mut reconnect = ReconnectState::new(&config);
///
/// // First attempt uses the base interval
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
///
/// // Subsequent attempts double
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(400));
///
/// // Reset on successful connection
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    /// Number of delays handed out since the last reset
    attempt: u32,
    current_interval: Duration,
}

impl ReconnectState {
    /// Create a new back-off tracker from the fabric configuration.
    pub fn new(config: &FabricConfig) -> Self {
        let base = config.reconnect_base();
        Self {
            base_interval: base,
            max_interval: config.reconnect_max.max(base),
            attempt: 0,
            current_interval: base,
        }
    }

    /// Get the delay to apply before the next reconnection attempt.
    ///
    /// Doubles the interval for the following attempt, capped at the
    /// configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self
            .current_interval
            .saturating_mul(2)
            .min(self.max_interval);

        delay
    }

    /// Reset the back-off after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    /// Get the current attempt number.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Get the base reconnection interval.
    #[inline]
    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Get the maximum reconnection interval.
    #[inline]
    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        self.max_interval
    }
}
