//! Reconnection Backoff
//!
//! Exponential backoff with jitter and a retry cap for upstream
//! connections. The delay for attempt `n` (1-based) is
//! `initial * multiplier^(n-1)`, capped at `max_delay`, then spread by
//! `±jitter_factor`.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::UpstreamSettings;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fractional spread applied to each delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries allowed per outage (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Build from upstream settings.
    #[must_use]
    pub const fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Un-jittered delay for a 1-based attempt number.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let scaled = (self.initial_delay.as_millis() as f64 * factor).round();
        let ceiling = self.max_delay.as_millis() as f64;
        if !scaled.is_finite() || scaled >= ceiling {
            return self.max_delay;
        }
        Duration::from_millis(scaled as u64)
    }
}

/// Tracks retries within one outage.
///
/// ```rust
/// use broker_stream_proxy::infrastructure::broker::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig { max_attempts: 2, ..Default::default() });
/// assert!(policy.next_delay().is_some());
/// assert!(policy.next_delay().is_some());
/// assert!(policy.next_delay().is_none());
///
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// New policy with no attempts made.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the cap is reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.jitter(self.config.base_delay(self.attempts)))
    }

    /// Forget the outage after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts scheduled in the current outage.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Configured cap (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// True once every allowed retry has been used.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return delay;
        }
        let factor = factor.min(1.0);
        let spread = rand::rng().random_range(-factor..=factor);
        let millis = (delay.as_millis() as f64 * (1.0 + spread)).round().max(1.0);
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn delays_grow_then_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let delays: Vec<_> = (0..6).filter_map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
            ]
        );
    }

    #[test]
    fn cap_stops_retries() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));
        for expected in 1..=3 {
            assert!(policy.next_delay().is_some());
            assert_eq!(policy.attempt_count(), expected);
        }
        assert!(policy.is_exhausted());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert!(!policy.is_exhausted());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            jitter_factor: 0.1,
            max_attempts: 0,
            ..ReconnectConfig::default()
        };
        for _ in 0..200 {
            let mut policy = ReconnectPolicy::new(config.clone());
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for jitter_factor in [f64::NAN, f64::INFINITY] {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor,
                ..no_jitter(0)
            });
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
        }
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let config = no_jitter(0);
        assert_eq!(config.base_delay(10_000), Duration::from_millis(1000));
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn unlimited_never_exhausts() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        for _ in 0..500 {
            assert!(policy.next_delay().is_some());
        }
        assert!(!policy.is_exhausted());
    }
}
