use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_COOLDOWN_SECS: u64 = 5 * 60;
const DEFAULT_LIMITERS_BURST: u64 = 1000;
const DEFAULT_LIMITERS_INTERVAL_SECS: u64 = 60;

/// Validated configuration for token-bucket detectors.
///
/// - `limiters_burst`: tokens in a full bucket, i.e. calls allowed before a herd is flagged.
/// - `limiters_interval`: time to refill one token.
/// - `cooldown_interval`: how long a fingerprint skips herd checks after an episode.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TokenBucketConfig {
    #[cfg_attr(feature = "serde", serde(rename = "cooldown_ms", with = "duration_ms"))]
    cooldown_interval: Duration,
    limiters_burst: u64,
    #[cfg_attr(feature = "serde", serde(rename = "limiters_interval_ms", with = "duration_ms"))]
    limiters_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            cooldown_interval: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            limiters_burst: DEFAULT_LIMITERS_BURST,
            limiters_interval: Duration::from_secs(DEFAULT_LIMITERS_INTERVAL_SECS),
        }
    }
}

impl TokenBucketConfig {
    /// Create a config with validation.
    ///
    /// # Examples
    /// ```
    /// use herdgate::TokenBucketConfig;
    /// use std::time::Duration;
    /// let cfg = TokenBucketConfig::new(1, Duration::from_secs(60), Duration::from_secs(600)).unwrap();
    /// assert_eq!(cfg.limiters_burst(), 1);
    /// ```
    pub fn new(
        limiters_burst: u64,
        limiters_interval: Duration,
        cooldown_interval: Duration,
    ) -> Result<Self, ConfigError> {
        Self { cooldown_interval, limiters_burst, limiters_interval }.validate()
    }

    /// `requests` calls per minute: a bucket of `requests` tokens refilling one token
    /// every `1 min / requests`.
    ///
    /// # Errors
    /// Returns `Err` if `requests` is zero or larger than `u32::MAX`.
    pub fn per_minute(requests: u64) -> Result<Self, ConfigError> {
        let divisor = match u32::try_from(requests) {
            Ok(n) if n > 0 => n,
            _ => return Err(ConfigError::InvalidRate(requests)),
        };
        Self::default()
            .with_limiters_burst(requests)
            .with_limiters_interval(Duration::from_secs(60) / divisor)
            .validate()
    }

    pub fn with_cooldown_interval(mut self, interval: Duration) -> Self {
        self.cooldown_interval = interval;
        self
    }

    pub fn with_limiters_burst(mut self, burst: u64) -> Self {
        self.limiters_burst = burst;
        self
    }

    pub fn with_limiters_interval(mut self, interval: Duration) -> Self {
        self.limiters_interval = interval;
        self
    }

    /// Check every field, returning the config unchanged if it is usable.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.limiters_burst == 0 {
            return Err(ConfigError::InvalidBurst(self.limiters_burst));
        }
        if self.limiters_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(self.limiters_interval));
        }
        if self.cooldown_interval.is_zero() {
            return Err(ConfigError::InvalidCoolDown(self.cooldown_interval));
        }
        Ok(self)
    }

    pub fn cooldown_interval(&self) -> Duration {
        self.cooldown_interval
    }

    pub fn limiters_burst(&self) -> u64 {
        self.limiters_burst
    }

    pub fn limiters_interval(&self) -> Duration {
        self.limiters_interval
    }

    /// Tokens added per second.
    pub fn refill_rate_per_sec(&self) -> f64 {
        1.0 / self.limiters_interval.as_secs_f64()
    }

    /// Time for an empty bucket to fill up again (`burst × interval`). Idle bucket
    /// state may be reclaimed after this long.
    pub fn full_bucket_period(&self) -> Duration {
        self.limiters_interval.saturating_mul(u32::try_from(self.limiters_burst).unwrap_or(u32::MAX))
    }

    /// `full_bucket_period` in whole seconds, rounded up; used as a store-side TTL.
    pub fn full_bucket_period_secs(&self) -> u64 {
        (self.limiters_burst as f64 / self.refill_rate_per_sec()).ceil().max(1.0) as u64
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TokenBucketConfig::default();
        assert_eq!(cfg.cooldown_interval(), Duration::from_secs(300));
        assert_eq!(cfg.limiters_burst(), 1000);
        assert_eq!(cfg.limiters_interval(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_values() {
        assert_eq!(
            TokenBucketConfig::new(0, Duration::from_secs(1), Duration::from_secs(1)),
            Err(ConfigError::InvalidBurst(0))
        );
        assert_eq!(
            TokenBucketConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
            Err(ConfigError::InvalidInterval(Duration::ZERO))
        );
        assert_eq!(
            TokenBucketConfig::new(1, Duration::from_secs(1), Duration::ZERO),
            Err(ConfigError::InvalidCoolDown(Duration::ZERO))
        );
        assert_eq!(TokenBucketConfig::per_minute(0), Err(ConfigError::InvalidRate(0)));
    }

    #[test]
    fn per_minute_sets_burst_and_refill_rate() {
        let cfg = TokenBucketConfig::per_minute(120).unwrap();
        assert_eq!(cfg.limiters_burst(), 120);
        assert_eq!(cfg.limiters_interval(), Duration::from_millis(500));
        assert!((cfg.refill_rate_per_sec() - 2.0).abs() < 1e-9);
        assert_eq!(cfg.full_bucket_period(), Duration::from_secs(60));

        let slow = TokenBucketConfig::per_minute(1).unwrap();
        assert_eq!(slow.limiters_interval(), Duration::from_secs(60));
    }

    #[test]
    fn per_minute_rejects_rates_beyond_u32() {
        let too_many = u64::from(u32::MAX) + 1;
        assert_eq!(TokenBucketConfig::per_minute(too_many), Err(ConfigError::InvalidRate(too_many)));
    }

    #[test]
    fn derived_periods() {
        let cfg = TokenBucketConfig::default()
            .with_limiters_burst(4)
            .with_limiters_interval(Duration::from_millis(500));
        assert_eq!(cfg.refill_rate_per_sec(), 2.0);
        assert_eq!(cfg.full_bucket_period(), Duration::from_secs(2));
        assert_eq!(cfg.full_bucket_period_secs(), 2);

        let tiny = cfg.with_limiters_burst(1).with_limiters_interval(Duration::from_millis(100));
        assert_eq!(tiny.full_bucket_period_secs(), 1, "store TTL never rounds down to zero");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_with_defaults() {
        let cfg: TokenBucketConfig =
            serde_json::from_str(r#"{"limiters_burst": 5, "cooldown_ms": 1000}"#).unwrap();
        assert_eq!(cfg.limiters_burst(), 5);
        assert_eq!(cfg.cooldown_interval(), Duration::from_secs(1));
        assert_eq!(cfg.limiters_interval(), Duration::from_secs(60));
    }
}
