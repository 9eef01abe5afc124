use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::detector::{BucketState, Detector, TokenBucketConfig};
use crate::error::{BackendError, ConfigError};
use crate::expiring_map::ExpiringMap;
use crate::Fingerprint;

/// Token bucket detector keeping its state in process memory.
///
/// Cooldown flags live in an [`ExpiringMap`] with TTL = `cooldown_interval`; limiters
/// live in another with TTL = `burst × interval`, so idle buckets are reclaimed once
/// they would have refilled anyway. Correct under intra-process concurrency only.
#[derive(Debug)]
pub struct TokenBucketInMemory {
    config: TokenBucketConfig,
    cooldowns: ExpiringMap<Fingerprint, bool>,
    limiters: ExpiringMap<Fingerprint, Arc<Mutex<BucketState>>>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketInMemory {
    /// Create a detector. Must be called inside a Tokio runtime (for reclamation).
    pub fn new(config: TokenBucketConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, MonotonicClock::default())
    }

    /// Create a detector on an explicit clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(
        config: TokenBucketConfig,
        clock: C,
    ) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let cooldowns = ExpiringMap::with_shared_clock(config.cooldown_interval(), clock.clone())?;
        let limiters = ExpiringMap::with_shared_clock(config.full_bucket_period(), clock.clone())?;
        Ok(Self { config, cooldowns, limiters, clock })
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Stop both reclamation tasks. Safe to call more than once.
    pub fn stop(&self) {
        self.cooldowns.stop();
        self.limiters.stop();
    }
}

#[async_trait]
impl Detector for TokenBucketInMemory {
    async fn cool_down(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        self.cooldowns.set(fingerprint.clone(), true);
        Ok(())
    }

    // Cooldowns are fixed windows: reading one must not extend it.
    async fn is_cool_down(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        Ok(self.cooldowns.peek(fingerprint).unwrap_or(false))
    }

    async fn is_thundering_herd(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let burst = self.config.limiters_burst();
        let limiter = self.limiters.get_or_insert_with(fingerprint.clone(), || {
            Arc::new(Mutex::new(BucketState::full(burst, self.clock.now_millis())))
        });

        let allowed = limiter.lock().unwrap_or_else(PoisonError::into_inner).take(
            self.clock.now_millis(),
            burst,
            self.config.refill_rate_per_sec(),
        );
        if !allowed {
            debug!(target: "herdgate::detector", fingerprint = %fingerprint, "bucket empty");
        }
        Ok(!allowed)
    }
}
