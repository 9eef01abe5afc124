/// Token bucket state for one fingerprint.
///
/// Every backend runs exactly this refill-and-consume step: refill
/// `elapsed × rate` tokens (capped at the burst), then take one token if at least one
/// is available. A denied call is penalised: the bucket is emptied and the refill
/// clock restarts, so a herd has to back off for a full interval before the next
/// call gets through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    tokens: f64,
    last_refreshed_millis: u64,
}

impl BucketState {
    /// A full bucket, as seeded the first time a fingerprint is seen.
    pub fn full(burst: u64, now_millis: u64) -> Self {
        Self { tokens: burst as f64, last_refreshed_millis: now_millis }
    }

    /// Refill, then try to take one token. Returns true if the call is allowed.
    pub fn take(&mut self, now_millis: u64, burst: u64, refill_per_sec: f64) -> bool {
        let elapsed_secs =
            now_millis.saturating_sub(self.last_refreshed_millis) as f64 / 1000.0;
        let available = (self.tokens + elapsed_secs * refill_per_sec).min(burst as f64);
        self.last_refreshed_millis = now_millis;

        if available >= 1.0 {
            self.tokens = available - 1.0;
            true
        } else {
            self.tokens = 0.0;
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refreshed_millis(&self) -> u64 {
        self.last_refreshed_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_calls_pass_then_the_next_is_denied() {
        let mut bucket = BucketState::full(3, 0);
        assert!(bucket.take(0, 3, 1.0));
        assert!(bucket.take(0, 3, 1.0));
        assert!(bucket.take(0, 3, 1.0));
        assert!(!bucket.take(0, 3, 1.0));
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let mut bucket = BucketState::full(2, 0);
        assert!(bucket.take(0, 2, 1.0));
        assert!(bucket.take(100_000, 2, 1.0));
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[test]
    fn denial_empties_the_bucket() {
        let mut bucket = BucketState::full(1, 0);
        assert!(bucket.take(0, 1, 2.0));
        // 0.4 tokens accumulated, not enough
        assert!(!bucket.take(200, 1, 2.0));
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.last_refreshed_millis(), 200);
        // refill restarts from the denial, not from the last allowed call
        assert!(!bucket.take(300, 1, 2.0));
        assert!(!bucket.take(700, 1, 2.0));
        assert!(bucket.take(1200, 1, 2.0));
    }
}
