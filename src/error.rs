//! Error types for herd evaluation and configuration.
use std::fmt;
use std::time::Duration;

use crate::Fingerprint;

/// Error returned by Detector and Storage backends.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The backend operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `Detector::is_cool_down`
    CoolDownCheck,
    /// `Detector::is_thundering_herd`
    HerdCheck,
    /// `Detector::cool_down`
    CoolDown,
    /// `Storage::exists`
    Exists,
    /// `Storage::processed`
    Processed,
    /// `Storage::claim`
    Claim,
    /// `Storage::store`
    Store,
    /// `Storage::remove`
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Operation::CoolDownCheck => "check if fingerprint is in cooldown",
            Operation::HerdCheck => "check if fingerprint is a thundering herd",
            Operation::CoolDown => "cool down fingerprint",
            Operation::Exists => "check if fingerprint exists",
            Operation::Processed => "get fingerprint processed flag",
            Operation::Claim => "claim fingerprint",
            Operation::Store => "store fingerprint",
            Operation::Remove => "remove fingerprint",
        };
        f.write_str(msg)
    }
}

/// A Detector or Storage call failed while handling a fingerprint.
///
/// Evaluations that produce this error report [`crate::Status::Failed`].
#[derive(Debug, thiserror::Error)]
#[error("failed to {operation} '{fingerprint}': {source}")]
pub struct HerdError {
    operation: Operation,
    fingerprint: Fingerprint,
    #[source]
    source: BackendError,
}

impl HerdError {
    pub fn new(operation: Operation, fingerprint: Fingerprint, source: BackendError) -> Self {
        Self { operation, fingerprint, source }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// True when the backend call was cut short by the configured backend timeout.
    pub fn is_timeout(&self) -> bool {
        self.source.is::<BackendTimeout>()
    }

    /// Take the backend error out.
    pub fn into_source(self) -> BackendError {
        self.source
    }
}

/// A backend call exceeded the configured deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backend call timed out after {elapsed:?} (limit: {timeout:?})")]
pub struct BackendTimeout {
    pub elapsed: Duration,
    pub timeout: Duration,
}

/// Invalid configuration, raised at construction time only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Burst must be > 0.
    #[error("limiters_burst must be > 0 (got {0})")]
    InvalidBurst(u64),
    /// Refill interval must be > 0.
    #[error("limiters_interval must be > 0 (got {0:?})")]
    InvalidInterval(Duration),
    /// Cooldown interval must be > 0.
    #[error("cooldown_interval must be > 0 (got {0:?})")]
    InvalidCoolDown(Duration),
    /// Expiring map TTL must be > 0.
    #[error("ttl must be > 0 (got {0:?})")]
    InvalidTtl(Duration),
    /// Requests per minute must be > 0 and fit in a `u32`.
    #[error("requests_per_minute must be between 1 and {max} (got {0})", max = u32::MAX)]
    InvalidRate(u64),
    /// Backend timeout must be > 0 and finite.
    #[error("backend timeout must be non-zero and finite (got {0:?})")]
    InvalidTimeout(Duration),
    /// The reclamation task needs a Tokio runtime.
    #[error("expiring map must be created inside a Tokio runtime")]
    NoRuntime,
    /// Anything else a backend rejects at construction.
    #[error("{0}")]
    Invalid(String),
}
