//! Deadline for individual Detector/Storage calls.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{BackendError, BackendTimeout, ConfigError};

/// Bounds a backend call; an elapsed deadline becomes a [`BackendTimeout`] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy.
    ///
    /// # Errors
    /// Returns `Err` if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout(duration));
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut>(&self, call: Fut) -> Result<T, BackendError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, call).await {
            Ok(result) => result,
            Err(_) => Err(Box::new(BackendTimeout {
                elapsed: start.elapsed(),
                timeout: self.duration,
            })),
        }
    }
}

/// Run `call` under `policy` when one is configured.
pub(crate) async fn bounded<T, Fut>(policy: Option<TimeoutPolicy>, call: Fut) -> Result<T, BackendError>
where
    Fut: Future<Output = Result<T, BackendError>>,
{
    match policy {
        Some(policy) => policy.execute(call).await,
        None => call.await,
    }
}
