//! The orchestrator: detector and gatekeeper behind `evaluate`, `request_done`
//! and `cleanup`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::detector::Detector;
use crate::error::{BackendError, ConfigError, HerdError, Operation};
use crate::gatekeeper::Gatekeeper;
use crate::storage::Storage;
use crate::timeout::{bounded, TimeoutPolicy};
use crate::{Fingerprint, Fingerprinter, Status};

/// Thundering herd guard for one detector and one gatekeeper storage.
///
/// Both backends are injected, so several guards can share a store. Safe to share
/// across tasks (wrap it in an `Arc`).
///
/// # Caller protocol
/// 1. `evaluate` before doing the expensive work.
/// 2. On `Process`: do the work, then `request_done` on success or `cleanup` on failure.
/// 3. On `Wait`: reject or retry later.
/// 4. On `OpenGates`: proceed normally.
/// 5. On error (`Failed`): failing open or closed is the caller's decision.
#[derive(Debug)]
pub struct Herd<D, S> {
    detector: D,
    gatekeeper: Gatekeeper<S>,
    timeout: Option<TimeoutPolicy>,
}

impl<D, S> Herd<D, S>
where
    D: Detector,
    S: Storage,
{
    pub fn new(detector: D, storage: S) -> Self {
        Self { detector, gatekeeper: Gatekeeper::new(storage), timeout: None }
    }

    /// Bound every detector and storage call; an elapsed deadline fails the operation.
    ///
    /// # Errors
    /// Returns `Err` if `timeout` is zero or `Duration::MAX`.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        let policy = Some(TimeoutPolicy::new(timeout)?);
        self.timeout = policy;
        self.gatekeeper = self.gatekeeper.with_timeout(policy);
        Ok(self)
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn gatekeeper(&self) -> &Gatekeeper<S> {
        &self.gatekeeper
    }

    /// Decide what to do with a unit of work.
    ///
    /// ```
    /// use herdgate::{Fingerprint, Herd, InMemoryStorage, Status, TokenBucketConfig, TokenBucketInMemory};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = TokenBucketConfig::new(1, Duration::from_secs(60), Duration::from_secs(600))?;
    /// let herd = Herd::new(TokenBucketInMemory::new(config)?, InMemoryStorage::new());
    /// let request = Fingerprint::from("GET /expensive");
    ///
    /// assert_eq!(herd.evaluate(&request).await?, Status::OpenGates);
    /// assert_eq!(herd.evaluate(&request).await?, Status::Process);
    /// assert_eq!(herd.evaluate(&request).await?, Status::Wait);
    /// herd.request_done(&request).await?;
    /// assert_eq!(herd.evaluate(&request).await?, Status::OpenGates);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn evaluate<F>(&self, unit: &F) -> Result<Status, HerdError>
    where
        F: Fingerprinter + ?Sized,
    {
        let fingerprint = unit.fingerprint();
        self.evaluate_fingerprint(&fingerprint).await
    }

    /// [`Herd::evaluate`] for an already computed fingerprint.
    pub async fn evaluate_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Status, HerdError> {
        let cooling = self
            .call(Operation::CoolDownCheck, fingerprint, self.detector.is_cool_down(fingerprint))
            .await?;
        if cooling {
            debug!(target: "herdgate::herd", fingerprint = %fingerprint, "in cooldown");
            return Ok(Status::OpenGates);
        }

        let herd = self
            .call(Operation::HerdCheck, fingerprint, self.detector.is_thundering_herd(fingerprint))
            .await?;
        if !herd {
            return Ok(Status::OpenGates);
        }

        let status = self.gatekeeper.analyze(fingerprint).await?;
        debug!(target: "herdgate::herd", fingerprint = %fingerprint, %status, "thundering herd detected");
        Ok(status)
    }

    /// Mark the work done: the record becomes processed, then the fingerprint cools down.
    ///
    /// Waiters poll storage, so storage is updated first.
    pub async fn request_done<F>(&self, unit: &F) -> Result<(), HerdError>
    where
        F: Fingerprinter + ?Sized,
    {
        let fingerprint = unit.fingerprint();
        self.request_done_fingerprint(&fingerprint).await
    }

    pub async fn request_done_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), HerdError> {
        self.gatekeeper.store(fingerprint, true).await?;
        self.call(Operation::CoolDown, fingerprint, self.detector.cool_down(fingerprint)).await?;
        debug!(target: "herdgate::herd", fingerprint = %fingerprint, "request done");
        Ok(())
    }

    /// Drop the record after the chosen caller failed, so a new winner can emerge.
    pub async fn cleanup<F>(&self, unit: &F) -> Result<(), HerdError>
    where
        F: Fingerprinter + ?Sized,
    {
        let fingerprint = unit.fingerprint();
        self.cleanup_fingerprint(&fingerprint).await
    }

    pub async fn cleanup_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), HerdError> {
        self.gatekeeper.remove(fingerprint).await?;
        debug!(target: "herdgate::herd", fingerprint = %fingerprint, "record cleaned up");
        Ok(())
    }

    async fn call<T, Fut>(
        &self,
        operation: Operation,
        fingerprint: &Fingerprint,
        fut: Fut,
    ) -> Result<T, HerdError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        bounded(self.timeout, fut)
            .await
            .map_err(|source| HerdError::new(operation, fingerprint.clone(), source))
    }
}
