//! Gatekeeper: picks exactly one winner per fingerprint once a herd is detected.

use tracing::{trace, warn};

use crate::error::{HerdError, Operation};
use crate::storage::Storage;
use crate::timeout::{bounded, TimeoutPolicy};
use crate::{Fingerprint, Status};

/// Turns gatekeeper records into a [`Status`].
#[derive(Debug, Clone)]
pub struct Gatekeeper<S> {
    storage: S,
    timeout: Option<TimeoutPolicy>,
}

impl<S: Storage> Gatekeeper<S> {
    pub fn new(storage: S) -> Self {
        Self { storage, timeout: None }
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<TimeoutPolicy>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Decide for a fingerprint the detector has flagged as a herd (outside cooldown).
    ///
    /// - no record: claim it, `Process`
    /// - record, not processed: `Wait`
    /// - record, processed: `OpenGates`
    ///
    /// A caller that loses the claim race re-reads the record: `Wait` while the winner
    /// works, `OpenGates` if it already finished.
    ///
    /// A claim that times out may still land in the backend, so the record is removed
    /// before the error is returned.
    pub async fn analyze(&self, fingerprint: &Fingerprint) -> Result<Status, HerdError> {
        let exists = self.call(Operation::Exists, fingerprint, self.storage.exists(fingerprint)).await?;

        if exists {
            let status = self.existing(fingerprint).await?;
            trace!(target: "herdgate::gatekeeper", fingerprint = %fingerprint, %status, "existing record");
            return Ok(status);
        }

        let claimed = match self.call(Operation::Claim, fingerprint, self.storage.claim(fingerprint)).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_timeout() => {
                self.release_unconfirmed_claim(fingerprint).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let status = if claimed { Status::Process } else { self.existing(fingerprint).await? };
        trace!(target: "herdgate::gatekeeper", fingerprint = %fingerprint, claimed, %status, "claim attempted");
        Ok(status)
    }

    async fn existing(&self, fingerprint: &Fingerprint) -> Result<Status, HerdError> {
        let processed =
            self.call(Operation::Processed, fingerprint, self.storage.processed(fingerprint)).await?;
        Ok(if processed { Status::OpenGates } else { Status::Wait })
    }

    // The caller is told to fail, so it will never call `request_done` or `cleanup`.
    async fn release_unconfirmed_claim(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.remove(fingerprint).await {
            warn!(target: "herdgate::gatekeeper", fingerprint = %fingerprint, error = %e, "failed to release timed out claim");
        }
    }

    /// Overwrite the record's processed flag.
    pub async fn store(&self, fingerprint: &Fingerprint, processed: bool) -> Result<(), HerdError> {
        self.call(Operation::Store, fingerprint, self.storage.store(fingerprint, processed)).await
    }

    /// Delete the record so a new winner can be chosen.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), HerdError> {
        self.call(Operation::Remove, fingerprint, self.storage.remove(fingerprint)).await
    }

    async fn call<T, Fut>(&self, operation: Operation, fingerprint: &Fingerprint, fut: Fut) -> Result<T, HerdError>
    where
        Fut: std::future::Future<Output = Result<T, crate::BackendError>>,
    {
        bounded(self.timeout, fut)
            .await
            .map_err(|source| HerdError::new(operation, fingerprint.clone(), source))
    }
}
