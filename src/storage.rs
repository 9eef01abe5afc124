//! Gatekeeper record storage.
//!
//! A record is an existence marker plus a `processed` flag per fingerprint:
//! absent means no episode is in flight, `processed = false` means somebody claimed
//! the episode, `processed = true` means it completed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::BackendError;
use crate::Fingerprint;

/// Abstract storage interface for gatekeeper records.
///
/// Designed to support both in-memory and distributed backends. A missing record is
/// never an error.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether a record exists for the fingerprint.
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError>;

    /// The record's processed flag; false when there is no record.
    async fn processed(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError>;

    /// Create or overwrite the record.
    async fn store(&self, fingerprint: &Fingerprint, processed: bool) -> Result<(), BackendError>;

    /// Delete the record. Removing an absent record succeeds.
    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), BackendError>;

    /// Create the record with `processed = false` if there is none. Returns true when
    /// this call created it.
    ///
    /// The provided implementation is a plain check-then-write and is only safe when
    /// callers are already serialized per fingerprint. Backends shared by concurrent
    /// callers must override it with an atomic create-if-absent.
    async fn claim(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        if self.exists(fingerprint).await? {
            return Ok(false);
        }
        self.store(fingerprint, false).await?;
        Ok(true)
    }
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        (**self).exists(fingerprint).await
    }

    async fn processed(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        (**self).processed(fingerprint).await
    }

    async fn store(&self, fingerprint: &Fingerprint, processed: bool) -> Result<(), BackendError> {
        (**self).store(fingerprint, processed).await
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        (**self).remove(fingerprint).await
    }

    async fn claim(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        (**self).claim(fingerprint).await
    }
}

/// In-memory storage backed by an RwLock.
///
/// Records have no TTL: they stay until overwritten or removed. Clones share the
/// same records.
#[derive(Default, Clone, Debug)]
pub struct InMemoryStorage {
    records: Arc<RwLock<HashMap<Fingerprint, bool>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, fingerprint: &Fingerprint) -> Option<bool> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).get(fingerprint).copied()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        Ok(self.get(fingerprint).is_some())
    }

    async fn processed(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        Ok(self.get(fingerprint).unwrap_or(false))
    }

    async fn store(&self, fingerprint: &Fingerprint, processed: bool) -> Result<(), BackendError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(fingerprint.clone(), processed);
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(fingerprint);
        Ok(())
    }

    async fn claim(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.entry(fingerprint.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(false);
                Ok(true)
            }
        }
    }
}
