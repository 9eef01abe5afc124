//! Thundering herd detection.
//!
//! This module provides the building blocks for spotting herds:
//! - [`Detector`]: the capability the orchestrator consults (cooldown + herd signal).
//! - [`TokenBucketConfig`]: validated settings shared by every token-bucket backend.
//! - [`BucketState`]: the refill-and-consume algorithm, identical across backends.
//! - [`TokenBucketInMemory`]: process-local detector on top of [`crate::ExpiringMap`].
//!
//! # Architecture
//!
//! A fingerprint is a herd when its bucket runs dry: up to `limiters_burst` calls per
//! refill window are normal traffic, the next one is flagged. Once an episode
//! resolves, the fingerprint is put in cooldown and herd checks are skipped until the
//! cooldown expires. Distributed backends (e.g. Redis) implement the same trait in a
//! companion crate and must be observably equivalent.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::Fingerprint;

pub mod bucket;
pub mod config;
pub mod in_memory;

pub use bucket::BucketState;
pub use config::TokenBucketConfig;
pub use in_memory::TokenBucketInMemory;

/// Core interface for herd detection.
///
/// Absence of state (a fingerprint never seen, or one that expired) is not an error;
/// it is reported through the boolean results.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Put the fingerprint in cooldown for the configured interval.
    async fn cool_down(&self, fingerprint: &Fingerprint) -> Result<(), BackendError>;

    /// Whether the fingerprint is currently in cooldown.
    async fn is_cool_down(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError>;

    /// Consume one token for the fingerprint; true when none was available.
    async fn is_thundering_herd(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError>;
}

#[async_trait]
impl<D: Detector + ?Sized> Detector for Arc<D> {
    async fn cool_down(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        (**self).cool_down(fingerprint).await
    }

    async fn is_cool_down(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        (**self).is_cool_down(fingerprint).await
    }

    async fn is_thundering_herd(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        (**self).is_thundering_herd(fingerprint).await
    }
}
