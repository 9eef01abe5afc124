#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # herdgate
//!
//! Thundering-herd admission control for async Rust: when many identical requests
//! arrive while no answer exists yet, let exactly one through to do the work and
//! tell the rest to wait.
//!
//! ## Features
//!
//! - **Detectors** flag a herd per fingerprint with a token bucket, with a cooldown
//!   after each episode
//! - **Gatekeeper** picks exactly one winner per herd episode
//! - **Pluggable backends**: in-memory here, Redis in `herdgate-redis`
//! - **Expiring map** with sliding TTL and background reclamation
//! - **Tower middleware** running the whole caller protocol
//!
//! ## Quick Start
//!
//! ```rust
//! use herdgate::{Fingerprint, Herd, InMemoryStorage, Status, TokenBucketConfig, TokenBucketInMemory};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TokenBucketConfig::default()
//!         .with_limiters_burst(100)
//!         .with_cooldown_interval(Duration::from_secs(600));
//!     let herd = Herd::new(TokenBucketInMemory::new(config)?, InMemoryStorage::new());
//!
//!     let request = Fingerprint::from("GET /report?year=2024");
//!     match herd.evaluate(&request).await? {
//!         Status::Process => {
//!             // do the expensive work, then:
//!             herd.request_done(&request).await?;
//!         }
//!         Status::Wait => { /* reject or retry later */ }
//!         _ => { /* business as usual */ }
//!     }
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod detector;
pub mod error;
pub mod expiring_map;
pub mod fingerprint;
pub mod gatekeeper;
pub mod herd;
pub mod middleware;
pub mod status;
pub mod storage;
pub mod timeout;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use detector::{BucketState, Detector, TokenBucketConfig, TokenBucketInMemory};
pub use error::{BackendError, BackendTimeout, ConfigError, HerdError, Operation};
pub use expiring_map::ExpiringMap;
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use gatekeeper::Gatekeeper;
pub use herd::Herd;
pub use middleware::{AdmissionError, HerdLayer, HerdService};
pub use status::Status;
pub use storage::{InMemoryStorage, Storage};
pub use timeout::TimeoutPolicy;
