//! Redis backends for `herdgate` (companion crate).
//! Bring your own connection: anything implementing `redis::aio::ConnectionLike + Clone`
//! works, `redis::aio::ConnectionManager` being the usual choice. Every call clones the
//! handle, so it is released on every exit path.
//!
//! - [`TokenBucketRedis`]: detector whose refill-and-consume step runs as one Lua script.
//! - [`RedisStorage`]: gatekeeper records as plain keys, claimed with `SET NX`.

use herdgate::{ConfigError, Fingerprint};

mod detector;
mod storage;

pub use detector::TokenBucketRedis;
pub use storage::RedisStorage;

/// Errors from Redis-backed detectors and storages.
#[derive(Debug, thiserror::Error)]
pub enum RedisBackendError {
    /// The command itself failed (connection, protocol, script error).
    #[error("redis {command} failed: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: redis::RedisError,
    },
    /// Redis answered something the backend does not understand.
    #[error("redis {command} returned unexpected reply '{reply}'")]
    UnexpectedReply { command: &'static str, reply: String },
}

impl RedisBackendError {
    pub(crate) fn command(command: &'static str) -> impl FnOnce(redis::RedisError) -> Self {
        move |source| Self::Command { command, source }
    }
}

/// Which kind of state a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Cooldown flags.
    CoolDown,
    /// Token bucket hashes.
    ThunderingHerd,
    /// Gatekeeper records.
    Gatekeeper,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::CoolDown => "cooldown",
            Scope::ThunderingHerd => "th",
            Scope::Gatekeeper => "gk",
        }
    }
}

/// Key namespace shared by the Redis backends: `<prefix>:<scope>:<fingerprint>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self { prefix: "herdgate".to_string() }
    }
}

impl RedisKeys {
    /// Use a custom prefix, e.g. one per tenant.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains whitespace or control characters.
    pub fn new(prefix: impl Into<String>) -> Result<Self, ConfigError> {
        let p: String = prefix.into();
        let p = p.trim().trim_end_matches(':').to_string();

        if p.is_empty() {
            return Err(ConfigError::Invalid("redis key prefix cannot be empty".to_string()));
        }
        if p.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ConfigError::Invalid(
                "redis key prefix cannot contain whitespace or control characters".to_string(),
            ));
        }
        Ok(Self { prefix: p })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Binary-safe key for a fingerprint in the given scope.
    pub fn key(&self, scope: Scope, fingerprint: &Fingerprint) -> Vec<u8> {
        let scope = scope.as_str();
        let mut key = Vec::with_capacity(self.prefix.len() + scope.len() + fingerprint.len() + 2);
        key.extend_from_slice(self.prefix.as_bytes());
        key.push(b':');
        key.extend_from_slice(scope.as_bytes());
        key.push(b':');
        key.extend_from_slice(fingerprint.as_bytes());
        key
    }
}
