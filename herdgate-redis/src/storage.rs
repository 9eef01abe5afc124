use std::time::Duration;

use async_trait::async_trait;
use herdgate::{BackendError, Fingerprint, Storage};
use redis::aio::{ConnectionLike, ConnectionManager};
use tracing::trace;

use crate::{RedisBackendError, RedisKeys, Scope};

/// Gatekeeper records stored in Redis: one key per fingerprint holding `0`
/// (in flight) or `1` (processed).
///
/// Without a record TTL, records persist until removed or overwritten, like the
/// in-memory storage. With [`RedisStorage::with_record_ttl`], a winner that dies
/// without calling `request_done` or `cleanup` only stalls waiters until the lease
/// runs out.
#[derive(Clone)]
pub struct RedisStorage<C = ConnectionManager> {
    conn: C,
    keys: RedisKeys,
    record_ttl: Option<Duration>,
}

impl<C> std::fmt::Debug for RedisStorage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("keys", &self.keys)
            .field("record_ttl", &self.record_ttl)
            .field("conn", &"<redis connection>")
            .finish()
    }
}

impl<C> RedisStorage<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Create a storage using an existing connection.
    pub fn new(conn: C) -> Self {
        Self { conn, keys: RedisKeys::default(), record_ttl: None }
    }

    /// Use a custom key namespace.
    pub fn with_keys(mut self, keys: RedisKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Expire records this long after they were last written. Zero disables expiry.
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    fn set_cmd(&self, fingerprint: &Fingerprint, processed: bool) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.keys.key(Scope::Gatekeeper, fingerprint)).arg(i64::from(processed));
        if let Some(ttl) = self.record_ttl {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        }
        cmd
    }
}

#[async_trait]
impl<C> Storage for RedisStorage<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.keys.key(Scope::Gatekeeper, fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("EXISTS"))?;
        Ok(found == 1)
    }

    async fn processed(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(self.keys.key(Scope::Gatekeeper, fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("GET"))?;
        Ok(value.is_some_and(|v| v != 0))
    }

    async fn store(&self, fingerprint: &Fingerprint, processed: bool) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .set_cmd(fingerprint, processed)
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("SET"))?;
        if reply != "OK" {
            return Err(RedisBackendError::UnexpectedReply { command: "SET", reply }.into());
        }
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(self.keys.key(Scope::Gatekeeper, fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("DEL"))?;
        Ok(())
    }

    async fn claim(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = self.set_cmd(fingerprint, false);
        cmd.arg("NX");
        let reply: Option<String> =
            cmd.query_async(&mut conn).await.map_err(RedisBackendError::command("SET NX"))?;
        let claimed = reply.is_some();
        trace!(target: "herdgate_redis::storage", fingerprint = %fingerprint, claimed, "claim");
        Ok(claimed)
    }
}
