//! Look-aside credential cache: token → credential snapshot with a TTL.
//!
//! The cache is an optimization, never authoritative for revocation
//! correctness beyond the TTL window. Read failures are swallowed and
//! reported as a miss so a flaky cache can only add latency, not errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::models::instance::Credentials;

const KEY_PREFIX: &str = "instance_credentials:";

fn cache_key(token: &str) -> String {
    format!("{}{}", KEY_PREFIX, token)
}

#[async_trait]
pub trait CredentialCache: Send + Sync {
    /// Look up a snapshot. Backend errors are logged and surface as a miss.
    async fn get(&self, token: &str) -> Option<Credentials>;

    /// Store a snapshot, overwriting any existing entry.
    async fn put(&self, token: &str, creds: &Credentials, ttl_secs: u64) -> anyhow::Result<()>;

    /// Remove the entry if present. Returns whether an entry existed, which
    /// revoke uses for its partial-success reporting.
    async fn invalidate(&self, token: &str) -> anyhow::Result<bool>;
}

/// Redis-backed cache. Snapshots are stored as JSON under
/// `instance_credentials:<token>` with a per-entry TTL.
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl RedisCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl CredentialCache for RedisCache {
    async fn get(&self, token: &str) -> Option<Credentials> {
        let mut conn = self.redis.clone();
        match conn.get::<_, Option<String>>(cache_key(token)).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("credential cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    async fn put(&self, token: &str, creds: &Credentials, ttl_secs: u64) -> anyhow::Result<()> {
        let json = serde_json::to_string(creds)?;
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(cache_key(token), json, ttl_secs)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, token: &str) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(cache_key(token)).await?;
        Ok(removed > 0)
    }
}

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process cache with the same contract, used by the test suite. Entries
/// honour TTLs and are evicted lazily on read.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialCache for MemoryCache {
    async fn get(&self, token: &str) -> Option<Credentials> {
        let key = cache_key(token);
        if let Some(entry) = self.entries.get(&key) {
            if Instant::now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired — drop the ref before removing
            drop(entry);
            self.entries.remove(&key);
        }
        None
    }

    async fn put(&self, token: &str, creds: &Credentials, ttl_secs: u64) -> anyhow::Result<()> {
        let json = serde_json::to_string(creds)?;
        self.entries.insert(
            cache_key(token),
            MemoryEntry {
                value: json,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, token: &str) -> anyhow::Result<bool> {
        Ok(self.entries.remove(&cache_key(token)).is_some())
    }
}
