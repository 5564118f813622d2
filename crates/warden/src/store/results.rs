//! Query result cache.
//!
//! Keyed by `(keyword, page)`. Reads return the most recent entry if it is
//! younger than the caller's max age. Redis keeps a per-key history; the
//! in-memory backend keeps only the latest entry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use beian_common::QueryPage;
use beian_common::constants::{DEFAULT_RESULT_TTL_SECS, redis_keys};
use chrono::{DateTime, TimeDelta, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Clock, SystemClock};

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Most recent result for `(keyword, page)` no older than `max_age`
    async fn load(&self, keyword: &str, page: u32, max_age: Duration) -> Result<Option<QueryPage>>;

    async fn save(&self, keyword: &str, page: u32, result: &QueryPage) -> Result<()>;

    /// Backend reachability, for readiness checks
    async fn ping(&self) -> bool;
}

/// One history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResult {
    stored_at: DateTime<Utc>,
    result: QueryPage,
}

impl StoredResult {
    fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        now - self.stored_at <= max_age
    }
}

fn result_key(keyword: &str, page: u32) -> String {
    format!("{}{keyword}:{page}", redis_keys::RESULT_PREFIX)
}

/// Redis-backed history: `LPUSH` + `EXPIRE` on write, `LINDEX 0` on read
#[derive(Clone)]
pub struct RedisResultCache {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisResultCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { redis, ttl })
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn load(&self, keyword: &str, page: u32, max_age: Duration) -> Result<Option<QueryPage>> {
        let mut conn = self.redis.clone();
        let latest: Option<String> = conn
            .lindex(result_key(keyword, page), 0)
            .await
            .context("Failed to read cached result")?;

        let Some(raw) = latest else {
            return Ok(None);
        };
        let entry: StoredResult = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(keyword, page, error = %e, "Ignoring unreadable cached result");
                return Ok(None);
            }
        };

        Ok(entry.is_fresh(max_age, Utc::now()).then_some(entry.result))
    }

    async fn save(&self, keyword: &str, page: u32, result: &QueryPage) -> Result<()> {
        let key = result_key(keyword, page);
        let entry = serde_json::to_string(&StoredResult {
            stored_at: Utc::now(),
            result: result.clone(),
        })?;

        let mut conn = self.redis.clone();
        let _: () = conn
            .lpush(&key, entry)
            .await
            .context("Failed to append cached result")?;
        let _: () = conn
            .expire(&key, self.ttl.as_secs() as i64)
            .await
            .context("Failed to set cached result TTL")?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }
}

/// In-process cache, for deployments without Redis. Only the latest entry
/// per key is kept and entries past the TTL are pruned on every write.
pub struct MemoryResultCache {
    entries: RwLock<HashMap<(String, u32), StoredResult>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_RESULT_TTL_SECS))
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn load(&self, keyword: &str, page: u32, max_age: Duration) -> Result<Option<QueryPage>> {
        let entries = self.entries.read().await;
        let now = self.clock.now();
        Ok(entries
            .get(&(keyword.to_string(), page))
            .filter(|entry| entry.is_fresh(max_age, now))
            .map(|entry| entry.result.clone()))
    }

    async fn save(&self, keyword: &str, page: u32, result: &QueryPage) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_fresh(self.ttl, now));
        entries.insert(
            (keyword.to_string(), page),
            StoredResult {
                stored_at: now,
                result: result.clone(),
            },
        );
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}
