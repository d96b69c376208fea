//! Copy -> original resolution cache
//!
//! Maps the id of a bridged copy (a DID, an `at://` URI, ...) back to the
//! user or object it was copied from. Backed by a query on `copies.uri`,
//! fronted by a bounded process-local layer and the shared cache. Negative
//! results are cached too. Writes that add a copy populate both layers, so a
//! copy is resolvable immediately after it's written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::shared::SharedCache;
use crate::db::schemas::{Object, User, UserKey};
use crate::db::store::{self, DocumentStore, Model, Query};
use crate::protocol::{ProtocolRegistry, INTERNAL_PROTOCOL};
use crate::types::Result;

/// Configuration for the originals cache
#[derive(Debug, Clone)]
pub struct OriginalsCacheConfig {
    /// Maximum process-local entries
    pub max_entries: usize,

    /// Process-local entry lifetime
    pub local_ttl: Duration,

    /// Shared cache entry lifetime
    pub shared_ttl: Duration,
}

impl Default for OriginalsCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            local_ttl: Duration::from_secs(600),        // 10 minutes
            shared_ttl: Duration::from_secs(24 * 3600), // 1 day
        }
    }
}

struct CachedOriginal {
    /// Original id, or null if there is none
    original: Value,
    expires_at: Instant,
}

/// Statistics for the originals cache
#[derive(Debug, Default)]
pub struct OriginalsStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub queries: AtomicU64,
    pub evictions: AtomicU64,
}

/// Snapshot of originals cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalsStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub queries: u64,
    pub evictions: u64,
    pub local_entries: usize,
}

pub struct OriginalsCache {
    local: DashMap<String, CachedOriginal>,
    shared: Arc<dyn SharedCache>,
    config: OriginalsCacheConfig,
    stats: OriginalsStats,
}

fn object_key(copy_id: &str) -> String {
    format!("original-object:{}", copy_id)
}

fn user_key(copy_id: &str) -> String {
    format!("original-user:{}", copy_id)
}

impl OriginalsCache {
    pub fn new(shared: Arc<dyn SharedCache>, config: OriginalsCacheConfig) -> Self {
        Self {
            local: DashMap::new(),
            shared,
            config,
            stats: OriginalsStats::default(),
        }
    }

    /// The id of the object with a copy at `copy_id`, if any
    pub async fn original_object(
        &self,
        store: &dyn DocumentStore,
        copy_id: &str,
    ) -> Result<Option<String>> {
        let key = object_key(copy_id);
        if let Some(cached) = self.lookup(&key).await {
            return Ok(cached.as_str().map(str::to_string));
        }

        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let query = Query::new().eq("copies.uri", copy_id).limit(1);
        let found = store.query(Object::COLLECTION, &query).await?;
        let original = found.into_iter().next().map(|stored| stored.id);

        self.remember(&key, original.clone().map(Value::String).unwrap_or(Value::Null))
            .await;
        Ok(original)
    }

    /// The user with a copy at `copy_id`, if any. Only protocols that don't
    /// natively claim `copy_id` are searched.
    pub async fn original_user(
        &self,
        store: &dyn DocumentStore,
        registry: &ProtocolRegistry,
        copy_id: &str,
    ) -> Result<Option<UserKey>> {
        let key = user_key(copy_id);
        if let Some(cached) = self.lookup(&key).await {
            return Ok(serde_json::from_value(cached).ok());
        }

        let protocols: Vec<Value> = registry
            .all()
            .filter(|p| p.label() != INTERNAL_PROTOCOL && p.owns_id(copy_id) != Some(true))
            .map(|p| Value::String(p.label().to_string()))
            .collect();

        let original = if protocols.is_empty() {
            None
        } else {
            self.stats.queries.fetch_add(1, Ordering::Relaxed);
            let query = Query::new()
                .is_in("protocol", protocols)
                .eq("copies.uri", copy_id)
                .limit(1);
            store::query::<User>(store, &query)
                .await?
                .into_iter()
                .next()
                .map(|user| user.key())
        };

        let value = match &original {
            Some(user) => serde_json::to_value(user)?,
            None => Value::Null,
        };
        self.remember(&key, value).await;
        Ok(original)
    }

    /// Records that `copy_id` is a copy of object `original_id`.
    pub async fn add_object_copy(&self, copy_id: &str, original_id: &str) {
        self.remember(&object_key(copy_id), Value::String(original_id.to_string()))
            .await;
    }

    /// Records that `copy_id` is a copy of `user`.
    pub async fn add_user_copy(&self, copy_id: &str, user: &UserKey) {
        match serde_json::to_value(user) {
            Ok(value) => self.remember(&user_key(copy_id), value).await,
            Err(e) => warn!(copy_id, error = %e, "Couldn't cache user copy"),
        }
    }

    pub fn stats(&self) -> OriginalsStatsSnapshot {
        OriginalsStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            queries: self.stats.queries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            local_entries: self.local.len(),
        }
    }

    pub fn clear_local(&self) {
        self.local.clear();
    }

    /// Checks the local layer, then the shared one.
    async fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.local.get(key) {
            if entry.expires_at > Instant::now() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.original.clone());
            }
        }

        match self.shared.get(key).await {
            Ok(Some(original)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.insert_local(key, original.clone());
                return Some(original);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "Shared cache read failed"),
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn remember(&self, key: &str, original: Value) {
        debug!(key, %original, "Caching original");
        self.insert_local(key, original.clone());
        if let Err(e) = self.shared.set(key, original, self.config.shared_ttl).await {
            warn!(key, error = %e, "Shared cache write failed");
        }
    }

    fn insert_local(&self, key: &str, original: Value) {
        if self.local.len() >= self.config.max_entries {
            // Remove expired entries first
            let now = Instant::now();
            let before = self.local.len();
            self.local.retain(|_, v| v.expires_at > now);

            // If still too full, clear half
            if self.local.len() >= self.config.max_entries {
                let to_remove: Vec<String> = self
                    .local
                    .iter()
                    .take(self.local.len() / 2 + 1)
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in to_remove {
                    self.local.remove(&key);
                }
            }

            let evicted = before.saturating_sub(self.local.len()) as u64;
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        self.local.insert(
            key.to_string(),
            CachedOriginal {
                original,
                expires_at: Instant::now() + self.config.local_ttl,
            },
        );
    }
}
