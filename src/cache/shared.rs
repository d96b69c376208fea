//! Shared key-value cache with TTL
//!
//! The cross-process cache tier (memcache or similar in production). Misses
//! and failures are equivalent to callers: both fall through to the store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::types::Result;

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process [`SharedCache`], for dev mode and tests
#[derive(Default)]
pub struct MemorySharedCache {
    entries: DashMap<String, Entry>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
