//! The bridge core: shared handles for every user, object and follower
//! operation
//!
//! Operations are implemented in `services::{users, objects, followers,
//! paging}` as `impl Bridge` blocks.

use std::sync::Arc;

use crate::cache::{OriginalsCache, SharedCache};
use crate::config::BridgeConfig;
use crate::db::store::DocumentStore;
use crate::notify::Notifier;
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::types::{BridgeError, Result};

pub struct Bridge {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) registry: Arc<ProtocolRegistry>,
    pub(crate) originals: OriginalsCache,
    pub(crate) shared: Arc<dyn SharedCache>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<ProtocolRegistry>,
        shared: Arc<dyn SharedCache>,
        notifier: Arc<dyn Notifier>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            originals: OriginalsCache::new(shared.clone(), config.originals.clone()),
            shared,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn originals(&self) -> &OriginalsCache {
        &self.originals
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Looks up a registered protocol, failing with `NotFound`
    pub(crate) fn protocol(&self, label: &str) -> Result<Arc<dyn Protocol>> {
        self.registry
            .lookup(label)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("No protocol {}", label)))
    }
}
