//! Shared test harness: fake protocols over the in-memory store and cache

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use fedbridge::cache::MemorySharedCache;
use fedbridge::db::schemas::{Follower, Object, Target, User, UserKey};
use fedbridge::db::store::{DocumentStore, Model, Precondition};
use fedbridge::db::MemoryStore;
use fedbridge::notify::{ChannelNotifier, DirectMessage};
use fedbridge::protocol::{Protocol, ProtocolDescriptor, ProtocolError, ProtocolRegistry};
use fedbridge::{Bridge, BridgeConfig};

/// Protocol that owns every id starting with its prefix
pub struct FakeProtocol {
    desc: ProtocolDescriptor,
    prefix: String,
    profiles: Mutex<HashMap<String, Object>>,
    reject_copies: Mutex<Option<String>>,
    translate_ids: bool,
    pub copies_created: AtomicU32,
    pub loads: AtomicU32,
}

impl FakeProtocol {
    pub fn new(desc: ProtocolDescriptor, prefix: &str) -> Self {
        Self {
            desc,
            prefix: prefix.to_string(),
            profiles: Mutex::new(HashMap::new()),
            reject_copies: Mutex::new(None),
            translate_ids: false,
            copies_created: AtomicU32::new(0),
            loads: AtomicU32::new(0),
        }
    }

    /// Normalizes user ids to `{prefix}user/...` and object ids to
    /// `{prefix}post/...`
    pub fn translating(mut self) -> Self {
        self.translate_ids = true;
        self
    }

    fn translate(&self, id: &str, kind: &str) -> Option<String> {
        match id.strip_prefix(&self.prefix) {
            Some(rest) if self.translate_ids && !rest.starts_with(kind) => {
                Some(format!("{}{}/{}", self.prefix, kind, rest))
            }
            _ => Some(id.to_string()),
        }
    }

    /// Serves `profile` as the remote profile for `id`
    pub fn set_profile(&self, id: &str, profile: Value) {
        let mut obj = Object::from_as1(id, profile);
        obj.source_protocol = Some(self.desc.label.clone());
        self.profiles.lock().unwrap().insert(id.to_string(), obj);
    }

    /// Makes copy creation fail with a rejection
    pub fn reject_copies(&self, reason: &str) {
        *self.reject_copies.lock().unwrap() = Some(reason.to_string());
    }

    pub fn copy_id(&self, user_id: &str) -> String {
        format!("{}copy/{}", self.prefix, user_id)
    }
}

#[async_trait]
impl Protocol for FakeProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.desc
    }

    fn owns_id(&self, id: &str) -> Option<bool> {
        Some(id.starts_with(&self.prefix))
    }

    fn translate_user_id(&self, id: &str, _to: &ProtocolDescriptor) -> Option<String> {
        self.translate(id, "user")
    }

    fn translate_object_id(&self, id: &str, _to: &ProtocolDescriptor) -> Option<String> {
        self.translate(id, "post")
    }

    fn handle(&self, user_id: &str) -> Option<String> {
        user_id
            .strip_prefix(&self.prefix)
            .map(|name| format!("@{}.{}", name, self.desc.label))
    }

    fn translate_handle(&self, handle: &str, to: &ProtocolDescriptor) -> Option<String> {
        if to.label == self.desc.label {
            return Some(handle.to_string());
        }
        Some(format!("{}.{}.brid.gy", handle.trim_start_matches('@'), to.abbreviation))
    }

    async fn create_copy_for(&self, user: &User) -> Result<Option<Target>, ProtocolError> {
        if let Some(reason) = self.reject_copies.lock().unwrap().clone() {
            return Err(ProtocolError::Rejected(reason));
        }
        self.copies_created.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Target::new(self.desc.label.as_str(), self.copy_id(&user.id))))
    }

    async fn load(&self, id: &str, _remote: bool) -> Result<Option<Object>, ProtocolError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.profiles.lock().unwrap().get(id).cloned())
    }
}

fn descriptor(label: &str, abbreviation: &str) -> ProtocolDescriptor {
    let mut desc = ProtocolDescriptor::new(label, abbreviation);
    desc.synthetic = true;
    desc.has_copies = true;
    desc
}

pub struct Harness {
    pub bridge: Bridge,
    pub store: Arc<MemoryStore>,
    pub dms: UnboundedReceiver<DirectMessage>,

    /// `fake:` ids; bridged into `other` by default
    pub fake: Arc<FakeProtocol>,

    /// `other:` ids; bridged into `fake` by default
    pub other: Arc<FakeProtocol>,

    /// `efake:` ids; requires names, nothing bridges into it by default
    pub efake: Arc<FakeProtocol>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Same protocols, but `fake` and `other` translate user and object ids
    /// differently. See [`FakeProtocol::translating`].
    pub fn translating() -> Self {
        Self::build(true)
    }

    fn build(translating: bool) -> Self {
        let mut fake = descriptor("fake", "fa");
        fake.default_enabled = vec!["other".into()];
        fake.generates_keys = true;

        let mut other = descriptor("other", "ot");
        other.default_enabled = vec!["fake".into()];

        let mut efake = descriptor("efake", "efake");
        efake.requires_name = true;

        let mut fake = FakeProtocol::new(fake, "fake:");
        let mut other = FakeProtocol::new(other, "other:");
        if translating {
            fake = fake.translating();
            other = other.translating();
        }
        let fake = Arc::new(fake);
        let other = Arc::new(other);
        let efake = Arc::new(FakeProtocol::new(efake, "efake:"));

        let registry = ProtocolRegistry::builder()
            .allow_synthetic(true)
            .register(fake.clone())
            .register(other.clone())
            .register(efake.clone())
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let (notifier, dms) = ChannelNotifier::new();
        let config = BridgeConfig {
            allow_synthetic: true,
            ..Default::default()
        };
        let bridge = Bridge::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(MemorySharedCache::new()),
            Arc::new(notifier),
            config,
        );

        Self {
            bridge,
            store,
            dms,
            fake,
            other,
            efake,
        }
    }

    /// Stores a user directly, bypassing get-or-create
    pub async fn put_user(&self, user: &User) {
        self.store
            .put(
                User::COLLECTION,
                &user.storage_id(),
                serde_json::to_value(user).unwrap(),
                Precondition::Absent,
            )
            .await
            .unwrap();
    }

    /// Stores an object directly, bypassing validation
    pub async fn put_object(&self, obj: &Object) {
        self.store
            .put(
                Object::COLLECTION,
                &obj.storage_id(),
                serde_json::to_value(obj).unwrap(),
                Precondition::Absent,
            )
            .await
            .unwrap();
    }

    /// Stores an active follower edge last updated at `updated`
    pub async fn put_follower(&self, from: &UserKey, to: &UserKey, updated: DateTime<Utc>) {
        let mut follower = Follower::new(from.clone(), to.clone());
        follower.metadata.created = updated;
        follower.metadata.updated = updated;
        self.store
            .put(
                Follower::COLLECTION,
                &follower.storage_id(),
                serde_json::to_value(&follower).unwrap(),
                Precondition::Absent,
            )
            .await
            .unwrap();
    }
}

/// A public profile with a display name
pub fn profile(name: &str) -> Value {
    json!({
        "objectType": "person",
        "displayName": name,
    })
}
