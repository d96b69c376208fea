//! Protocol implementations as seen by the identity model
//!
//! Wire delivery, signatures and format conversion live behind the
//! [`Protocol`] trait. The bridge only needs each protocol's descriptor, its
//! id ownership and translation rules, copy creation, and loading.

pub mod configured;
pub mod registry;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::db::schemas::{Object, Target, User, WireFormat};
use crate::types::BridgeError;

pub use configured::ConfiguredProtocol;
pub use registry::{ProtocolRegistry, RegistryBuilder, INTERNAL_PROTOCOL};

/// Static description of a protocol, registered once per process
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProtocolDescriptor {
    /// Primary label, eg `activitypub`
    pub label: String,

    /// Short label used in bridge subdomains, eg `ap`
    pub abbreviation: String,

    #[serde(default)]
    pub other_labels: Vec<String>,

    /// Whether users and objects get bridged copies with their own ids in
    /// this protocol
    #[serde(default)]
    pub has_copies: bool,

    /// Protocols this protocol's users are bridged into without opting in
    #[serde(default)]
    pub default_enabled: Vec<String>,

    #[serde(default)]
    pub requires_name: bool,

    #[serde(default)]
    pub requires_avatar: bool,

    #[serde(default)]
    pub requires_old_account: bool,

    /// Native content format stored for this protocol's objects
    #[serde(default)]
    pub native_format: Option<WireFormat>,

    /// Whether new users get a signing key pair
    #[serde(default)]
    pub generates_keys: bool,

    /// Test-only protocol, admitted by the registry only in dev mode
    #[serde(default)]
    pub synthetic: bool,
}

impl ProtocolDescriptor {
    pub fn new(label: impl Into<String>, abbreviation: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            abbreviation: abbreviation.into(),
            other_labels: vec![],
            has_copies: false,
            default_enabled: vec![],
            requires_name: false,
            requires_avatar: false,
            requires_old_account: false,
            native_format: None,
            generates_keys: false,
            synthetic: false,
        }
    }

    /// Every name this protocol answers to
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.label.as_str())
            .chain(std::iter::once(self.abbreviation.as_str()))
            .chain(self.other_labels.iter().map(String::as_str))
            .filter(|label| !label.is_empty())
    }

    pub fn is_default_enabled(&self, protocol: &str) -> bool {
        self.default_enabled.iter().any(|p| p == protocol)
    }
}

/// Failures reported by protocol collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// The protocol refused, eg the user's handle is invalid there. Not worth
    /// retrying.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Network or remote server failure
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// One protocol implementation
#[async_trait]
pub trait Protocol: Send + Sync {
    fn descriptor(&self) -> &ProtocolDescriptor;

    fn label(&self) -> &str {
        &self.descriptor().label
    }

    /// Whether this protocol owns `id`. `None` means it can't tell without a
    /// network fetch.
    fn owns_id(&self, id: &str) -> Option<bool>;

    /// Translates one of this protocol's user ids into `to`'s id space.
    /// `to` may be this protocol itself, which normalizes the id.
    fn translate_user_id(&self, id: &str, _to: &ProtocolDescriptor) -> Option<String> {
        Some(id.to_string())
    }

    /// Same as [`Protocol::translate_user_id`] for object ids.
    fn translate_object_id(&self, id: &str, _to: &ProtocolDescriptor) -> Option<String> {
        Some(id.to_string())
    }

    /// Canonical form of a user id in this protocol
    fn normalize_user_id(&self, id: &str) -> String {
        id.to_string()
    }

    /// Default profile object id for a user id
    fn profile_id(&self, user_id: &str) -> String {
        user_id.to_string()
    }

    /// Human-readable handle for a user id, if this protocol has handles
    fn handle(&self, _user_id: &str) -> Option<String> {
        None
    }

    /// Translates one of this protocol's handles into `to`'s handle space
    fn translate_handle(&self, handle: &str, _to: &ProtocolDescriptor) -> Option<String> {
        Some(handle.to_string())
    }

    /// Creates a bridged copy of `user` in this protocol, eg a repo and DID.
    async fn create_copy_for(&self, _user: &User) -> Result<Option<Target>, ProtocolError> {
        Ok(None)
    }

    /// Fetches an object. `remote` forces a fetch instead of a stored read.
    async fn load(&self, _id: &str, _remote: bool) -> Result<Option<Object>, ProtocolError> {
        Ok(None)
    }

    /// Converts this protocol's native content to AS1.
    fn to_as1(&self, _data: &Value, _id: &str) -> Result<Value, ProtocolError> {
        Err(ProtocolError::Rejected(format!(
            "{} has no AS1 converter",
            self.label()
        )))
    }
}
