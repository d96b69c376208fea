//! Bridged user document schema
//!
//! One document per (native protocol, native id), all protocols in a single
//! collection discriminated by `protocol`.

use std::fmt;

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::{Metadata, Object, SentDm, Target};
use crate::db::store::Model;
use crate::protocol::ProtocolDescriptor;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// Primary key of a bridged user: native protocol label plus native id
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey {
    pub protocol: String,
    pub id: String,
}

impl UserKey {
    pub fn new(protocol: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            id: id.into(),
        }
    }

    /// Storage document id. Protocol labels never contain `:` so this splits
    /// back unambiguously.
    pub fn storage_id(&self) -> String {
        format!("{}:{}", self.protocol, self.id)
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.id)
    }
}

/// Why a user isn't eligible for bridging
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    OptOut,
    Blocked,
}

/// Per-user Ed25519 signing key pair, base64 encoded
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KeyMaterial {
    pub public_key: String,
    pub private_key: String,
}

/// Bridged user stored in the document store
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct User {
    /// Native protocol label
    pub protocol: String,

    /// Native id, immutable
    pub id: String,

    /// Profile object id, if it differs from the default for this protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    /// Bridged copies of this user in other protocols
    #[serde(default)]
    pub copies: Vec<Target>,

    /// Whether this user signed up for the bridge directly, as opposed to
    /// being referenced by someone else. Only ever goes false -> true.
    #[serde(default)]
    pub direct: bool,

    #[serde(default)]
    pub manual_opt_out: bool,

    /// Protocols this user explicitly opted into
    #[serde(default)]
    pub enabled_protocols: Vec<String>,

    #[serde(default)]
    pub sent_dms: Vec<SentDm>,

    /// Canonical user to use in place of this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_instead: Option<UserKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeyMaterial>,

    #[serde(flatten)]
    pub metadata: Metadata,

    /// Loaded profile object, never stored on the user itself
    #[serde(skip)]
    pub profile: Option<Object>,
}

impl User {
    /// Create a new, unsaved user
    pub fn new(protocol: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            id: id.into(),
            profile_id: None,
            copies: vec![],
            direct: false,
            manual_opt_out: false,
            enabled_protocols: vec![],
            sent_dms: vec![],
            use_instead: None,
            keys: None,
            metadata: Metadata::new(),
            profile: None,
        }
    }

    pub fn key(&self) -> UserKey {
        UserKey::new(&self.protocol, &self.id)
    }

    /// This user's id in `to`: its own id in its native protocol, otherwise
    /// the copy there, if any.
    pub fn get_copy(&self, to: &ProtocolDescriptor) -> Option<&str> {
        if to.label == self.protocol {
            return Some(&self.id);
        }
        self.copies
            .iter()
            .find(|copy| copy.protocol == to.label || copy.protocol == to.abbreviation)
            .map(|copy| copy.uri.as_str())
    }

    pub fn has_enabled(&self, protocol: &str) -> bool {
        self.enabled_protocols.iter().any(|p| p == protocol)
    }
}

impl Model for User {
    const COLLECTION: &'static str = USER_COLLECTION;

    fn storage_id(&self) -> String {
        self.key().storage_id()
    }

    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl IntoIndexes for User {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Reverse index: copy id -> original user
            (
                doc! { "copies.uri": 1 },
                Some(
                    IndexOptions::builder()
                        .name("copies_uri_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "protocol": 1, "id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("protocol_id_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
