//! Follower edge document schema

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::{Metadata, User, UserKey};
use crate::db::store::Model;

/// Collection name for follower edges
pub const FOLLOWER_COLLECTION: &str = "followers";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowerStatus {
    #[default]
    Active,
    Inactive,
}

impl FollowerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// A follow from one bridged user to another, always across protocols
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Follower {
    pub from: UserKey,
    pub to: UserKey,

    /// Id of the last follow activity for this edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow: Option<String>,

    #[serde(default)]
    pub status: FollowerStatus,

    #[serde(flatten)]
    pub metadata: Metadata,

    /// Counterpart user, attached when paging
    #[serde(skip)]
    pub user: Option<User>,
}

impl Follower {
    pub fn new(from: UserKey, to: UserKey) -> Self {
        Self {
            from,
            to,
            follow: None,
            status: FollowerStatus::Active,
            metadata: Metadata::new(),
            user: None,
        }
    }

    /// Deterministic document id for an edge
    pub fn edge_id(from: &UserKey, to: &UserKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(from.storage_id().as_bytes());
        hasher.update(b"\n");
        hasher.update(to.storage_id().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_active(&self) -> bool {
        self.status == FollowerStatus::Active
    }
}

/// Optional fields applied by follower get-or-create
#[derive(Clone, Debug, Default)]
pub struct FollowerFields {
    pub follow: Option<String>,
    pub status: Option<FollowerStatus>,
}

impl Model for Follower {
    const COLLECTION: &'static str = FOLLOWER_COLLECTION;

    fn storage_id(&self) -> String {
        Self::edge_id(&self.from, &self.to)
    }

    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl IntoIndexes for Follower {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Followers of a user
            (
                doc! { "to.protocol": 1, "to.id": 1, "status": 1, "updated": -1 },
                Some(
                    IndexOptions::builder()
                        .name("to_status_updated_index".to_string())
                        .build(),
                ),
            ),
            // Users a user is following
            (
                doc! { "from.protocol": 1, "from.id": 1, "status": 1, "updated": -1 },
                Some(
                    IndexOptions::builder()
                        .name("from_status_updated_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_id_is_directional() {
        let alice = UserKey::new("activitypub", "https://inst/alice");
        let bob = UserKey::new("atproto", "did:plc:bob");

        let forward = Follower::edge_id(&alice, &bob);
        assert_eq!(forward.len(), 64);
        assert_eq!(forward, Follower::edge_id(&alice, &bob));
        assert_ne!(forward, Follower::edge_id(&bob, &alice));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let edge = Follower::new(
            UserKey::new("web", "user.com"),
            UserKey::new("activitypub", "https://inst/bob"),
        );
        let doc = serde_json::to_value(&edge).unwrap();
        assert_eq!(doc["status"], FollowerStatus::Active.as_str());
        assert_eq!(doc["to"]["id"], "https://inst/bob");
    }
}
