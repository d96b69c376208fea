//! Bridged activity/object document schema
//!
//! Content is stored in exactly one variant: the protocol-native document, AS1
//! synthesized by the bridge, or a raw payload. The canonical AS1 form is
//! derived on read and never stored.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::as1;
use crate::db::mongo::IntoIndexes;
use crate::db::schemas::metadata::timestamp;
use crate::db::schemas::{Metadata, Target, UserKey};
use crate::db::store::Model;
use crate::protocol::registry::ProtocolRegistry;
use crate::protocol::ProtocolDescriptor;

/// Collection name for objects
pub const OBJECT_COLLECTION: &str = "objects";

/// Protocol-native wire formats the bridge stores verbatim
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// ActivityStreams 2 JSON-LD
    As2,
    /// AT Protocol repository record
    Bsky,
    /// Parsed microformats2 JSON
    Mf2,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    Atom,
    Rss,
}

/// The feed document synthesized AS1 was extracted from
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeedArchive {
    pub format: FeedFormat,
    pub document: String,

    /// Which of the synthesized `items` this object is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<usize>,
}

/// Object content. Exactly one variant is populated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Native {
        format: WireFormat,
        data: Value,
    },
    Synthesized {
        as1: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feed: Option<FeedArchive>,
    },
    Raw {
        data: Value,
    },
}

/// Bridged object stored in the document store
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Object {
    /// Globally unique id, usually a URL or `at://` URI
    pub id: String,

    /// Protocol label, or `ui` for objects the bridge created itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    /// Bridged copies of this object in other protocols
    #[serde(default)]
    pub copies: Vec<Target>,

    /// Users this object belongs to
    #[serde(default)]
    pub users: Vec<UserKey>,

    /// Users who should see this in their notifications
    #[serde(default)]
    pub notify: Vec<UserKey>,

    /// Users who should see this in their feeds
    #[serde(default)]
    pub feed: Vec<UserKey>,

    #[serde(default)]
    pub deleted: bool,

    /// Only `activity` so far
    #[serde(default)]
    pub labels: Vec<String>,

    /// Storage-level TTL for ephemeral kinds
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp::option"
    )]
    pub expire: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub metadata: Metadata,

    /// Set by get-or-create: whether this call created the object
    #[serde(skip)]
    pub new: Option<bool>,

    /// Set by get-or-create: whether the canonical form changed meaningfully
    #[serde(skip)]
    pub changed: Option<bool>,
}

impl Object {
    /// Create a new, unsaved object
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_protocol: None,
            content: None,
            copies: vec![],
            users: vec![],
            notify: vec![],
            feed: vec![],
            deleted: false,
            labels: vec![],
            expire: None,
            metadata: Metadata::new(),
            new: None,
            changed: None,
        }
    }

    /// New object with synthesized AS1 content
    pub fn from_as1(id: impl Into<String>, as1: Value) -> Self {
        let mut obj = Self::new(id);
        obj.content = Some(Content::Synthesized { as1, feed: None });
        obj
    }

    /// The canonical AS1 form, or `None` if there's no content or it can't be
    /// converted.
    pub fn as1(&self, registry: &ProtocolRegistry) -> Option<Value> {
        let mut obj = match self.content.as_ref()? {
            Content::Synthesized { as1, feed: None } => as1.clone(),
            Content::Synthesized { as1, feed: Some(feed) } => {
                let mut obj = match (feed.item, as1.get("items").and_then(Value::as_array)) {
                    (Some(index), Some(items)) => items.get(index)?.clone(),
                    _ => as1.clone(),
                };
                as1::use_urls_as_ids(&mut obj);
                obj
            }
            Content::Native { format, data } => {
                let protocol = registry.for_format(*format)?;
                let mut obj = match protocol.to_as1(data, &self.id) {
                    Ok(obj) => obj,
                    Err(err) => {
                        info!(id = %self.id, error = %err, "Couldn't convert to AS1");
                        return None;
                    }
                };
                // mf2 ids are its urls
                if *format == WireFormat::Mf2 {
                    as1::use_urls_as_ids(&mut obj);
                }
                obj
            }
            Content::Raw { .. } => return None,
        };

        if let Some(map) = obj.as_object_mut() {
            map.entry("id")
                .or_insert_with(|| Value::String(self.id.clone()));
        }
        Some(obj)
    }

    /// AS1 objectType, or verb if it's an activity
    pub fn object_type(&self, registry: &ProtocolRegistry) -> Option<String> {
        self.as1(registry)
            .and_then(|obj| as1::object_type(&obj).map(str::to_string))
    }

    /// This object's id in `to`. The source protocol's id is the object's
    /// own.
    pub fn get_copy(&self, to: &ProtocolDescriptor) -> Option<&str> {
        let matches = |label: &str| label == to.label || label == to.abbreviation;
        if self.source_protocol.as_deref().is_some_and(matches) {
            return Some(&self.id);
        }
        self.copies
            .iter()
            .find(|copy| matches(&copy.protocol))
            .map(|copy| copy.uri.as_str())
    }
}

impl Model for Object {
    const COLLECTION: &'static str = OBJECT_COLLECTION;

    fn storage_id(&self) -> String {
        self.id.clone()
    }

    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl IntoIndexes for Object {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Reverse index: copy id -> original object
            (
                doc! { "copies.uri": 1 },
                Some(
                    IndexOptions::builder()
                        .name("copies_uri_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "users.protocol": 1, "users.id": 1, "updated": -1 },
                Some(
                    IndexOptions::builder()
                        .name("users_updated_index".to_string())
                        .build(),
                ),
            ),
            // Ephemeral kinds are garbage collected by the store
            (
                doc! { "expire": 1 },
                Some(
                    IndexOptions::builder()
                        .name("expire_ttl".to_string())
                        .expire_after(std::time::Duration::from_secs(0))
                        .build(),
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_is_tagged() {
        let obj = Object::from_as1("https://a/note", json!({"objectType": "note"}));
        let doc = serde_json::to_value(&obj).unwrap();
        assert_eq!(doc["content"]["kind"], json!("synthesized"));
        assert!(doc.get("new").is_none());
        assert!(doc.get("expire").is_none());
    }

    #[test]
    fn test_as1_backfills_id() {
        let registry = ProtocolRegistry::builder().build().unwrap();
        let obj = Object::from_as1("https://a/note", json!({"objectType": "note"}));
        assert_eq!(
            obj.as1(&registry).unwrap(),
            json!({"id": "https://a/note", "objectType": "note"})
        );
        assert_eq!(obj.object_type(&registry).as_deref(), Some("note"));
    }

    #[test]
    fn test_as1_feed_item() {
        let registry = ProtocolRegistry::builder().build().unwrap();
        let mut obj = Object::new("https://a/feed#2");
        obj.content = Some(Content::Synthesized {
            as1: json!({"items": [
                {"objectType": "note", "id": "x", "url": "https://a/1"},
                {"objectType": "note", "url": "https://a/2"},
            ]}),
            feed: Some(FeedArchive {
                format: FeedFormat::Atom,
                document: "<feed/>".into(),
                item: Some(1),
            }),
        });

        assert_eq!(
            obj.as1(&registry).unwrap(),
            json!({"objectType": "note", "id": "https://a/2", "url": "https://a/2"})
        );
    }

    struct Mf2Protocol {
        desc: ProtocolDescriptor,
    }

    #[async_trait::async_trait]
    impl crate::protocol::Protocol for Mf2Protocol {
        fn descriptor(&self) -> &ProtocolDescriptor {
            &self.desc
        }

        fn owns_id(&self, id: &str) -> Option<bool> {
            Some(id.starts_with("https://blog.example/"))
        }

        fn to_as1(&self, data: &Value, _id: &str) -> Result<Value, crate::protocol::ProtocolError> {
            Ok(data.clone())
        }
    }

    #[test]
    fn test_as1_mf2_uses_urls_as_ids() {
        let mut desc = ProtocolDescriptor::new("web", "web");
        desc.native_format = Some(WireFormat::Mf2);
        let registry = ProtocolRegistry::builder()
            .register(std::sync::Arc::new(Mf2Protocol { desc }))
            .build()
            .unwrap();

        let mut obj = Object::new("tag:blog,2024:1");
        obj.content = Some(Content::Native {
            format: WireFormat::Mf2,
            data: json!({
                "objectType": "note",
                "url": "https://blog.example/post",
                "author": {"url": "https://blog.example/"},
            }),
        });

        let as1 = obj.as1(&registry).unwrap();
        assert_eq!(as1["id"], json!("https://blog.example/post"));
        assert_eq!(as1["author"]["id"], json!("https://blog.example/"));
    }

    #[test]
    fn test_raw_has_no_canonical_form() {
        let registry = ProtocolRegistry::builder().build().unwrap();
        let mut obj = Object::new("https://a/raw");
        obj.content = Some(Content::Raw { data: json!({"x": 1}) });
        assert!(obj.as1(&registry).is_none());
        assert!(Object::new("https://a/empty").as1(&registry).is_none());
    }

    #[test]
    fn test_get_copy() {
        let mut obj = Object::new("https://inst/note/1");
        obj.source_protocol = Some("ap".into());
        obj.copies.push(Target::new("atproto", "at://did:plc:a/app.bsky.feed.post/1"));

        let ap = ProtocolDescriptor::new("activitypub", "ap");
        let atproto = ProtocolDescriptor::new("atproto", "bsky");
        assert_eq!(obj.get_copy(&ap), Some("https://inst/note/1"));
        assert_eq!(obj.get_copy(&atproto), Some("at://did:plc:a/app.bsky.feed.post/1"));
        assert_eq!(obj.get_copy(&ProtocolDescriptor::new("web", "web")), None);
    }
}
