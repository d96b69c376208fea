//! MongoDB document store
//!
//! Pattern adapted from holo-host/rust/util_libs/db/src/mongodb. Documents
//! keep their id in `_id` and a `_version` counter for compare-and-swap
//! writes. `expire` is stored as a BSON date so the TTL index can reap it.

use bson::{doc, Bson, Document};
use chrono::Utc;
use futures_util::StreamExt;
use mongodb::{
    options::{FindOptions, IndexOptions},
    Client, Collection, IndexModel,
};
use serde_json::Value;
use tracing::{error, info};

use crate::db::schemas::metadata::timestamp;
use crate::db::schemas::{Follower, Object, User};
use crate::db::store::{Direction, DocumentStore, Filter, Model, Precondition, Query, Stored};
use crate::types::{BridgeError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

const VERSION_FIELD: &str = "_version";

/// MongoDB-backed [`DocumentStore`]
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db_name: String,
}

impl MongoStore {
    /// Connect and verify the connection
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BridgeError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BridgeError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.db_name).collection(name)
    }

    /// Apply a schema's indexes to its collection
    pub async fn apply_indexes<T: Model + IntoIndexes>(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.collection(T::COLLECTION)
            .create_indexes(indices)
            .await
            .map_err(|e| BridgeError::Database(format!("Failed to create indexes: {}", e)))?;

        info!(collection = T::COLLECTION, "Applied indexes");
        Ok(())
    }

    /// Apply every collection's indexes
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.apply_indexes::<User>().await?;
        self.apply_indexes::<Object>().await?;
        self.apply_indexes::<Follower>().await?;
        Ok(())
    }
}

/// JSON document -> BSON, with storage bookkeeping fields
fn to_bson_doc(id: &str, version: u64, doc: Value) -> Result<Document> {
    let mut bson_doc = bson::to_document(&doc)?;

    if let Some(Bson::String(expire)) = bson_doc.get("expire") {
        let expire = timestamp::parse(expire)
            .map_err(|e| BridgeError::Validation(format!("Invalid expire {}: {}", expire, e)))?;
        bson_doc.insert("expire", bson::DateTime::from_chrono(expire));
    }

    bson_doc.insert("_id", id);
    bson_doc.insert(VERSION_FIELD, version as i64);
    Ok(bson_doc)
}

/// BSON -> JSON document, stripping storage bookkeeping fields
fn from_bson_doc(mut bson_doc: Document) -> Result<Stored> {
    let id = bson_doc
        .get_str("_id")
        .map_err(|e| BridgeError::Database(format!("Document without string _id: {}", e)))?
        .to_string();
    let version = bson_doc.get_i64(VERSION_FIELD).unwrap_or(0) as u64;
    bson_doc.remove("_id");
    bson_doc.remove(VERSION_FIELD);

    if let Some(Bson::DateTime(expire)) = bson_doc.get("expire") {
        let expire = timestamp::format(&expire.to_chrono());
        bson_doc.insert("expire", expire);
    }

    Ok(Stored {
        id,
        version,
        doc: Bson::Document(bson_doc).into_relaxed_extjson(),
    })
}

fn is_live(bson_doc: &Document) -> bool {
    match bson_doc.get("expire") {
        Some(Bson::DateTime(expire)) => expire.to_chrono() > Utc::now(),
        _ => true,
    }
}

/// Filters -> MongoDB query document. Expired documents the TTL monitor
/// hasn't reaped yet are excluded.
fn filter_doc(filters: &[Filter]) -> Result<Document> {
    let mut clauses = vec![doc! {
        "$or": [
            { "expire": { "$exists": false } },
            { "expire": { "$gt": bson::DateTime::now() } },
        ]
    }];

    for filter in filters {
        let clause = match filter {
            Filter::Eq(path, val) => doc! { path: bson::to_bson(val)? },
            Filter::In(path, vals) => doc! { path: { "$in": bson::to_bson(vals)? } },
            Filter::Gte(path, val) => doc! { path: { "$gte": bson::to_bson(val)? } },
            Filter::Lt(path, val) => doc! { path: { "$lt": bson::to_bson(val)? } },
        };
        clauses.push(clause);
    }

    Ok(doc! { "$and": clauses })
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    let error_str = err.to_string();
    error_str.contains("duplicate key") || error_str.contains("E11000")
}

#[async_trait::async_trait]
impl DocumentStore for MongoStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Stored>> {
        let found = self
            .collection(collection)
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| BridgeError::Database(format!("Find failed: {}", e)))?;

        found.filter(is_live).map(from_bson_doc).transpose()
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Stored>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut cursor = self
            .collection(collection)
            .find(doc! { "_id": { "$in": ids } })
            .await
            .map_err(|e| BridgeError::Database(format!("Find failed: {}", e)))?;

        let mut results = vec![];
        while let Some(found) = cursor.next().await {
            match found {
                Ok(d) if is_live(&d) => results.push(from_bson_doc(d)?),
                Ok(_) => {}
                Err(e) => error!("Error reading document: {}", e),
            }
        }
        Ok(results)
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
        precondition: Precondition,
    ) -> Result<u64> {
        let coll = self.collection(collection);

        match precondition {
            Precondition::Absent => {
                // the TTL monitor runs about once a minute
                coll.delete_one(doc! { "_id": id, "expire": { "$lte": bson::DateTime::now() } })
                    .await?;

                match coll.insert_one(to_bson_doc(id, 1, doc)?).await {
                    Ok(_) => Ok(1),
                    Err(e) if is_duplicate_key(&e) => Err(BridgeError::Conflict(format!(
                        "{}/{} already exists",
                        collection, id
                    ))),
                    Err(e) => Err(BridgeError::Database(format!("Insert failed: {}", e))),
                }
            }
            Precondition::Version(expected) => {
                let result = coll
                    .replace_one(
                        doc! { "_id": id, VERSION_FIELD: expected as i64 },
                        to_bson_doc(id, expected + 1, doc)?,
                    )
                    .await
                    .map_err(|e| BridgeError::Database(format!("Replace failed: {}", e)))?;

                if result.matched_count == 0 {
                    return Err(BridgeError::Conflict(format!(
                        "{}/{} changed since version {}",
                        collection, id, expected
                    )));
                }
                Ok(expected + 1)
            }
        }
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Stored>> {
        let mut options = FindOptions::default();
        if let Some(order) = &query.order {
            let direction = match order.direction {
                Direction::Ascending => 1,
                Direction::Descending => -1,
            };
            options.sort = Some(doc! { order.field.as_str(): direction });
        }
        options.limit = query.limit.map(|limit| limit as i64);

        let mut cursor = self
            .collection(collection)
            .find(filter_doc(&query.filters)?)
            .with_options(options)
            .await
            .map_err(|e| BridgeError::Database(format!("Find failed: {}", e)))?;

        let mut results = vec![];
        while let Some(found) = cursor.next().await {
            match found {
                Ok(d) => results.push(from_bson_doc(d)?),
                Err(e) => error!("Error reading document: {}", e),
            }
        }
        Ok(results)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64> {
        self.collection(collection)
            .count_documents(filter_doc(filters)?)
            .await
            .map_err(|e| BridgeError::Database(format!("Count failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    // Store round trips need a running MongoDB instance; these cover the
    // document conversions.
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bson_round_trip() {
        let doc = json!({
            "id": "https://inst/note",
            "copies": [{"protocol": "atproto", "uri": "at://did:plc:a/p/1"}],
            "expire": "2030-01-01T00:00:00.000000Z",
            "deleted": false,
        });

        let bson_doc = to_bson_doc("https://inst/note", 3, doc.clone()).unwrap();
        assert!(matches!(bson_doc.get("expire"), Some(Bson::DateTime(_))));
        assert_eq!(bson_doc.get_i64(VERSION_FIELD).unwrap(), 3);

        let stored = from_bson_doc(bson_doc).unwrap();
        assert_eq!(stored.id, "https://inst/note");
        assert_eq!(stored.version, 3);
        assert_eq!(stored.doc, doc);
    }

    #[test]
    fn test_filter_doc() {
        let filter = filter_doc(&[
            Filter::Eq("copies.uri".into(), json!("did:plc:a")),
            Filter::In("protocol".into(), vec![json!("web"), json!("activitypub")]),
        ])
        .unwrap();

        let clauses = filter.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 3);
        assert_eq!(
            clauses[1],
            Bson::Document(doc! { "copies.uri": "did:plc:a" })
        );
    }
}
