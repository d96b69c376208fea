//! Abstract document store
//!
//! Documents are JSON values keyed by (collection, id) and carry a version
//! number for optimistic compare-and-swap writes. Transactions over a single
//! document are built from a read, a conditional put, and [`transact`]'s
//! retry loop.

use std::future::Future;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::db::schemas::Metadata;
use crate::types::{BridgeError, Result};

/// A document type with a home collection and a deterministic id
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn storage_id(&self) -> String;

    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// A stored document plus its version
#[derive(Clone, Debug, PartialEq)]
pub struct Stored {
    pub id: String,
    pub version: u64,
    pub doc: Value,
}

/// Condition a put must satisfy, otherwise it fails with `Conflict`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// No document with this id exists
    Absent,
    /// The stored document is at this version
    Version(u64),
}

impl From<Option<u64>> for Precondition {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(v) => Self::Version(v),
            None => Self::Absent,
        }
    }
}

/// Query filter on a dotted field path. Paths through arrays match if any
/// element matches.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lt(String, Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// Filtered, ordered, limited query
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, val: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), val.into()));
        self
    }

    pub fn is_in(mut self, field: &str, vals: Vec<Value>) -> Self {
        self.filters.push(Filter::In(field.to_string(), vals));
        self
    }

    pub fn gte(mut self, field: &str, val: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field.to_string(), val.into()));
        self
    }

    pub fn lt(mut self, field: &str, val: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.to_string(), val.into()));
        self
    }

    pub fn order(mut self, field: &str, direction: Direction) -> Self {
        self.order = Some(Order {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Transactional document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Stored>>;

    /// Batch get. Missing documents are skipped; order is not preserved.
    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Stored>>;

    /// Writes a document if `precondition` holds. Returns the new version.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
        precondition: Precondition,
    ) -> Result<u64>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Stored>>;

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64>;
}

/// Runs `body` until it doesn't fail with `Conflict`, at most
/// `max_attempts` times. Bodies must be idempotent: re-read, re-merge,
/// re-write.
pub async fn transact<T, F, Fut>(max_attempts: u32, mut body: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match body().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                debug!(attempt, error = %err, "Retrying transaction");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Reads and deserializes a model, returning it with its version.
pub async fn load<T: Model>(store: &dyn DocumentStore, id: &str) -> Result<Option<(T, u64)>> {
    match store.get(T::COLLECTION, id).await? {
        Some(stored) => Ok(Some((serde_json::from_value(stored.doc)?, stored.version))),
        None => Ok(None),
    }
}

/// Bumps `updated` and writes a model, conditional on the version it was
/// read at (`None` for new documents).
pub async fn save<T: Model>(
    store: &dyn DocumentStore,
    model: &mut T,
    version: Option<u64>,
) -> Result<u64> {
    model.mut_metadata().touch();
    write(store, model, version).await
}

/// [`save`] without bumping `updated`, for callers that derive other fields
/// from it before writing.
pub async fn write<T: Model>(
    store: &dyn DocumentStore,
    model: &T,
    version: Option<u64>,
) -> Result<u64> {
    let doc = serde_json::to_value(model)?;
    let id = model.storage_id();
    debug!(collection = T::COLLECTION, id = %id, ?version, "Writing document");
    store.put(T::COLLECTION, &id, doc, version.into()).await
}

/// Runs a query and deserializes the results.
pub async fn query<T: Model>(store: &dyn DocumentStore, query: &Query) -> Result<Vec<T>> {
    store
        .query(T::COLLECTION, query)
        .await?
        .into_iter()
        .map(|stored| serde_json::from_value(stored.doc).map_err(BridgeError::from))
        .collect()
}
