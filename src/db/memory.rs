//! In-process document store
//!
//! Used in dev mode and tests. Emulates the parts of MongoDB the bridge
//! relies on: dotted paths matching any array element, version
//! compare-and-swap, and TTL expiry on the `expire` field.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::db::schemas::metadata::timestamp;
use crate::db::store::{Direction, DocumentStore, Filter, Precondition, Query, Stored};
use crate::types::{BridgeError, Result};

type Collection = BTreeMap<String, Stored>;

/// Document store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    queries: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queries and counts run so far. Point reads aren't counted.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| BridgeError::Database("Lock poisoned".into()))
    }

    fn matching(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Stored>> {
        let collections = self.read()?;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|stored| !is_expired(&stored.doc))
                    .filter(|stored| filters.iter().all(|f| matches_filter(&stored.doc, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Stored>> {
        let collections = self.read()?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .filter(|stored| !is_expired(&stored.doc))
            .cloned())
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Stored>> {
        let collections = self.read()?;
        let Some(docs) = collections.get(collection) else {
            return Ok(vec![]);
        };
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id))
            .filter(|stored| !is_expired(&stored.doc))
            .cloned()
            .collect())
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
        precondition: Precondition,
    ) -> Result<u64> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| BridgeError::Database("Lock poisoned".into()))?;
        let docs = collections.entry(collection.to_string()).or_default();

        let current = docs
            .get(id)
            .filter(|stored| !is_expired(&stored.doc))
            .map(|stored| stored.version);

        let version = match (precondition, current) {
            (Precondition::Absent, None) => docs.get(id).map_or(1, |expired| expired.version + 1),
            (Precondition::Version(expected), Some(actual)) if expected == actual => actual + 1,
            _ => {
                return Err(BridgeError::Conflict(format!(
                    "{}/{} was written concurrently",
                    collection, id
                )))
            }
        };

        docs.insert(
            id.to_string(),
            Stored {
                id: id.to_string(),
                version,
                doc,
            },
        );
        Ok(version)
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Stored>> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let mut results = self.matching(collection, &query.filters)?;
        if let Some(order) = &query.order {
            results.sort_by(|a, b| {
                let ord = compare(
                    field_values(&a.doc, &order.field).first().copied(),
                    field_values(&b.doc, &order.field).first().copied(),
                );
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.matching(collection, filters)?.len() as u64)
    }
}

fn is_expired(doc: &Value) -> bool {
    doc.get("expire")
        .and_then(Value::as_str)
        .and_then(|val| timestamp::parse(val).ok())
        .is_some_and(|expire| expire <= Utc::now())
}

/// Every value at a dotted path, fanning out through arrays.
fn field_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|val| match val {
                Value::Array(items) => items.iter().filter_map(|item| item.get(segment)).collect(),
                other => other.get(segment).into_iter().collect::<Vec<_>>(),
            })
            .collect();
    }

    current
        .into_iter()
        .flat_map(|val| match val {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        })
        .collect()
}

fn matches_filter(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(path, expected) => field_values(doc, path).iter().any(|v| *v == expected),
        Filter::In(path, options) => field_values(doc, path)
            .iter()
            .any(|v| options.iter().any(|o| o == *v)),
        Filter::Gte(path, bound) => field_values(doc, path)
            .iter()
            .any(|v| comparable(v, bound) && compare(Some(*v), Some(bound)) != CmpOrdering::Less),
        Filter::Lt(path, bound) => field_values(doc, path)
            .iter()
            .any(|v| comparable(v, bound) && compare(Some(*v), Some(bound)) == CmpOrdering::Less),
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::String(_), Value::String(_)) | (Value::Number(_), Value::Number(_))
    )
}

/// Orders missing values first, then by type, then by value.
fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(a), Some(b)) => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(val: &Value) -> u8 {
    match val {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}
