//! Cursor paging over timestamped documents
//!
//! Cursors are ISO 8601 timestamps on the paging field. `after` pages forward
//! from (and including) a timestamp, `before` pages back from (excluding)
//! one. Every page comes back newest first.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::as1;
use crate::bridge::Bridge;
use crate::db::schemas::metadata::timestamp;
use crate::db::schemas::Object;
use crate::db::store::{self, Direction, DocumentStore, Model, Query};
use crate::types::{BridgeError, Result};

/// Parses an ISO 8601 timestamp. Values without an offset are UTC.
pub(crate) fn parse_datetime(val: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(val) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(val, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

/// Raw paging parameters as they arrive in a request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageParams {
    pub before: Option<String>,
    pub after: Option<String>,
}

impl PageParams {
    pub fn before(cursor: impl Into<String>) -> Self {
        Self {
            before: Some(cursor.into()),
            after: None,
        }
    }

    pub fn after(cursor: impl Into<String>) -> Self {
        Self {
            before: None,
            after: Some(cursor.into()),
        }
    }

    fn parse(&self) -> Result<Cursor> {
        let before = parse_param("before", self.before.as_deref())?;
        let after = parse_param("after", self.after.as_deref())?;

        match (before, after) {
            (Some(_), Some(_)) => Err(BridgeError::BadRequest(
                "Can't handle both before and after".to_string(),
            )),
            (Some(before), None) => Ok(Cursor::Before(before)),
            (None, Some(after)) => Ok(Cursor::After(after)),
            (None, None) => Ok(Cursor::Latest),
        }
    }
}

fn parse_param(name: &str, val: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match val.filter(|val| !val.is_empty()) {
        // query strings turn + into space
        Some(val) => parse_datetime(&val.replace(' ', "+"))
            .map(Some)
            .map_err(|e| {
                BridgeError::BadRequest(format!("Couldn't parse {} {:?} as ISO 8601: {}", name, val, e))
            }),
        None => Ok(None),
    }
}

enum Cursor {
    Latest,
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
}

/// One page of results, newest first, plus cursors for the neighboring pages
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// `before` value for the next older page
    pub before: Option<String>,

    /// `after` value for the next newer page
    pub after: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            before: self.before,
            after: self.after,
        }
    }
}

/// Runs one page of `query` ordered on the timestamp `field`, which `key`
/// reads back from a result.
pub async fn fetch_page<T, K>(
    store: &dyn DocumentStore,
    query: Query,
    field: &str,
    key: K,
    params: &PageParams,
    page_size: usize,
) -> Result<Page<T>>
where
    T: Model,
    K: Fn(&T) -> DateTime<Utc>,
{
    let cursor = params.parse()?;
    let query = match &cursor {
        Cursor::After(after) => query
            .gte(field, timestamp::format(after))
            .order(field, Direction::Ascending),
        Cursor::Before(before) => query
            .lt(field, timestamp::format(before))
            .order(field, Direction::Descending),
        Cursor::Latest => query.order(field, Direction::Descending),
    };

    let mut items = store::query::<T>(store, &query.limit(page_size + 1)).await?;
    let has_next = items.len() > page_size;
    items.truncate(page_size);
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));

    let newest = items.first().map(&key);
    let oldest = items.last().map(&key);

    let (before, after) = match cursor {
        Cursor::Before(before) => (oldest.filter(|_| has_next), Some(before)),
        Cursor::After(after) => (Some(oldest.unwrap_or(after)), newest.filter(|_| has_next)),
        Cursor::Latest => (oldest.filter(|_| has_next), None),
    };

    debug!(field, count = items.len(), has_next, "Fetched page");
    Ok(Page {
        items,
        before: before.map(|dt| timestamp::format(&dt)),
        after: after.map(|dt| timestamp::format(&dt)),
    })
}

/// Which timestamp to page objects by
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectOrder {
    Updated,
    Created,
}

impl ObjectOrder {
    fn field(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Created => "created",
        }
    }

    fn key(self, obj: &Object) -> DateTime<Utc> {
        match self {
            Self::Updated => obj.metadata.updated,
            Self::Created => obj.metadata.created,
        }
    }
}

impl Bridge {
    /// One page of objects matching `query`. Deleted objects and objects
    /// that aren't public are dropped from the page; cursors still cover
    /// them.
    pub async fn fetch_objects(
        &self,
        query: Query,
        by: ObjectOrder,
        params: &PageParams,
    ) -> Result<Page<Object>> {
        let mut page = fetch_page(
            self.store(),
            query,
            by.field(),
            |obj: &Object| by.key(obj),
            params,
            self.config.page_size,
        )
        .await?;

        page.items.retain(|obj| {
            !obj.deleted
                && obj
                    .as1(&self.registry)
                    .is_some_and(|val| is_public(&val))
        });
        Ok(page)
    }
}

fn is_public(obj: &Value) -> bool {
    as1::is_public(obj, false) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime() {
        let dt = parse_datetime("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(timestamp::format(&dt), "2024-03-01T12:00:00.000000Z");

        let dt = parse_datetime("2024-03-01T14:00:00+02:00").unwrap();
        assert_eq!(timestamp::format(&dt), "2024-03-01T12:00:00.000000Z");

        let naive = parse_datetime("2024-03-01T12:00:00.5").unwrap();
        assert_eq!(timestamp::format(&naive), "2024-03-01T12:00:00.500000Z");

        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn test_params_plus_decoded_from_space() {
        let params = PageParams::after("2024-03-01T14:00:00 02:00");
        match params.parse().unwrap() {
            Cursor::After(dt) => assert_eq!(timestamp::format(&dt), "2024-03-01T12:00:00.000000Z"),
            _ => panic!("expected after cursor"),
        }
    }

    #[test]
    fn test_params_both_is_bad_request() {
        let params = PageParams {
            before: Some("2024-03-01T12:00:00Z".into()),
            after: Some("2024-03-01T12:00:00Z".into()),
        };
        let err = params.parse().err().unwrap();
        assert!(matches!(err, BridgeError::BadRequest(_)));
        assert_eq!(err.status_code(), 400);

        let err = PageParams::before("nope").parse().err().unwrap();
        assert!(matches!(err, BridgeError::BadRequest(_)));
    }

    #[test]
    fn test_empty_params_are_latest() {
        let params = PageParams {
            before: Some(String::new()),
            after: None,
        };
        assert!(matches!(params.parse().unwrap(), Cursor::Latest));
    }
}
