//! Common metadata for all documents
//!
//! Tracks creation and update timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Creation and update timestamps, flattened into every document
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Metadata {
    /// When the document was created
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,

    /// When the document was last written
    #[serde(with = "timestamp")]
    pub updated: DateTime<Utc>,
}

impl Metadata {
    /// Create new metadata with current timestamp
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            updated: now,
        }
    }

    /// Bump the update timestamp
    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-width RFC 3339 timestamps (microseconds, `Z` suffix) so that string
/// order matches time order in every store. Paging cursors use this format.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse(val: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(val).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let val = String::deserialize(d)?;
        parse(&val).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_str(&super::format(dt)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|val| super::parse(&val).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
