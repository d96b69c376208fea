//! Protocol + URI pairs and sent-DM records, embedded in users and objects

use serde::{Deserialize, Serialize};

/// A protocol plus a URI in that protocol.
///
/// Used for copies of users and objects in other protocols (DIDs, `at://`
/// URIs...) and for delivery destinations. Equality and hashing cover exactly
/// the protocol and the URI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub protocol: String,
    pub uri: String,
}

impl Target {
    pub fn new(protocol: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            uri: uri.into(),
        }
    }
}

/// Kinds of DM the bridge sends to users
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DmKind {
    RequestBridging,
    RepliedToBridgedUser,
    Welcome,
}

/// A DM we've already attempted to send, so we don't send it twice
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SentDm {
    pub protocol: String,
    pub kind: DmKind,
}

/// Adds `val` to `vals` if it isn't already there. Returns whether it was added.
pub(crate) fn add_unique<T: PartialEq>(vals: &mut Vec<T>, val: T) -> bool {
    if vals.contains(&val) {
        false
    } else {
        vals.push(val);
        true
    }
}
