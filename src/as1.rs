//! Helpers for the canonical activity representation (ActivityStreams 1 JSON)
//!
//! Every protocol's wire format is converted into AS1 before the bridge looks
//! at it. These helpers only read and rewrite the handful of fields the
//! identity model cares about; full AS1 semantics live in the protocol
//! converters.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// AS1 object types that represent actors
pub const ACTOR_TYPES: &[&str] = &["application", "group", "organization", "person", "service"];

/// AS1 verbs, ie activity types
pub const VERBS: &[&str] = &[
    "accept",
    "block",
    "delete",
    "follow",
    "invite",
    "like",
    "post",
    "react",
    "reject",
    "rsvp-interested",
    "rsvp-maybe",
    "rsvp-no",
    "rsvp-yes",
    "share",
    "stop-following",
    "undo",
    "update",
];

/// Fields compared by [`activity_changed`], on the activity and its inner object
const CHANGE_FIELDS: &[&str] = &[
    "objectType",
    "verb",
    "to",
    "content",
    "displayName",
    "summary",
    "location",
    "image",
];

static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/:;@?!'.\s]+\.)+[a-z]{2,}$").expect("valid regex"));

static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Returns true if `val` is an http(s) URL
pub fn is_web(val: &str) -> bool {
    match url::Url::parse(val) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Returns true if `val` looks like a bare domain, eg `foo.com`
pub fn is_domain(val: &str) -> bool {
    DOMAIN_RE.is_match(val)
}

/// Returns the values of a possibly multiply-valued field as a list.
///
/// Missing and null fields yield an empty list, scalars a one-element list.
pub fn get_list(obj: &Value, field: &str) -> Vec<Value> {
    match obj.get(field) {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(val) => vec![val.clone()],
    }
}

/// Returns a field's value as an object. A bare string becomes `{"id": ...}`,
/// a list yields its first element, anything else an empty object.
pub fn get_object(obj: &Value, field: &str) -> Map<String, Value> {
    match obj.get(field) {
        Some(Value::Array(items)) => items.first().map(as_object).unwrap_or_default(),
        Some(val) => as_object(val),
        None => Map::new(),
    }
}

/// Like [`get_object`] but returns every element of a multiply-valued field.
pub fn get_objects(obj: &Value, field: &str) -> Vec<Map<String, Value>> {
    get_list(obj, field)
        .iter()
        .map(as_object)
        .filter(|m| !m.is_empty())
        .collect()
}

fn as_object(val: &Value) -> Map<String, Value> {
    match val {
        Value::String(id) => {
            let mut map = Map::new();
            map.insert("id".to_string(), Value::String(id.clone()));
            map
        }
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}

/// Returns the ids of every object in a field, skipping objects without one.
pub fn get_ids(obj: &Value, field: &str) -> Vec<String> {
    get_objects(obj, field)
        .iter()
        .filter_map(|o| o.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Returns the id of a reference that is either a bare string or an object.
pub fn reference_id(val: &Value) -> Option<&str> {
    match val {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// The object's type: its `objectType`, or its verb if it's an activity.
pub fn object_type(obj: &Value) -> Option<&str> {
    match obj.get("objectType").and_then(Value::as_str) {
        Some(t) if t != "activity" => Some(t),
        _ => obj.get("verb").and_then(Value::as_str),
    }
}

/// Whether this object is an activity, ie its type is a verb.
pub fn is_activity(obj: &Value) -> bool {
    obj.get("objectType").and_then(Value::as_str) == Some("activity")
        || object_type(obj).is_some_and(|t| VERBS.contains(&t))
}

/// Whether this object is an actor, eg a person.
pub fn is_actor(obj: &Value) -> bool {
    object_type(obj).is_some_and(|t| ACTOR_TYPES.contains(&t))
}

/// Returns true if the object is public, false if it's addressed only to
/// specific audiences, None if the audience is unknown.
///
/// Objects with no audience at all are public. `unlisted` controls whether
/// the `@unlisted` alias counts as public.
pub fn is_public(obj: &Value, unlisted: bool) -> Option<bool> {
    let mut to = get_list(obj, "to");
    if to.is_empty() {
        to = get_list(&Value::Object(get_object(obj, "object")), "to");
    }
    if to.is_empty() {
        return Some(true);
    }

    let aliases: Vec<&str> = to
        .iter()
        .filter_map(|t| match t {
            Value::String(alias) => Some(alias.as_str()),
            Value::Object(m) => m.get("alias").and_then(Value::as_str),
            _ => None,
        })
        .collect();

    if aliases.contains(&"@public") || (unlisted && aliases.contains(&"@unlisted")) {
        return Some(true);
    }

    let unknown = to
        .iter()
        .any(|t| t.get("objectType").and_then(Value::as_str) == Some("unknown"));
    if unknown {
        None
    } else {
        Some(false)
    }
}

/// Returns true if `after` differs meaningfully from `before`.
///
/// `in_reply_to` controls whether `inReplyTo` is compared. Bridging rewrites
/// that field between protocols, so callers usually turn it off.
pub fn activity_changed(before: &Value, after: &Value, in_reply_to: bool) -> bool {
    let inner_before = Value::Object(get_object(before, "object"));
    let inner_after = Value::Object(get_object(after, "object"));

    let mut fields = CHANGE_FIELDS.to_vec();
    if in_reply_to {
        fields.push("inReplyTo");
    }

    fields.iter().any(|field| {
        field_changed(before, after, field) || field_changed(&inner_before, &inner_after, field)
    })
}

fn field_changed(before: &Value, after: &Value, field: &str) -> bool {
    let b = trim_nulls(before.get(field).cloned().unwrap_or(Value::Null));
    let a = trim_nulls(after.get(field).cloned().unwrap_or(Value::Null));
    a != b
}

/// Recursively removes nulls, empty strings, empty lists and empty objects.
pub fn trim_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, trim_nulls(v)))
                .filter(|(_, v)| !is_empty(v))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(trim_nulls)
                .filter(|v| !is_empty(v))
                .collect(),
        ),
        other => other,
    }
}

/// Whether a value is null, an empty string, list or object.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Returns the first URL in a field whose values may be strings, objects
/// with `url` or `value`, or lists of either.
pub fn get_url(obj: &Value, field: &str) -> Option<String> {
    first_url(obj.get(field)?)
}

fn first_url(val: &Value) -> Option<String> {
    match val {
        Value::String(url) if !url.is_empty() => Some(url.clone()),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("value"))
            .and_then(first_url),
        Value::Array(items) => items.iter().find_map(first_url),
        _ => None,
    }
}

/// If the id field is missing or not a URL, uses the url field instead.
/// Recurses into `author`, `actor` and `object`.
pub fn use_urls_as_ids(obj: &mut Value) {
    let Some(map) = obj.as_object_mut() else {
        return;
    };

    let id_ok = map
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| is_web(id) || is_domain(id));
    if !id_ok {
        if let Some(url) = map.get("url").and_then(first_url) {
            map.insert("id".to_string(), Value::String(url));
        }
    }

    for field in ["author", "actor", "object"] {
        match map.get_mut(field) {
            Some(Value::Array(items)) => items
                .iter_mut()
                .filter(|item| item.is_object())
                .for_each(use_urls_as_ids),
            Some(inner) if inner.is_object() => use_urls_as_ids(inner),
            _ => {}
        }
    }
}

/// Converts an HTML fragment to plain text. Tags are dropped and the common
/// entities decoded.
pub fn html_to_text(html: &str) -> String {
    HTML_TAG_RE
        .replace_all(html, " ")
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
