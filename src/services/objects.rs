//! Bridged activity/object lifecycle
//!
//! Get-or-create with owner authorization, pre-write validation, copy
//! tracking, and the two id rewriting passes: `resolve_ids` maps copy ids
//! back to originals through the copy resolution cache, `normalize_ids`
//! maps ids to each protocol's canonical form.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::as1;
use crate::bridge::Bridge;
use crate::db::schemas::target::add_unique;
use crate::db::schemas::{Content, Object, Target, UserKey, WireFormat};
use crate::db::store::{self, transact};
use crate::protocol::INTERNAL_PROTOCOL;
use crate::types::{BridgeError, Result};

/// Object types that expire from storage. `None` is objects with no type.
const EXPIRE_TYPES: &[Option<&str>] = &[
    Some("accept"),
    Some("block"),
    Some("delete"),
    Some("post"),
    Some("reject"),
    Some("undo"),
    Some("update"),
    None,
];

/// Fields that `@context` is stripped from inside AS2 documents
const CONTEXT_FIELDS: &[&str] = &["actor", "attributedTo", "author", "object"];

/// Settable fields for [`Bridge::get_or_create_object`]. Empty values are
/// left alone; lists merge into the stored ones.
#[derive(Clone, Debug, Default)]
pub struct ObjectFields {
    pub source_protocol: Option<String>,

    /// Replaces the stored content outright
    pub content: Option<Content>,

    pub copies: Vec<Target>,
    pub users: Vec<UserKey>,
    pub notify: Vec<UserKey>,
    pub feed: Vec<UserKey>,

    /// Only ever sets `deleted`, never clears it
    pub deleted: bool,
}

impl From<&Object> for ObjectFields {
    fn from(obj: &Object) -> Self {
        Self {
            source_protocol: obj.source_protocol.clone(),
            content: obj.content.clone(),
            copies: obj.copies.clone(),
            users: obj.users.clone(),
            notify: obj.notify.clone(),
            feed: obj.feed.clone(),
            deleted: obj.deleted,
        }
    }
}

fn apply_fields(obj: &mut Object, fields: &ObjectFields) {
    if let Some(protocol) = &fields.source_protocol {
        obj.source_protocol = Some(protocol.clone());
    }
    if let Some(content) = &fields.content {
        obj.content = Some(content.clone());
    }
    for copy in &fields.copies {
        add_unique(&mut obj.copies, copy.clone());
    }
    for user in &fields.users {
        add_unique(&mut obj.users, user.clone());
    }
    for user in &fields.notify {
        add_unique(&mut obj.notify, user.clone());
    }
    for user in &fields.feed {
        add_unique(&mut obj.feed, user.clone());
    }
    if fields.deleted {
        obj.deleted = true;
    }
}

/// Removes JSON-LD `@context` from an AS2 document and its embedded objects.
fn strip_context(data: &mut Value) {
    let Some(map) = data.as_object_mut() else {
        return;
    };
    map.remove("@context");

    for field in CONTEXT_FIELDS {
        match map.get_mut(*field) {
            Some(Value::Object(inner)) => {
                inner.remove("@context");
            }
            Some(Value::Array(items)) => {
                for inner in items.iter_mut().filter_map(Value::as_object_mut) {
                    inner.remove("@context");
                }
            }
            _ => {}
        }
    }
}

/// A field holding an id that the rewriting passes visit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefField {
    /// The embedded object. `actor` when it's a user, by its type or by a
    /// follow's verb.
    Object { actor: bool },
    Actor,
    Author,
    InReplyTo,
    Mention,
}

impl RefField {
    fn is_user(self) -> bool {
        match self {
            Self::Object { actor } => actor,
            Self::InReplyTo => false,
            Self::Actor | Self::Author | Self::Mention => true,
        }
    }
}

type Rewrite<'a> = dyn FnMut(RefField, &str) -> Option<String> + 'a;

/// Calls `rewrite` on each id in the embedded object, mention tags, and the
/// actor, author and inReplyTo fields of both the outer and embedded
/// objects. Replaces ids it returns. Returns whether anything was replaced.
///
/// Single-element actor, author and inReplyTo lists collapse to a scalar;
/// `object` only with `collapse_object`. Tags stay lists.
fn rewrite_refs(outer: &mut Value, collapse_object: bool, rewrite: &mut Rewrite<'_>) -> bool {
    let follow = matches!(as1::object_type(outer), Some("follow" | "stop-following"));
    let mut replaced = false;

    if let Some(inner) = outer.get_mut("object") {
        replaced |= rewrite_each(inner, collapse_object, &mut |val| {
            let field = RefField::Object {
                actor: follow || as1::is_actor(val),
            };
            let mut changed = replace_ref(val, field, rewrite);
            if val.is_object() {
                changed |= rewrite_fields(val, rewrite);
            }
            changed
        });
    }

    replaced | rewrite_fields(outer, rewrite)
}

fn rewrite_fields(obj: &mut Value, rewrite: &mut Rewrite<'_>) -> bool {
    let mut replaced = false;

    if let Some(tags) = obj.get_mut("tags") {
        replaced |= rewrite_each(tags, false, &mut |tag| {
            let is_mention = tag.get("objectType").and_then(Value::as_str) == Some("mention");
            match tag.get_mut("url") {
                Some(url) if is_mention => replace_ref(url, RefField::Mention, rewrite),
                _ => false,
            }
        });
    }

    for (name, field) in [
        ("actor", RefField::Actor),
        ("author", RefField::Author),
        ("inReplyTo", RefField::InReplyTo),
    ] {
        if let Some(val) = obj.get_mut(name) {
            replaced |= rewrite_each(val, true, &mut |val| replace_ref(val, field, rewrite));
        }
    }

    replaced
}

/// Applies `f` to a field's value, or to each element of a list. With
/// `collapse`, lists of one become a scalar.
fn rewrite_each(val: &mut Value, collapse: bool, f: &mut dyn FnMut(&mut Value) -> bool) -> bool {
    match val {
        Value::Array(items) => {
            let replaced = items
                .iter_mut()
                .filter(|item| !item.is_null())
                .fold(false, |replaced, item| f(item) | replaced);
            if collapse && items.len() == 1 {
                let single = items.remove(0);
                *val = single;
            }
            replaced
        }
        Value::Null => false,
        _ => f(val),
    }
}

/// Rewrites the id of a reference. Bare ids, and objects with nothing but an
/// id, become the new id string. Other objects keep their other keys.
fn replace_ref(val: &mut Value, field: RefField, rewrite: &mut Rewrite<'_>) -> bool {
    let Some(id) = as1::reference_id(val).filter(|id| !id.is_empty()) else {
        return false;
    };
    let Some(new_id) = rewrite(field, id).filter(|new_id| new_id != id) else {
        return false;
    };

    let structured = val.as_object().is_some_and(|map| {
        map.iter()
            .any(|(key, inner)| key != "id" && !as1::is_empty(&as1::trim_nulls(inner.clone())))
    });
    if structured {
        if let Some(map) = val.as_object_mut() {
            map.insert("id".to_string(), Value::String(new_id));
        }
    } else {
        *val = Value::String(new_id);
    }
    true
}

impl Bridge {
    pub async fn get_object(&self, id: &str) -> Result<Option<Object>> {
        Ok(store::load::<Object>(self.store(), id)
            .await?
            .map(|(obj, _)| obj))
    }

    /// Loads an object, creating it if necessary, and applies `fields`.
    ///
    /// Overwriting an object that already has content requires `authed_as`
    /// to be one of its owners: its author, its actor, or the object itself.
    /// Sets `new`, and `changed` for existing objects.
    pub async fn get_or_create_object(
        &self,
        id: &str,
        authed_as: Option<&str>,
        fields: ObjectFields,
    ) -> Result<Object> {
        self.upsert_object(id, Some(authed_as), &fields).await
    }

    /// Writes an object the bridge itself fetched or built, merging into any
    /// stored version without an owner check.
    pub(crate) async fn put_object(&self, obj: &mut Object) -> Result<()> {
        let fields = ObjectFields::from(&*obj);
        *obj = self.upsert_object(&obj.id, None, &fields).await?;
        Ok(())
    }

    /// `auth` is `None` to skip authorization, `Some(authed_as)` to check it.
    async fn upsert_object(
        &self,
        id: &str,
        auth: Option<Option<&str>>,
        fields: &ObjectFields,
    ) -> Result<Object> {
        let obj = transact(self.config.max_transaction_attempts, move || async move {
            let (mut obj, version, prior) = match store::load::<Object>(self.store(), id).await? {
                Some((obj, version)) => {
                    let prior = obj.as1(&self.registry);
                    if let (Some(prior), Some(authed_as)) = (&prior, auth) {
                        self.check_owner(&obj, prior, authed_as)?;
                    }
                    (obj, Some(version), prior)
                }
                None => (Object::new(id), None, None),
            };

            apply_fields(&mut obj, fields);
            obj.new = Some(version.is_none());
            obj.changed = match version {
                Some(_) => Some(match (obj.as1(&self.registry), &prior) {
                    (Some(now), Some(prior)) => as1::activity_changed(prior, &now, false),
                    (now, prior) => now.is_some() != prior.is_some(),
                }),
                None => None,
            };

            obj.metadata.touch();
            self.prepare_object(&mut obj)?;
            store::write(self.store(), &obj, version).await?;
            Ok(obj)
        })
        .await?;

        for copy in &fields.copies {
            self.originals.add_object_copy(&copy.uri, &obj.id).await;
        }
        debug!(id = %obj.id, new = ?obj.new, changed = ?obj.changed, "Stored object");
        Ok(obj)
    }

    /// Requires `authed_as` to own an object that already has content.
    fn check_owner(&self, obj: &Object, prior: &Value, authed_as: Option<&str>) -> Result<()> {
        let proto = obj
            .source_protocol
            .as_deref()
            .and_then(|label| self.registry.lookup(label));
        let normalize = |id: &str| match proto {
            Some(proto) => proto.normalize_user_id(id),
            None => id.to_string(),
        };

        let Some(authed_as) = authed_as else {
            warn!(id = %obj.id, "Unauthenticated write to existing object");
            return Err(BridgeError::Forbidden(format!(
                "Authentication required to modify {}",
                obj.id
            )));
        };

        let owners: Vec<String> = as1::get_ids(prior, "author")
            .into_iter()
            .chain(as1::get_ids(prior, "actor"))
            .chain(std::iter::once(obj.id.clone()))
            .map(|owner| normalize(&owner))
            .collect();

        let authed = normalize(authed_as);
        let profile = match proto {
            Some(proto) => proto.profile_id(authed_as),
            None => authed_as.to_string(),
        };
        if owners.contains(&authed) || owners.contains(&profile) {
            return Ok(());
        }

        warn!(id = %obj.id, authed_as, ?owners, "Authed user isn't object owner");
        Err(BridgeError::Forbidden(format!(
            "{} isn't owner of {}",
            authed_as, obj.id
        )))
    }

    /// Validates an object and updates its derived fields before a write.
    fn prepare_object(&self, obj: &mut Object) -> Result<()> {
        if let Some(label) = obj.source_protocol.as_deref().filter(|l| *l != INTERNAL_PROTOCOL) {
            let proto = self.registry.lookup(label).ok_or_else(|| {
                BridgeError::Validation(format!("Unknown source protocol {}", label))
            })?;
            if proto.owns_id(&obj.id) == Some(false) {
                return Err(BridgeError::Validation(format!(
                    "{} doesn't own id {}",
                    proto.label(),
                    obj.id
                )));
            }
        }

        if let Some(uri) = obj.id.strip_prefix("at://") {
            let repo = uri.split('/').next().unwrap_or_default();
            if !repo.starts_with("did:") {
                error!(id = %obj.id, "at:// id has a non-DID repo");
                return Err(BridgeError::Validation(format!(
                    "at:// ids must have DID repos, got {}",
                    obj.id
                )));
            }
        }

        if let Some(Content::Native {
            format: WireFormat::As2,
            data,
        }) = &mut obj.content
        {
            strip_context(data);
        }

        let canonical = obj.as1(&self.registry);
        let is_activity = canonical
            .as_ref()
            .and_then(|val| val.get("objectType"))
            .and_then(Value::as_str)
            == Some("activity");
        if is_activity {
            add_unique(&mut obj.labels, "activity".to_string());
        } else {
            obj.labels.retain(|label| label != "activity");
        }

        let object_type = canonical.as_ref().and_then(as1::object_type);
        obj.expire = EXPIRE_TYPES
            .contains(&object_type)
            .then(|| obj.metadata.updated + self.config.object_expire_age);

        Ok(())
    }

    /// Records a copy of `obj` and warms the copy resolution cache.
    pub async fn add_object_copy(&self, obj: &mut Object, copy: Target) -> Result<()> {
        let (id, copy_ref) = (obj.id.as_str(), &copy);
        let copies = transact(self.config.max_transaction_attempts, move || async move {
            let (mut stored, version) = store::load::<Object>(self.store(), id)
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("No object {}", id)))?;

            if add_unique(&mut stored.copies, copy_ref.clone()) {
                store::save(self.store(), &mut stored, Some(version)).await?;
            }
            Ok(stored.copies)
        })
        .await?;

        obj.copies = copies;
        self.originals.add_object_copy(&copy.uri, &obj.id).await;
        debug!(id = %obj.id, copy = %copy.uri, "Added object copy");
        Ok(())
    }

    /// Rewrites copy ids and bridge subdomain URLs in `obj`'s content to the
    /// original ids they stand for. Returns whether anything changed; only
    /// then is the content replaced.
    pub async fn resolve_ids(&self, obj: &mut Object) -> Result<bool> {
        let Some(original) = obj.as1(&self.registry) else {
            return Ok(false);
        };

        let mut resolved = original.clone();
        self.registry.unwrap_subdomains(&mut resolved);
        let unwrapped = resolved != original;

        let known_source = obj
            .source_protocol
            .as_deref()
            .is_some_and(|label| self.registry.lookup(label).is_some());

        let mut replaced = false;
        if known_source {
            let mut refs = vec![];
            rewrite_refs(&mut resolved.clone(), false, &mut |field, id| {
                refs.push((field, id.to_string()));
                None
            });

            let mut objects = HashMap::new();
            let mut users = HashMap::new();
            for (field, id) in refs {
                let as_object = matches!(field, RefField::Object { .. } | RefField::InReplyTo);
                if as_object && !objects.contains_key(&id) {
                    if let Some(orig) = self.originals.original_object(self.store(), &id).await? {
                        objects.insert(id.clone(), orig);
                        continue;
                    }
                }

                let as_user = !matches!(field, RefField::InReplyTo);
                if as_user && !users.contains_key(&id) && !objects.contains_key(&id) {
                    if let Some(orig) = self
                        .originals
                        .original_user(self.store(), &self.registry, &id)
                        .await?
                    {
                        users.insert(id, orig.id);
                    }
                }
            }

            replaced = rewrite_refs(&mut resolved, false, &mut |field, id| {
                let found = match field {
                    RefField::Object { .. } => objects.get(id).or_else(|| users.get(id)),
                    RefField::InReplyTo => objects.get(id),
                    _ => users.get(id),
                };
                if let Some(orig) = found {
                    debug!(copy = id, original = %orig, "Resolved copy id");
                }
                found.cloned()
            });
        }

        if !unwrapped && !replaced {
            return Ok(false);
        }
        obj.content = Some(Content::Synthesized {
            as1: as1::trim_nulls(resolved),
            feed: None,
        });
        Ok(true)
    }

    /// Rewrites ids in `obj`'s content to the canonical form of the protocol
    /// that owns each one. Returns whether anything changed.
    pub fn normalize_ids(&self, obj: &mut Object) -> bool {
        let Some(mut normalized) = obj.as1(&self.registry) else {
            return false;
        };

        let registry = &self.registry;
        let replaced = rewrite_refs(&mut normalized, true, &mut |field, id| {
            let proto = registry.for_id(id)?;
            if field.is_user() {
                proto.translate_user_id(id, proto.descriptor())
            } else {
                proto.translate_object_id(id, proto.descriptor())
            }
        });

        if replaced {
            obj.content = Some(Content::Synthesized {
                as1: as1::trim_nulls(normalized),
                feed: None,
            });
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewrite_with(val: &mut Value, table: &[(&str, &str)]) -> Vec<(RefField, String)> {
        let mut seen = vec![];
        rewrite_refs(val, false, &mut |field, id| {
            seen.push((field, id.to_string()));
            table
                .iter()
                .find(|(from, _)| *from == id)
                .map(|(_, to)| to.to_string())
        });
        seen
    }

    #[test]
    fn test_rewrite_refs_visits_fields() {
        let mut val = json!({
            "objectType": "activity",
            "verb": "post",
            "actor": "alice",
            "object": {
                "id": "note",
                "author": ["alice"],
                "inReplyTo": {"id": "parent", "url": "https://parent"},
                "tags": [
                    {"objectType": "mention", "url": "bob"},
                    {"objectType": "hashtag", "url": "https://tag"},
                ],
            },
        });

        let seen = rewrite_with(&mut val, &[("alice", "ALICE"), ("parent", "PARENT"), ("note", "NOTE")]);
        assert!(seen.contains(&(RefField::Object { actor: false }, "note".into())));
        assert!(seen.contains(&(RefField::Mention, "bob".into())));
        assert!(seen.contains(&(RefField::InReplyTo, "parent".into())));
        assert!(!seen.iter().any(|(_, id)| id == "https://tag"));

        assert_eq!(val["actor"], json!("ALICE"));
        assert_eq!(val["object"]["id"], json!("NOTE"));
        assert_eq!(val["object"]["author"], json!("ALICE"));
        assert_eq!(val["object"]["inReplyTo"], json!({"id": "PARENT", "url": "https://parent"}));
    }

    #[test]
    fn test_tags_stay_lists_and_object_collapses_only_on_request() {
        let table = |_: RefField, id: &str| (id == "bob").then(|| "BOB".to_string());
        let original = json!({
            "objectType": "activity",
            "verb": "like",
            "object": ["bob"],
            "tags": [{"objectType": "mention", "url": "bob"}],
        });

        let mut kept = original.clone();
        assert!(rewrite_refs(&mut kept, false, &mut |field, id| table(field, id)));
        assert_eq!(kept["object"], json!(["BOB"]));
        assert_eq!(kept["tags"], json!([{"objectType": "mention", "url": "BOB"}]));

        let mut collapsed = original;
        assert!(rewrite_refs(&mut collapsed, true, &mut |field, id| table(field, id)));
        assert_eq!(collapsed["object"], json!("BOB"));
        assert_eq!(collapsed["tags"], json!([{"objectType": "mention", "url": "BOB"}]));
    }

    #[test]
    fn test_rewrite_refs_follow_object_is_user() {
        let mut val = json!({
            "objectType": "activity",
            "verb": "follow",
            "object": "bob",
        });
        let seen = rewrite_with(&mut val, &[]);
        assert_eq!(seen, [(RefField::Object { actor: true }, "bob".to_string())]);
    }

    #[test]
    fn test_replace_ref_bare_object_collapses() {
        let mut val = json!({"id": "a", "displayName": ""});
        assert!(replace_ref(&mut val, RefField::Actor, &mut |_, _| Some("b".into())));
        assert_eq!(val, json!("b"));

        let mut val = json!("a");
        assert!(!replace_ref(&mut val, RefField::Actor, &mut |_, id| Some(id.to_string())));
        assert_eq!(val, json!("a"));
    }

    #[test]
    fn test_strip_context() {
        let mut data = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "actor": {"@context": "x", "id": "https://inst/alice"},
            "object": [{"@context": "y", "id": "https://inst/note"}],
        });
        strip_context(&mut data);
        assert_eq!(
            data,
            json!({
                "type": "Create",
                "actor": {"id": "https://inst/alice"},
                "object": [{"id": "https://inst/note"}],
            })
        );
    }

    #[test]
    fn test_apply_fields_merges() {
        let mut obj = Object::new("https://inst/note");
        obj.deleted = true;
        obj.users.push(UserKey::new("activitypub", "https://inst/alice"));

        let fields = ObjectFields {
            users: vec![
                UserKey::new("activitypub", "https://inst/alice"),
                UserKey::new("activitypub", "https://inst/bob"),
            ],
            ..Default::default()
        };
        apply_fields(&mut obj, &fields);
        assert_eq!(obj.users.len(), 2);
        assert!(obj.deleted);
        assert!(obj.content.is_none());
    }
}
