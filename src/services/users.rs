//! Bridged user lifecycle
//!
//! Get-or-create with copy propagation, opt-out status, per-protocol enable
//! and disable, and the profile-derived views (name, handle, picture).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::as1;
use crate::bridge::Bridge;
use crate::db::schemas::metadata::timestamp;
use crate::db::schemas::target::add_unique;
use crate::db::schemas::{
    DmKind, KeyMaterial, Object, SentDm, Target, User, UserKey, UserStatus, OBJECT_COLLECTION,
};
use crate::db::store::{self, transact};
use crate::keys;
use crate::notify::DirectMessage;
use crate::protocol::{Protocol, ProtocolDescriptor, ProtocolError, ProtocolRegistry};
use crate::services::paging::parse_datetime;
use crate::types::{BridgeError, Result};

/// Options for [`Bridge::get_or_create_user`]
#[derive(Clone, Debug, Default)]
pub struct UserOptions {
    /// Create copies in every enabled protocol that has them
    pub propagate: bool,

    /// Return opted out users instead of [`UserLookup::OptedOut`]
    pub allow_opt_out: bool,

    /// Re-fetch an existing user's profile from its protocol
    pub reload: bool,

    /// Mark the user as having signed up directly. Never unsets it.
    pub direct: bool,

    pub profile_id: Option<String>,

    /// Protocols to add to the user's explicit opt-ins
    pub enabled_protocols: Vec<String>,
}

/// Outcome of [`Bridge::get_or_create_user`]
#[derive(Clone, Debug)]
pub enum UserLookup {
    Found(User),

    /// The user exists or would exist, but isn't eligible for bridging
    OptedOut(UserStatus),

    /// The record failed validation at commit and wasn't written
    Rejected { reason: String },
}

impl UserLookup {
    pub fn into_user(self) -> Option<User> {
        match self {
            Self::Found(user) => Some(user),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Found(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_opted_out(&self) -> bool {
        matches!(self, Self::OptedOut(_))
    }
}

impl User {
    /// Whether and why this user isn't eligible for bridging. `None` means
    /// eligible. Derived from the stored fields plus the loaded profile.
    pub fn status(&self, registry: &ProtocolRegistry) -> Option<UserStatus> {
        if self.manual_opt_out {
            return Some(UserStatus::OptOut);
        }

        let profile = self.profile.as_ref()?.as1(registry)?;
        let protocol = registry.lookup(&self.protocol);
        let desc = protocol
            .map(|p| p.descriptor().clone())
            .unwrap_or_else(|| ProtocolDescriptor::new(self.protocol.as_str(), ""));

        if desc.requires_avatar && as1::get_url(&profile, "image").is_none() {
            return Some(UserStatus::Blocked);
        }

        let name = profile
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        if desc.requires_name {
            let handle = protocol.and_then(|p| p.handle(&self.id));
            if name.is_empty() || name == self.id || handle.as_deref() == Some(name) {
                return Some(UserStatus::Blocked);
            }
        }

        if desc.requires_old_account {
            let published = profile
                .get("published")
                .and_then(Value::as_str)
                .and_then(|val| parse_datetime(val).ok());
            if let Some(published) = published {
                if Utc::now() - published < registry.old_account_age() {
                    return Some(UserStatus::Blocked);
                }
            }
        }

        let summary = profile
            .get("summary")
            .and_then(Value::as_str)
            .map(as1::html_to_text)
            .unwrap_or_default();
        let name = as1::html_to_text(name);
        if summary.contains("#nobridge") || name.contains("#nobridge") {
            return Some(UserStatus::OptOut);
        }

        if !self.enabled_protocols.is_empty() {
            return None;
        }

        if as1::is_public(&profile, false) != Some(true) {
            return Some(UserStatus::OptOut);
        }

        if summary.contains("#nobot") || name.contains("#nobot") {
            return Some(UserStatus::OptOut);
        }

        None
    }

    /// Whether this user is bridged into `to`. With `explicit`, only an
    /// explicit opt-in counts, not the native protocol's defaults.
    pub fn is_enabled(&self, to: &ProtocolDescriptor, explicit: bool, registry: &ProtocolRegistry) -> bool {
        if to.label == self.protocol {
            return true;
        }

        // protocol bot users, eg bsky.brid.gy, are bridged everywhere but home
        if let Some(bot) = registry.for_bridge_subdomain(&self.id) {
            return bot.label() != to.label;
        }

        if self.manual_opt_out {
            return false;
        }
        if self.has_enabled(&to.label) {
            return true;
        }
        if self.status(registry).is_some() {
            return false;
        }

        !explicit
            && registry
                .lookup(&self.protocol)
                .is_some_and(|from| from.descriptor().is_default_enabled(&to.label))
    }
}

/// Network results inside a user transaction, reused when it retries
#[derive(Default)]
struct NetworkMemo {
    profile: OnceCell<Option<Object>>,
    keys: OnceCell<KeyMaterial>,
    copies: Mutex<HashMap<String, std::result::Result<Option<Target>, ProtocolError>>>,
}

impl NetworkMemo {
    async fn profile(&self, bridge: &Bridge, user: &User) -> Option<Object> {
        self.profile
            .get_or_init(|| bridge.fetch_profile(user))
            .await
            .clone()
    }

    async fn keys(&self) -> Result<KeyMaterial> {
        self.keys
            .get_or_try_init(keys::generate_off_thread)
            .await
            .cloned()
    }

    async fn create_copy(
        &self,
        protocol: &Arc<dyn Protocol>,
        user: &User,
    ) -> std::result::Result<Option<Target>, ProtocolError> {
        let label = protocol.label().to_string();
        let cached = self.lock_copies().get(&label).cloned();
        if let Some(outcome) = cached {
            return outcome;
        }

        let outcome = protocol.create_copy_for(user).await;
        self.lock_copies().insert(label, outcome.clone());
        outcome
    }

    fn lock_copies(
        &self,
    ) -> MutexGuard<'_, HashMap<String, std::result::Result<Option<Target>, ProtocolError>>> {
        self.copies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies overrides to a user. Returns whether anything changed.
fn merge_options(user: &mut User, opts: &UserOptions) -> bool {
    let mut changed = false;

    if opts.direct && !user.direct {
        user.direct = true;
        changed = true;
    }

    if user.profile_id.is_none() && opts.profile_id.is_some() {
        user.profile_id = opts.profile_id.clone();
        changed = true;
    }

    for label in &opts.enabled_protocols {
        changed |= add_unique(&mut user.enabled_protocols, label.clone());
    }

    changed
}

impl Bridge {
    /// Reads a user by key, following `use_instead` one hop. A dangling
    /// `use_instead` reads as the alias itself. Doesn't load the profile.
    async fn read_user(&self, key: &UserKey) -> Result<Option<(User, u64)>> {
        let Some((user, version)) = store::load::<User>(self.store(), &key.storage_id()).await?
        else {
            return Ok(None);
        };

        let Some(canonical) = user.use_instead.clone().filter(|canonical| canonical != key) else {
            return Ok(Some((user, version)));
        };

        debug!(from = %key, to = %canonical, "Following use_instead");
        match store::load::<User>(self.store(), &canonical.storage_id()).await? {
            Some(found) => Ok(Some(found)),
            None => {
                warn!(from = %key, to = %canonical, "use_instead target missing, keeping alias");
                Ok(Some((user, version)))
            }
        }
    }

    /// Loads an existing user and its profile. Opted out users are `None`
    /// unless `allow_opt_out`.
    pub async fn get_user(&self, protocol: &str, id: &str, allow_opt_out: bool) -> Result<Option<User>> {
        let proto = self.protocol(protocol)?;
        let key = UserKey::new(proto.label(), id);

        let Some((mut user, _)) = self.read_user(&key).await? else {
            return Ok(None);
        };
        self.load_profile(&mut user).await;

        if let Some(status) = user.status(&self.registry) {
            if !allow_opt_out {
                debug!(user = %user.key(), ?status, "User is opted out");
                return Ok(None);
            }
        }
        Ok(Some(user))
    }

    /// Loads a user, creating it if necessary.
    ///
    /// An id that is a bridged copy of an existing user resolves to that user
    /// instead of creating a new one. With `propagate`, missing copies are
    /// created in every protocol the user is enabled in.
    pub async fn get_or_create_user(
        &self,
        protocol: &str,
        id: &str,
        opts: UserOptions,
    ) -> Result<UserLookup> {
        let proto = self.protocol(protocol)?;
        let key = UserKey::new(proto.label(), id);
        let memo = NetworkMemo::default();

        let (proto, key, opts, memo) = (&proto, &key, &opts, &memo);
        let lookup = transact(self.config.max_transaction_attempts, move || async move {
            self.user_transaction(proto, key, opts, memo).await
        })
        .await?;

        match &lookup {
            UserLookup::Found(user) => debug!(user = %user.key(), "Got user"),
            UserLookup::OptedOut(status) => debug!(user = %key, ?status, "User is opted out"),
            UserLookup::Rejected { .. } => {}
        }
        Ok(lookup)
    }

    async fn user_transaction(
        &self,
        proto: &Arc<dyn Protocol>,
        key: &UserKey,
        opts: &UserOptions,
        memo: &NetworkMemo,
    ) -> Result<UserLookup> {
        let (mut user, version, mut changed) = match self.read_user(key).await? {
            Some((mut user, version)) => {
                self.load_profile(&mut user).await;
                if opts.reload {
                    if let Some(profile) = memo.profile(self, &user).await {
                        user.profile = Some(profile);
                    }
                }
                if let Some(status) = user.status(&self.registry) {
                    if !opts.allow_opt_out {
                        return Ok(UserLookup::OptedOut(status));
                    }
                }

                let changed = merge_options(&mut user, opts);
                if !opts.propagate {
                    if changed {
                        store::save(self.store(), &mut user, Some(version)).await?;
                    }
                    return Ok(UserLookup::Found(user));
                }
                (user, Some(version), changed)
            }

            None => {
                if let Some(orig_key) = self
                    .originals
                    .original_user(self.store(), &self.registry, &key.id)
                    .await?
                {
                    if let Some((mut orig, _)) = self.read_user(&orig_key).await? {
                        debug!(copy = %key.id, user = %orig.key(), "Id is a copy of an existing user");
                        self.load_profile(&mut orig).await;
                        if let Some(status) = orig.status(&self.registry) {
                            if !opts.allow_opt_out {
                                return Ok(UserLookup::OptedOut(status));
                            }
                        }
                        return Ok(UserLookup::Found(orig));
                    }
                }

                let mut user = User::new(key.protocol.as_str(), key.id.as_str());
                merge_options(&mut user, opts);
                user.profile = memo.profile(self, &user).await;
                if let Some(status) = user.status(&self.registry) {
                    if !opts.allow_opt_out {
                        return Ok(UserLookup::OptedOut(status));
                    }
                }
                (user, None, true)
            }
        };

        let mut created = vec![];
        if opts.propagate && user.status(&self.registry).is_none() {
            let outcome = self.propagate_copies(proto, &mut user, memo).await;
            changed |= outcome.changed;
            created = outcome.created;
        }

        if version.is_none() && proto.descriptor().generates_keys && user.keys.is_none() {
            user.keys = Some(memo.keys().await?);
        }

        if let Err(err) = self.validate_user(&user) {
            error!(user = %user.key(), error = %err, "Not storing invalid user");
            return Ok(UserLookup::Rejected {
                reason: err.to_string(),
            });
        }

        if changed {
            store::save(self.store(), &mut user, version).await?;
        }
        for copy in &created {
            self.originals.add_user_copy(&copy.uri, &user.key()).await;
        }
        Ok(UserLookup::Found(user))
    }

    /// Creates copies in every enabled copy-capable protocol that lacks one.
    async fn propagate_copies(
        &self,
        proto: &Arc<dyn Protocol>,
        user: &mut User,
        memo: &NetworkMemo,
    ) -> Propagated {
        let mut labels = user.enabled_protocols.clone();
        for label in &proto.descriptor().default_enabled {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        let mut outcome = Propagated::default();
        for label in labels {
            let Some(target) = self.registry.lookup(&label).cloned() else {
                continue;
            };
            let desc = target.descriptor();
            if desc.label == user.protocol || !desc.has_copies {
                continue;
            }
            if user.get_copy(desc).is_some() || !user.is_enabled(desc, false, &self.registry) {
                continue;
            }

            match memo.create_copy(&target, user).await {
                Ok(Some(copy)) => {
                    info!(user = %user.key(), protocol = %desc.label, copy = %copy.uri, "Created copy");
                    if add_unique(&mut user.copies, copy.clone()) {
                        outcome.created.push(copy);
                        outcome.changed = true;
                    }
                }
                Ok(None) => {}
                Err(ProtocolError::Rejected(reason)) => {
                    info!(user = %user.key(), protocol = %desc.label, %reason, "Copy rejected, disabling protocol");
                    let before = user.enabled_protocols.len();
                    user.enabled_protocols
                        .retain(|p| p != &label && p != &desc.label);
                    outcome.changed |= user.enabled_protocols.len() != before;
                }
                Err(err @ ProtocolError::Unavailable(_)) => {
                    warn!(user = %user.key(), protocol = %desc.label, error = %err, "Couldn't create copy");
                }
            }
        }
        outcome
    }

    fn validate_user(&self, user: &User) -> Result<()> {
        if user.id.is_empty() {
            return Err(BridgeError::Validation("User id is empty".to_string()));
        }

        let proto = self
            .registry
            .lookup(&user.protocol)
            .ok_or_else(|| BridgeError::Validation(format!("Unknown protocol {}", user.protocol)))?;
        if proto.owns_id(&user.id) == Some(false) {
            return Err(BridgeError::Validation(format!(
                "{} doesn't own id {}",
                user.protocol, user.id
            )));
        }

        if user.use_instead.as_ref() == Some(&user.key()) {
            return Err(BridgeError::Validation(format!(
                "{} can't use itself instead",
                user.key()
            )));
        }
        Ok(())
    }

    /// The profile object id, explicit or the protocol's default
    pub fn profile_id(&self, user: &User) -> String {
        if let Some(id) = &user.profile_id {
            return id.clone();
        }
        match self.registry.lookup(&user.protocol) {
            Some(proto) => proto.profile_id(&user.id),
            None => user.id.clone(),
        }
    }

    /// Loads the stored profile object onto `user`. Best effort.
    pub async fn load_profile(&self, user: &mut User) {
        let profile_id = self.profile_id(user);
        match store::load::<Object>(self.store(), &profile_id).await {
            Ok(found) => user.profile = found.map(|(profile, _)| profile),
            Err(err) => warn!(user = %user.key(), error = %err, "Couldn't load profile"),
        }
    }

    /// Loads profiles for many users with one batch read.
    pub async fn load_multi(&self, users: &mut [User]) -> Result<()> {
        let ids: Vec<String> = users.iter().map(|user| self.profile_id(user)).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();

        let mut profiles = HashMap::new();
        for stored in self.store.get_many(OBJECT_COLLECTION, &unique).await? {
            let profile: Object = serde_json::from_value(stored.doc)?;
            profiles.insert(stored.id, profile);
        }

        for (user, id) in users.iter_mut().zip(ids) {
            user.profile = profiles.get(&id).cloned();
        }
        Ok(())
    }

    /// Re-fetches the profile from the user's protocol and stores it. Best
    /// effort: on failure the current profile is kept.
    pub async fn reload_profile(&self, user: &mut User) {
        if let Some(profile) = self.fetch_profile(user).await {
            user.profile = Some(profile);
        }
    }

    async fn fetch_profile(&self, user: &User) -> Option<Object> {
        let proto = self.registry.lookup(&user.protocol)?;
        let profile_id = self.profile_id(user);

        let mut profile = match proto.load(&profile_id, true).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return None,
            Err(err) => {
                info!(user = %user.key(), error = %err, "Couldn't reload profile");
                return None;
            }
        };
        if profile.source_protocol.is_none() {
            profile.source_protocol = Some(proto.label().to_string());
        }

        match self.put_object(&mut profile).await {
            Ok(()) => Some(profile),
            Err(err) => {
                warn!(user = %user.key(), error = %err, "Couldn't store profile");
                None
            }
        }
    }

    /// Opts a user into `to`: creates a copy there if the protocol has
    /// copies, then records the opt-in. The first time, a welcome DM is
    /// queued.
    pub async fn enable_protocol(&self, user: &mut User, to: &str) -> Result<()> {
        let target = self.protocol(to)?;
        let label = target.label().to_string();

        let created = if target.descriptor().has_copies {
            target.create_copy_for(user).await?
        } else {
            None
        };

        let key = user.key();
        let (key_ref, label_ref, created_ref) = (&key, &label, &created);
        let (stored, welcome) = transact(self.config.max_transaction_attempts, move || async move {
            let (mut stored, version) = store::load::<User>(self.store(), &key_ref.storage_id())
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("No user {}", key_ref)))?;

            let mut changed = add_unique(&mut stored.enabled_protocols, label_ref.clone());
            if let Some(copy) = created_ref {
                changed |= add_unique(&mut stored.copies, copy.clone());
            }
            let welcome = add_unique(
                &mut stored.sent_dms,
                SentDm {
                    protocol: label_ref.clone(),
                    kind: DmKind::Welcome,
                },
            );

            if changed || welcome {
                store::save(self.store(), &mut stored, Some(version)).await?;
            }
            Ok((stored, welcome))
        })
        .await?;

        if let Some(copy) = &created {
            self.originals.add_user_copy(&copy.uri, &key).await;
        }

        user.enabled_protocols = stored.enabled_protocols;
        user.copies = stored.copies;
        user.sent_dms = stored.sent_dms;
        user.metadata = stored.metadata;

        if welcome {
            let handle = self
                .id_as(user, &label)
                .unwrap_or_else(|| self.handle_or_id(user));
            self.notifier.queue(DirectMessage {
                to: key.clone(),
                from_protocol: label.clone(),
                kind: DmKind::Welcome,
                text: format!("Welcome to the bridge! You're now bridged into {} as {}.", label, handle),
            });
        }

        info!(user = %key, protocol = %label, "Enabled protocol");
        Ok(())
    }

    /// Removes an explicit opt-in. Copies are kept.
    pub async fn disable_protocol(&self, user: &mut User, to: &str) -> Result<()> {
        let label = self.protocol(to)?.label().to_string();
        let key = user.key();

        let (key_ref, label_ref) = (&key, &label);
        let enabled = transact(self.config.max_transaction_attempts, move || async move {
            let (mut stored, version) = store::load::<User>(self.store(), &key_ref.storage_id())
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("No user {}", key_ref)))?;

            let before = stored.enabled_protocols.len();
            stored.enabled_protocols.retain(|p| p != label_ref);
            if stored.enabled_protocols.len() != before {
                store::save(self.store(), &mut stored, Some(version)).await?;
            }
            Ok(stored.enabled_protocols)
        })
        .await?;

        user.enabled_protocols = enabled;
        info!(user = %key, protocol = %label, "Disabled protocol");
        Ok(())
    }

    /// Records a copy of `user` and warms the copy resolution cache.
    pub async fn add_user_copy(&self, user: &mut User, copy: Target) -> Result<()> {
        let key = user.key();

        let (key_ref, copy_ref) = (&key, &copy);
        let copies = transact(self.config.max_transaction_attempts, move || async move {
            let (mut stored, version) = store::load::<User>(self.store(), &key_ref.storage_id())
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("No user {}", key_ref)))?;

            if add_unique(&mut stored.copies, copy_ref.clone()) {
                store::save(self.store(), &mut stored, Some(version)).await?;
            }
            Ok(stored.copies)
        })
        .await?;

        user.copies = copies;
        self.originals.add_user_copy(&copy.uri, &key).await;
        debug!(user = %key, copy = %copy.uri, "Added user copy");
        Ok(())
    }

    /// Stores a delete activity for `user`'s account in one protocol, or all
    /// of them, for delivery.
    pub async fn delete_user(&self, user: &User, protocol: Option<&str>) -> Result<Object> {
        let label = match protocol {
            Some(label) => self.protocol(label)?.label().to_string(),
            None => "all".to_string(),
        };

        let id = format!(
            "{}#delete-user-{}-{}",
            self.profile_id(user),
            label,
            timestamp::format(&Utc::now())
        );
        let mut activity = Object::from_as1(
            id.as_str(),
            json!({
                "objectType": "activity",
                "verb": "delete",
                "id": id,
                "actor": user.id,
                "object": user.id,
            }),
        );
        activity.source_protocol = Some(user.protocol.clone());
        activity.users = vec![user.key()];

        self.put_object(&mut activity).await?;
        info!(user = %user.key(), protocol = %label, "Stored account delete");
        Ok(activity)
    }

    /// Handle in the user's own protocol, if it has handles
    pub fn handle(&self, user: &User) -> Option<String> {
        self.registry.lookup(&user.protocol)?.handle(&user.id)
    }

    pub fn handle_or_id(&self, user: &User) -> String {
        self.handle(user).unwrap_or_else(|| user.id.clone())
    }

    /// Display name from the profile, else handle or id
    pub fn name(&self, user: &User) -> String {
        user.profile
            .as_ref()
            .and_then(|profile| profile.as1(&self.registry))
            .and_then(|profile| {
                profile
                    .get("displayName")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.handle_or_id(user))
    }

    pub fn profile_picture(&self, user: &User) -> Option<String> {
        let profile = user.profile.as_ref()?.as1(&self.registry)?;
        as1::get_url(&profile, "image")
    }

    /// This user's id translated into protocol `to`
    pub fn id_as(&self, user: &User, to: &str) -> Option<String> {
        let from = self.registry.lookup(&user.protocol)?;
        let to = self.registry.lookup(to)?;
        from.translate_user_id(&user.id, to.descriptor())
    }

    /// This user's handle as bridged into protocol `to`
    pub fn handle_as(&self, user: &User, to: &str) -> Option<String> {
        let from = self.registry.lookup(&user.protocol)?;
        let to = self.registry.lookup(to)?;
        let handle = from.handle(&user.id)?;
        from.translate_handle(&handle, to.descriptor())
    }

    /// This user's id in `to`: native id, existing copy, or `None`
    pub fn user_copy_id(&self, user: &User, to: &str) -> Option<String> {
        let to = self.registry.lookup(to)?;
        user.get_copy(to.descriptor()).map(str::to_string)
    }
}

#[derive(Default)]
struct Propagated {
    changed: bool,
    created: Vec<Target>,
}
