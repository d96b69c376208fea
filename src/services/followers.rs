//! Follower edges between bridged users
//!
//! Edges always cross protocols. Paging attaches the counterpart user and
//! drops counterparts that have opted out or are blocked.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, error, warn};

use crate::bridge::Bridge;
use crate::db::schemas::{
    Follower, FollowerFields, FollowerStatus, User, UserKey, FOLLOWER_COLLECTION, USER_COLLECTION,
};
use crate::db::store::{self, transact, Filter, Query};
use crate::services::paging::{fetch_page, Page, PageParams};
use crate::types::{BridgeError, Result};

/// Which side of a user's follower edges to page through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowCollection {
    /// Edges to the user
    Followers,
    /// Edges from the user
    Following,
}

impl FollowCollection {
    /// The edge side that matches the paged user
    fn field(self) -> &'static str {
        match self {
            Self::Followers => "to",
            Self::Following => "from",
        }
    }

    fn counterpart(self, follower: &Follower) -> &UserKey {
        match self {
            Self::Followers => &follower.from,
            Self::Following => &follower.to,
        }
    }
}

fn user_filters(field: &str, user: &UserKey) -> Vec<Filter> {
    vec![
        Filter::Eq(format!("{}.protocol", field), json!(user.protocol)),
        Filter::Eq(format!("{}.id", field), json!(user.id)),
        Filter::Eq("status".to_string(), json!(FollowerStatus::Active.as_str())),
    ]
}

impl Bridge {
    /// Loads the edge from `from` to `to`, creating it if necessary. Fields
    /// that are set overwrite an existing edge's.
    pub async fn get_or_create_follower(
        &self,
        from: &UserKey,
        to: &UserKey,
        fields: FollowerFields,
    ) -> Result<Follower> {
        if from.protocol == to.protocol {
            error!(%from, %to, "Follower edge within one protocol");
            return Err(BridgeError::Validation(format!(
                "Follower from {} to {} doesn't cross protocols",
                from, to
            )));
        }

        let id = Follower::edge_id(from, to);
        let (id, fields) = (&id, &fields);
        transact(self.config.max_transaction_attempts, move || async move {
            let supplied = fields.follow.is_some() || fields.status.is_some();
            let (mut follower, version) = match store::load::<Follower>(self.store(), id).await? {
                Some((follower, _)) if !supplied => return Ok(follower),
                Some((follower, version)) => (follower, Some(version)),
                None => (Follower::new(from.clone(), to.clone()), None),
            };

            if let Some(follow) = &fields.follow {
                follower.follow = Some(follow.clone());
            }
            if let Some(status) = fields.status {
                follower.status = status;
            }

            store::save(self.store(), &mut follower, version).await?;
            debug!(from = %follower.from, to = %follower.to, status = follower.status.as_str(), "Stored follower");
            Ok(follower)
        })
        .await
    }

    /// One page of `user`'s active followers or followings, newest first,
    /// each with its counterpart user and profile attached.
    pub async fn fetch_followers_page(
        &self,
        collection: FollowCollection,
        user: &UserKey,
        params: &PageParams,
    ) -> Result<Page<Follower>> {
        let query = Query {
            filters: user_filters(collection.field(), user),
            ..Default::default()
        };
        let mut page = fetch_page(
            self.store(),
            query,
            "updated",
            |follower: &Follower| follower.metadata.updated,
            params,
            self.config.page_size,
        )
        .await?;

        let mut ids: Vec<String> = page
            .items
            .iter()
            .map(|follower| collection.counterpart(follower).storage_id())
            .collect();
        ids.sort();
        ids.dedup();

        let mut users = vec![];
        for stored in self.store.get_many(USER_COLLECTION, &ids).await? {
            users.push(serde_json::from_value::<User>(stored.doc)?);
        }
        self.load_multi(&mut users).await?;
        let users: HashMap<UserKey, User> = users.into_iter().map(|user| (user.key(), user)).collect();

        page.items.retain_mut(|follower| {
            match users.get(collection.counterpart(follower)) {
                Some(user) if user.status(&self.registry).is_none() => {
                    follower.user = Some(user.clone());
                    true
                }
                _ => false,
            }
        });
        Ok(page)
    }

    /// (followers, following) counts of active edges. Cached in the shared
    /// cache, so they may lag.
    pub async fn count_followers(&self, user: &UserKey) -> Result<(u64, u64)> {
        let key = format!("follower-counts:{}", user);
        match self.shared.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_value(cached) {
                Ok(counts) => return Ok(counts),
                Err(e) => warn!(%user, error = %e, "Bad cached follower counts"),
            },
            Ok(None) => {}
            Err(e) => warn!(%user, error = %e, "Couldn't read cached follower counts"),
        }

        let followers = self
            .store
            .count(FOLLOWER_COLLECTION, &user_filters("to", user))
            .await?;
        let following = self
            .store
            .count(FOLLOWER_COLLECTION, &user_filters("from", user))
            .await?;

        if let Err(e) = self
            .shared
            .set(&key, json!([followers, following]), self.config.follower_count_ttl)
            .await
        {
            warn!(%user, error = %e, "Couldn't cache follower counts");
        }
        Ok((followers, following))
    }
}
