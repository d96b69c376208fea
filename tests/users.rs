mod common;

use std::sync::atomic::Ordering;

use serde_json::json;

use common::{profile, Harness};
use fedbridge::db::schemas::{DmKind, Target, User, UserKey, UserStatus};
use fedbridge::db::store::DocumentStore;
use fedbridge::services::{UserLookup, UserOptions};

fn propagate() -> UserOptions {
    UserOptions {
        propagate: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_get_or_create_is_idempotent() {
    let h = Harness::new();

    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(user.key(), UserKey::new("fake", "fake:alice"));
    assert!(user.keys.is_some());

    let stored = h.store.get("users", "fake:fake:alice").await.unwrap().unwrap();

    let again = h
        .bridge
        .get_or_create_user("fa", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(again.key(), user.key());
    assert_eq!(again.keys, user.keys);

    let after = h.store.get("users", "fake:fake:alice").await.unwrap().unwrap();
    assert_eq!(after.version, stored.version);
    assert_eq!(h.store.count("users", &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_direct_is_monotonic() {
    let h = Harness::new();

    let opts = UserOptions {
        direct: true,
        ..Default::default()
    };
    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", opts)
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert!(user.direct);

    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert!(user.direct);

    let stored = h.bridge.get_user("fake", "fake:alice", false).await.unwrap().unwrap();
    assert!(stored.direct);
}

#[tokio::test]
async fn test_propagate_creates_default_copies_once() {
    let h = Harness::new();

    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", propagate())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(user.copies, [Target::new("other", "other:copy/fake:alice")]);
    assert_eq!(h.other.copies_created.load(Ordering::SeqCst), 1);
    assert_eq!(h.efake.copies_created.load(Ordering::SeqCst), 0);

    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", propagate())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(user.copies.len(), 1);
    assert_eq!(h.other.copies_created.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.bridge.user_copy_id(&user, "ot").as_deref(),
        Some("other:copy/fake:alice")
    );
}

#[tokio::test]
async fn test_copy_id_resolves_to_existing_user() {
    let h = Harness::new();

    h.bridge
        .get_or_create_user("fake", "fake:alice", propagate())
        .await
        .unwrap();

    // warmed by the copy write, so no query
    let queries = h.store.query_count();
    let found = h
        .bridge
        .get_or_create_user("other", "other:copy/fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(found.key(), UserKey::new("fake", "fake:alice"));
    assert_eq!(h.store.query_count(), queries);

    assert!(h.store.get("users", "other:other:copy/fake:alice").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_copy_disables_only_that_protocol() {
    let h = Harness::new();
    h.efake.reject_copies("handle too long");

    let opts = UserOptions {
        propagate: true,
        enabled_protocols: vec!["efake".into()],
        ..Default::default()
    };
    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", opts)
        .await
        .unwrap()
        .into_user()
        .unwrap();

    assert!(user.enabled_protocols.is_empty());
    assert_eq!(user.copies, [Target::new("other", "other:copy/fake:alice")]);

    let stored = h.bridge.get_user("fake", "fake:alice", false).await.unwrap().unwrap();
    assert!(!stored.has_enabled("efake"));
}

#[tokio::test]
async fn test_nobridge_beats_explicit_opt_in() {
    let h = Harness::new();
    h.fake.set_profile(
        "fake:alice",
        json!({"objectType": "person", "displayName": "Alice", "summary": "<p>hi #nobridge</p>"}),
    );

    let opts = UserOptions {
        enabled_protocols: vec!["other".into()],
        ..Default::default()
    };
    let lookup = h
        .bridge
        .get_or_create_user("fake", "fake:alice", opts.clone())
        .await
        .unwrap();
    assert!(matches!(lookup, UserLookup::OptedOut(UserStatus::OptOut)));

    let user = h
        .bridge
        .get_or_create_user(
            "fake",
            "fake:alice",
            UserOptions {
                allow_opt_out: true,
                ..opts
            },
        )
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert!(user.has_enabled("other"));
    assert_eq!(user.status(h.bridge.registry()), Some(UserStatus::OptOut));
}

#[tokio::test]
async fn test_name_required() {
    let h = Harness::new();
    h.efake.set_profile("efake:bob", profile("@bob.efake"));

    let lookup = h
        .bridge
        .get_or_create_user("efake", "efake:bob", UserOptions::default())
        .await
        .unwrap();
    assert!(matches!(lookup, UserLookup::OptedOut(UserStatus::Blocked)));
    assert!(h.bridge.get_user("efake", "efake:bob", true).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_user_is_rejected_not_stored() {
    let h = Harness::new();

    let lookup = h
        .bridge
        .get_or_create_user("fake", "other:mallory", UserOptions::default())
        .await
        .unwrap();
    match lookup {
        UserLookup::Rejected { reason } => assert!(reason.contains("doesn't own")),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(h.store.count("users", &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_protocol_is_not_found() {
    let h = Harness::new();
    let err = h
        .bridge
        .get_or_create_user("nope", "nope:alice", UserOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_use_instead_is_followed() {
    let h = Harness::new();

    let mut old = User::new("fake", "fake:old");
    old.use_instead = Some(UserKey::new("fake", "fake:new"));
    h.put_user(&old).await;
    h.put_user(&User::new("fake", "fake:new")).await;

    let user = h.bridge.get_user("fake", "fake:old", false).await.unwrap().unwrap();
    assert_eq!(user.id, "fake:new");

    let user = h
        .bridge
        .get_or_create_user("fake", "fake:old", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(user.id, "fake:new");
}

#[tokio::test]
async fn test_dangling_use_instead_reads_alias() {
    let h = Harness::new();

    let mut alias = User::new("fake", "fake:alias");
    alias.use_instead = Some(UserKey::new("fake", "fake:gone"));
    h.put_user(&alias).await;

    let user = h.bridge.get_user("fake", "fake:alias", false).await.unwrap().unwrap();
    assert_eq!(user.id, "fake:alias");

    let user = h
        .bridge
        .get_or_create_user(
            "fake",
            "fake:alias",
            UserOptions {
                direct: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(user.id, "fake:alias");
    assert!(user.direct);

    let stored = h.store.get("users", "fake:fake:alias").await.unwrap().unwrap();
    assert_eq!(stored.doc["direct"], json!(true));
    assert!(h.store.get("users", "fake:fake:gone").await.unwrap().is_none());
}

#[tokio::test]
async fn test_enable_protocol_welcomes_once() {
    let mut h = Harness::new();

    let mut user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();

    h.bridge.enable_protocol(&mut user, "efake").await.unwrap();
    assert!(user.has_enabled("efake"));
    assert_eq!(user.copies, [Target::new("efake", "efake:copy/fake:alice")]);

    let dm = h.dms.try_recv().unwrap();
    assert_eq!(dm.kind, DmKind::Welcome);
    assert_eq!(dm.to, user.key());
    assert_eq!(dm.from_protocol, "efake");

    h.bridge.disable_protocol(&mut user, "efake").await.unwrap();
    assert!(!user.has_enabled("efake"));
    let stored = h.bridge.get_user("fake", "fake:alice", false).await.unwrap().unwrap();
    assert!(!stored.has_enabled("efake"));

    h.bridge.enable_protocol(&mut user, "efake").await.unwrap();
    assert!(user.has_enabled("efake"));
    assert_eq!(user.copies.len(), 1);
    assert!(h.dms.try_recv().is_err());
}

#[tokio::test]
async fn test_enable_protocol_needs_stored_user() {
    let h = Harness::new();
    let mut user = User::new("fake", "fake:ghost");
    let err = h.bridge.enable_protocol(&mut user, "other").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_add_user_copy_warms_cache() {
    let h = Harness::new();
    let mut user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();

    h.bridge
        .add_user_copy(&mut user, Target::new("efake", "efake:mirror"))
        .await
        .unwrap();
    assert_eq!(user.copies, [Target::new("efake", "efake:mirror")]);

    let queries = h.store.query_count();
    let original = h
        .bridge
        .originals()
        .original_user(h.bridge.store(), h.bridge.registry(), "efake:mirror")
        .await
        .unwrap();
    assert_eq!(original, Some(user.key()));
    assert_eq!(h.store.query_count(), queries);
}

#[tokio::test]
async fn test_reload_profile_and_views() {
    let h = Harness::new();
    h.fake.set_profile(
        "fake:alice",
        json!({
            "objectType": "person",
            "displayName": "Alice",
            "image": [{"url": "https://pics/alice.jpg"}],
        }),
    );

    let mut user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();
    assert_eq!(h.bridge.name(&user), "Alice");
    assert_eq!(h.bridge.handle_or_id(&user), "@alice.fake");
    assert_eq!(
        h.bridge.profile_picture(&user).as_deref(),
        Some("https://pics/alice.jpg")
    );
    assert_eq!(h.bridge.id_as(&user, "other").as_deref(), Some("fake:alice"));

    // stored by the fetch, so a fresh load sees it
    let mut users = vec![User::new("fake", "fake:alice"), User::new("fake", "fake:nobody")];
    h.bridge.load_multi(&mut users).await.unwrap();
    assert!(users[0].profile.is_some());
    assert!(users[1].profile.is_none());
    assert_eq!(h.bridge.name(&users[1]), "@nobody.fake");

    let loads = h.fake.loads.load(Ordering::SeqCst);
    h.bridge.reload_profile(&mut user).await;
    assert_eq!(h.fake.loads.load(Ordering::SeqCst), loads + 1);
    assert!(user.profile.is_some());
}

#[tokio::test]
async fn test_handle_as_translates_into_target_protocol() {
    let h = Harness::new();
    let user = User::new("fake", "fake:alice");

    assert_eq!(h.bridge.handle_as(&user, "other").as_deref(), Some("alice.fake.ot.brid.gy"));
    assert_eq!(h.bridge.handle_as(&user, "fake").as_deref(), Some("@alice.fake"));
    assert!(h.bridge.handle_as(&user, "nope").is_none());

    let stranger = User::new("fake", "other:bob");
    assert!(h.bridge.handle_as(&stranger, "other").is_none());
}

#[tokio::test]
async fn test_delete_user_stores_delete_activity() {
    let h = Harness::new();
    let user = h
        .bridge
        .get_or_create_user("fake", "fake:alice", UserOptions::default())
        .await
        .unwrap()
        .into_user()
        .unwrap();

    let activity = h.bridge.delete_user(&user, Some("ot")).await.unwrap();
    assert!(activity.id.starts_with("fake:alice#delete-user-other-"));
    assert_eq!(activity.users, [user.key()]);
    assert_eq!(activity.labels, ["activity"]);
    assert!(activity.expire.is_some());

    let stored = h.bridge.get_object(&activity.id).await.unwrap().unwrap();
    let as1 = stored.as1(h.bridge.registry()).unwrap();
    assert_eq!(as1["verb"], json!("delete"));
    assert_eq!(as1["object"], json!("fake:alice"));
}
