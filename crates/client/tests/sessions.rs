//! Integration tests for document sessions: two clients on one
//! `LocalHub`, driven by a manual clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;

use reqcollab_client::SaveError;
use reqcollab_core::collaboration::EntityType;
use reqcollab_core::error::{CoreError, LockError};
use reqcollab_core::persistence::{MemoryPersistence, PersistenceError, VersionedRow};
use reqcollab_core::presence::{CursorPosition, PresenceIdentity};
use reqcollab_core::protocol::{CollabEvent, LockEvent};
use reqcollab_core::replica::ReplicaNotice;
use reqcollab_core::settings::CollabSettings;
use reqcollab_events::TransportSignal;

use common::{eventually, pair, pair_with, registry, DOC};

const WAIT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Test: handles for one document share a session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handles_share_one_session_per_document() {
    let p = pair().await;

    let second = p
        .alice_registry
        .open(DOC, PresenceIdentity::new("alice", "Alice"))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(p.alice.session(), second.session()));
    assert_eq!(p.alice_registry.session_count().await, 1);
    assert_eq!(p.bob_registry.session_count().await, 1);
    // One subscription per client.
    assert_eq!(p.hub.subscriber_count(DOC).await, 2);
}

// ---------------------------------------------------------------------------
// Test: cursor moves reach peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cursor_updates_reach_peers() {
    let p = pair().await;
    let cursor = CursorPosition {
        block_id: "b1".into(),
        offset: 3,
    };

    p.alice.update_cursor(Some(cursor.clone()), None).unwrap();

    eventually("bob sees alice's cursor", || {
        p.bob
            .active_users()
            .iter()
            .any(|u| u.user_id == "alice" && u.cursor.as_ref() == Some(&cursor))
    })
    .await;
}

// ---------------------------------------------------------------------------
// Test: a lock held by one client is denied to the other
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lock_is_denied_to_peer() {
    let p = pair().await;

    p.alice.acquire_lock("C1", EntityType::Cell).unwrap();
    eventually("bob sees the lock", || p.bob.lock_for("C1").is_some()).await;

    let err = p.bob.acquire_lock("C1", EntityType::Cell).unwrap_err();
    let denied = err.denied().expect("denied, not invalid");
    assert_eq!(denied.current_owner.as_deref(), Some("alice"));
    assert!(p.bob.renew_lock("C1").is_err());

    assert!(p.alice.release_lock("C1"));
    eventually("bob sees the release", || p.bob.lock_for("C1").is_none()).await;
    assert!(p.bob.acquire_lock("C1", EntityType::Cell).is_ok());
}

// ---------------------------------------------------------------------------
// Test: conflict raised and cleared through the watch channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflicts_are_pushed_to_subscribers() {
    let p = pair().await;
    let mut alice_conflicts = p.alice.subscribe_conflicts();

    p.alice.begin_editing("C1", EntityType::Cell).unwrap();
    p.bob.begin_editing("C1", EntityType::Cell).unwrap();

    let raised = tokio::time::timeout(WAIT, alice_conflicts.wait_for(|s| !s.is_empty()))
        .await
        .expect("conflict raised")
        .unwrap()
        .clone();
    assert_eq!(raised[0].entity_id, "C1");
    assert_eq!(raised[0].user_ids(), vec!["alice", "bob"]);
    assert!(p.alice.conflicts_by_entity().contains_key("C1"));

    assert!(p.bob.end_editing("C1"));
    tokio::time::timeout(WAIT, alice_conflicts.wait_for(|s| s.is_empty()))
        .await
        .expect("conflict cleared")
        .unwrap();
    assert!(p.alice.conflicts_by_entity().is_empty());
}

// ---------------------------------------------------------------------------
// Test: leaving releases locks on every peer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn leave_releases_locks_for_peers() {
    let p = pair().await;
    p.alice.acquire_lock("C1", EntityType::Cell).unwrap();
    eventually("bob sees the lock", || p.bob.lock_for("C1").is_some()).await;

    assert!(p.alice.leave().is_some());

    eventually("bob sees alice leave", || {
        p.bob.lock_for("C1").is_none() && p.bob.active_users().len() == 1
    })
    .await;
    assert!(p.alice.session().is_closed());
    assert_eq!(p.alice_registry.session_count().await, 0);
}

// ---------------------------------------------------------------------------
// Test: a handle that has left can no longer take locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn departed_handle_cannot_lock() {
    let p = pair().await;
    assert!(p.alice.leave().is_some());
    eventually("bob sees alice leave", || p.bob.active_users().len() == 1).await;

    assert_matches!(
        p.alice.acquire_lock("C1", EntityType::Cell),
        Err(LockError::Invalid(_))
    );
    assert_matches!(
        p.alice.begin_editing("C1", EntityType::Cell),
        Err(CoreError::Validation(_))
    );
    assert!(p.alice.lock_for("C1").is_none());

    let lock = p.bob.acquire_lock("C1", EntityType::Cell).unwrap();
    assert_eq!(lock.owner_user_id, "bob");
}

// ---------------------------------------------------------------------------
// Test: an entity id peers would reject is refused locally
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lock_on_invalid_entity_id_is_refused() {
    let p = pair().await;

    assert_matches!(
        p.alice.acquire_lock("row 7", EntityType::Cell),
        Err(LockError::Invalid(CoreError::Validation(_)))
    );
    assert!(p.alice.lock_for("row 7").is_none());
    assert!(p.alice.locks_by_entity().is_empty());
}

// ---------------------------------------------------------------------------
// Test: lock events from concurrent callers reach the channel in order
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_lock_actions_publish_in_order() {
    let p = pair().await;
    let mut rx = p.hub.channel(DOC).await.unwrap().subscribe();
    let alice_client = p.alice.session().client_id();

    std::thread::scope(|s| {
        for _ in 0..2 {
            let handle = p.alice.clone();
            s.spawn(move || {
                for _ in 0..100 {
                    handle.acquire_lock("C1", EntityType::Cell).unwrap();
                    handle.release_lock("C1");
                }
            });
        }
    });
    assert!(p.alice.lock_for("C1").is_none());

    let mut held = false;
    let mut releases = 0;
    while let Ok(signal) = rx.try_recv() {
        let TransportSignal::Message(message) = signal else {
            continue;
        };
        if message.client_id != alice_client {
            continue;
        }
        match message.event {
            CollabEvent::Lock(LockEvent::Acquired { .. } | LockEvent::Renewed { .. }) => held = true,
            CollabEvent::Lock(LockEvent::Released { .. }) => {
                assert!(held, "release published ahead of its grant");
                held = false;
                releases += 1;
            }
            _ => {}
        }
    }
    assert!(!held, "last published lock event must be a release");
    assert!(releases > 0);

    eventually("bob sees no lock", || p.bob.lock_for("C1").is_none()).await;
}

// ---------------------------------------------------------------------------
// Test: a silent peer is evicted on the next reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_peer_is_evicted_and_its_locks_released() {
    let settings = CollabSettings {
        heartbeat_interval: ChronoDuration::seconds(5),
        presence_timeout: ChronoDuration::seconds(20),
        ..CollabSettings::default()
    };
    let p = pair_with(settings).await;
    let mut notices = p.alice.subscribe_notices();

    p.bob.acquire_lock("C1", EntityType::Cell).unwrap();
    eventually("alice sees the lock", || p.alice.lock_for("C1").is_some()).await;

    // Bob's process stops without leaving.
    p.bob.session().close();
    p.clock.advance(ChronoDuration::seconds(21));

    let report = p.alice.session().reconcile();
    assert_eq!(report.evicted, vec!["bob".to_string()]);
    assert!(p.alice.lock_for("C1").is_none());

    let mut evicted = false;
    while let Ok(notice) = notices.try_recv() {
        evicted |= notice == ReplicaNotice::PeerEvicted("bob".into());
    }
    assert!(evicted);
}

// ---------------------------------------------------------------------------
// Test: the tick renews only locks still being edited
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_renews_edited_locks() {
    let p = pair().await;
    let lock = p.alice.acquire_lock("C1", EntityType::Cell).unwrap();
    p.alice.acquire_lock("C2", EntityType::Cell).unwrap();
    p.alice.begin_editing("C1", EntityType::Cell).unwrap();

    p.clock.advance(ChronoDuration::seconds(10));
    p.alice.session().reconcile();
    p.bob.session().reconcile();

    let renewed = p.alice.lock_for("C1").unwrap();
    assert_eq!(renewed.expires_at, lock.expires_at + ChronoDuration::seconds(10));
    eventually("bob sees the renewal", || {
        p.bob.lock_for("C1").map(|l| l.expires_at) == Some(renewed.expires_at)
    })
    .await;

    p.clock.advance(ChronoDuration::seconds(21));
    assert!(p.alice.lock_for("C2").is_none(), "unedited lock expired");
    assert!(p.alice.lock_for("C1").is_some());
}

// ---------------------------------------------------------------------------
// Test: a resumed channel re-syncs state missed while offline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resumed_channel_resyncs_presence() {
    let p = pair().await;
    let cursor = CursorPosition {
        block_id: "b2".into(),
        offset: 8,
    };

    assert!(p.hub.set_offline(DOC).await);
    p.alice.update_cursor(Some(cursor.clone()), None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(p
        .bob
        .active_users()
        .iter()
        .all(|u| u.cursor.is_none()));

    assert!(p.hub.set_online(DOC).await);
    eventually("bob catches up", || {
        p.bob
            .active_users()
            .iter()
            .any(|u| u.user_id == "alice" && u.cursor.as_ref() == Some(&cursor))
    })
    .await;
}

// ---------------------------------------------------------------------------
// Test: a late joiner learns existing state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_joiner_receives_existing_locks() {
    let p = pair().await;
    p.alice.acquire_lock("C1", EntityType::Cell).unwrap();

    let carol_registry = registry(&p.hub, &p.clock, CollabSettings::default());
    let carol = carol_registry
        .open(DOC, PresenceIdentity::new("carol", "Carol"))
        .await
        .unwrap();

    eventually("carol sees alice's lock and both peers", || {
        carol.lock_for("C1").map(|l| l.owner_user_id) == Some("alice".to_string())
            && carol.active_users().len() == 3
    })
    .await;
}

// ---------------------------------------------------------------------------
// Test: save commits through persistence and closes the edit
// ---------------------------------------------------------------------------

fn row(entity_id: &str, version: i64) -> VersionedRow {
    VersionedRow {
        entity_id: entity_id.into(),
        document_id: DOC.into(),
        version,
        fields: serde_json::json!({ "text": "draft" }),
        updated_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn save_commits_then_releases() {
    let p = pair().await;
    let store = MemoryPersistence::new();
    store.insert_row(row("C1", 1)).unwrap();

    p.alice.acquire_lock("C1", EntityType::Cell).unwrap();
    p.alice.begin_editing("C1", EntityType::Cell).unwrap();

    let saved = p
        .alice
        .save_entity(&store, "C1", 1, serde_json::json!({ "text": "final" }))
        .await
        .unwrap();
    assert_eq!(saved.version, 2);
    assert!(p.alice.lock_for("C1").is_none());
    assert!(p.alice.session().intents().is_empty());

    let stale = p
        .alice
        .save_entity(&store, "C1", 1, serde_json::json!({ "text": "again" }))
        .await;
    assert_matches!(
        stale,
        Err(SaveError::Persistence(PersistenceError::VersionConflict { expected: 1, actual: 2, .. }))
    );
}

#[tokio::test]
async fn save_is_refused_under_someone_elses_lock() {
    let p = pair().await;
    let store = MemoryPersistence::new();
    store.insert_row(row("C2", 1)).unwrap();

    p.bob.acquire_lock("C2", EntityType::Cell).unwrap();
    eventually("alice sees bob's lock", || p.alice.lock_for("C2").is_some()).await;

    let result = p
        .alice
        .save_entity(&store, "C2", 1, serde_json::json!({ "text": "mine" }))
        .await;
    assert_matches!(result, Err(SaveError::Locked(denied)) if denied.current_owner.as_deref() == Some("bob"));
}
