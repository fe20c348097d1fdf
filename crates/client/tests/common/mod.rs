use std::sync::Arc;
use std::time::{Duration, Instant};

use reqcollab_client::{CollabHandle, SessionRegistry};
use reqcollab_core::clock::ManualClock;
use reqcollab_core::presence::PresenceIdentity;
use reqcollab_core::settings::CollabSettings;
use reqcollab_events::LocalHub;

pub const DOC: &str = "doc-1";

/// Two clients on one in-process hub, sharing a manual clock.
pub struct Pair {
    pub hub: Arc<LocalHub>,
    pub clock: Arc<ManualClock>,
    pub alice_registry: Arc<SessionRegistry>,
    pub bob_registry: Arc<SessionRegistry>,
    pub alice: CollabHandle,
    pub bob: CollabHandle,
}

pub fn registry(hub: &Arc<LocalHub>, clock: &Arc<ManualClock>, settings: CollabSettings) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(hub.clone(), settings, clock.clone()))
}

/// Open `DOC` as alice and bob from separate registries and wait until
/// each sees the other.
pub async fn pair_with(settings: CollabSettings) -> Pair {
    let hub = Arc::new(LocalHub::default());
    let clock = Arc::new(ManualClock::at_epoch());
    let alice_registry = registry(&hub, &clock, settings);
    let bob_registry = registry(&hub, &clock, settings);

    let alice = alice_registry
        .open(DOC, PresenceIdentity::new("alice", "Alice"))
        .await
        .expect("alice joins");
    let bob = bob_registry
        .open(DOC, PresenceIdentity::new("bob", "Bob"))
        .await
        .expect("bob joins");

    eventually("peers see each other", || {
        alice.active_users().len() == 2 && bob.active_users().len() == 2
    })
    .await;

    Pair {
        hub,
        clock,
        alice_registry,
        bob_registry,
        alice,
        bob,
    }
}

pub async fn pair() -> Pair {
    pair_with(CollabSettings::default()).await
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
