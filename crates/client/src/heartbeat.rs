use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Spawn the reconciliation tick for every session in `registry`.
///
/// Each tick publishes presence heartbeats, refreshes open editors, renews
/// locks that are still being edited, evicts silent peers and prunes
/// expired locks. Runs at [`CollabSettings::tick_interval`] until `cancel`
/// fires.
///
/// [`CollabSettings::tick_interval`]: reqcollab_core::settings::CollabSettings::tick_interval
pub fn start_heartbeat(
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = registry.settings().tick_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let count = registry.reconcile_all().await;
                    tracing::trace!(count, "Collaboration heartbeat");
                }
            }
        }
        tracing::debug!("Collaboration heartbeat stopped");
    })
}
