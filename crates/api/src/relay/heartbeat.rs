use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Interval between socket pings (in seconds).
const PING_INTERVAL_SECS: u64 = 30;

/// Spawn the relay's housekeeping task.
///
/// Every tick reconciles the observer sessions (evicting peers that went
/// silent), closes observers of documents with no sockets left and drops
/// idle hub channels. Sockets are pinged every [`PING_INTERVAL_SECS`].
/// The task stops when `cancel` fires.
pub fn start_heartbeat(state: AppState, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reconcile = tokio::time::interval(state.observers.settings().tick_interval());
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ping.tick() => {
                    let count = state.connections.connection_count().await;
                    tracing::debug!(count, "Relay heartbeat ping");
                    state.connections.ping_all().await;
                }
                _ = reconcile.tick() => sweep(&state).await,
            }
        }
        tracing::debug!("Relay heartbeat stopped");
    })
}

/// One housekeeping pass.
pub async fn sweep(state: &AppState) {
    state.observers.reconcile_all().await;

    for document_id in state.observers.document_ids().await {
        if state.connections.count_for_document(&document_id).await == 0 {
            state.observers.close(&document_id).await;
        }
    }

    state.hub.remove_idle().await;
}
