//! Metrics Publisher
//!
//! Periodic task broadcasting this relay's `relay-metrics` snapshot and
//! re-announcing its `room-state` claims. Change-driven announcements happen
//! at the room registry; this task is the steady heartbeat that lets late
//! joiners converge.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sr_proto::{RelayMetricsMessage, TOPIC_RELAY_METRICS, TOPIC_ROOM_STATE};

use super::{MeshHandle, PUBLISH_INTERVAL};
use crate::peerstore::Peerstore;
use crate::rooms::RoomRegistry;

/// Spawn the publisher. Runs until cancellation.
pub fn spawn_publisher(
    mesh: MeshHandle,
    peerstore: Arc<Peerstore>,
    registry: Arc<RoomRegistry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let local = mesh.local_peer_id();
            let metrics = RelayMetricsMessage {
                peer_id: local.to_string(),
                addresses: mesh
                    .addresses()
                    .await
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                neighbours: peerstore
                    .known_peers()
                    .await
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                latencies_ms: peerstore.latency_snapshot(&local).await,
            };

            match serde_json::to_vec(&metrics) {
                Ok(bytes) => {
                    if let Err(e) = mesh.publish(TOPIC_RELAY_METRICS, bytes).await {
                        // Routine while the mesh is still empty.
                        debug!(error = %e, "Metrics publish failed");
                    }
                }
                Err(e) => debug!(error = %e, "Metrics encode failed"),
            }

            let rooms = registry.room_state_message().await;
            match serde_json::to_vec(&rooms) {
                Ok(bytes) => {
                    if let Err(e) = mesh.publish(TOPIC_ROOM_STATE, bytes).await {
                        debug!(error = %e, "Room-state publish failed");
                    }
                }
                Err(e) => debug!(error = %e, "Room-state encode failed"),
            }
        }
    })
}
