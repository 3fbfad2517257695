//! Relay Wiring
//!
//! Builds the relay from its parts and owns the background tasks: mesh
//! event pump, room-state announcer, protocol accept loops, metrics
//! publisher and the optional metrics endpoint. No global state; every
//! component gets its handles through construction.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sr_proto::{
    RelayMetricsMessage, RoomStateMessage, PUSH_PROTOCOL, REQUEST_PROTOCOL, TOPIC_RELAY_METRICS,
    TOPIC_ROOM_STATE,
};

use crate::config::Config;
use crate::media;
use crate::mesh::{self, MeshEvent, MeshHandle};
use crate::peerstore::Peerstore;
use crate::protocol::{push, request, HandlerContext};
use crate::rooms::RoomRegistry;
use crate::telemetry::{self, RelayGauges};

/// A running relay.
pub struct Relay {
    config: Config,
    mesh: MeshHandle,
    peerstore: Arc<Peerstore>,
    registry: Arc<RoomRegistry>,
    cancel: CancellationToken,
}

impl Relay {
    /// Bring the relay up: mesh listeners, media engine, protocol handlers,
    /// background publishers. Fatal errors here abort startup.
    pub async fn start(
        config: Config,
        keypair: Keypair,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut prometheus = Registry::default();
        let gauges = RelayGauges::new();
        gauges.register(&mut prometheus);

        let (mesh, _mesh_task) = mesh::spawn(
            keypair,
            config.port,
            &mut prometheus,
            cancel.child_token(),
        )
        .await
        .context("mesh startup failed")?;

        let peerstore = Arc::new(Peerstore::new());
        peerstore.load_from(&config.peerstore_path()).await;

        let media = Arc::new(
            media::build(&config)
                .await
                .context("media engine startup failed")?,
        );

        let (announce_tx, announce_rx) = mpsc::channel(32);
        let registry = RoomRegistry::new(mesh.local_peer_id(), announce_tx, gauges);

        let ctx = HandlerContext {
            registry: Arc::clone(&registry),
            media: Arc::clone(&media),
            mesh: mesh.clone(),
            peerstore: Arc::clone(&peerstore),
            cancel: cancel.child_token(),
        };

        spawn_announce_pump(mesh.clone(), announce_rx, cancel.child_token());
        spawn_event_pump(
            mesh.clone(),
            Arc::clone(&peerstore),
            Arc::clone(&registry),
            cancel.child_token(),
        );
        spawn_accept_loops(&ctx).context("protocol registration failed")?;
        let _publisher = mesh::metrics::spawn_publisher(
            mesh.clone(),
            Arc::clone(&peerstore),
            Arc::clone(&registry),
            cancel.child_token(),
        );

        if config.metrics_enabled {
            let _metrics_server = telemetry::spawn_metrics_server(
                config.metrics_port,
                Arc::new(Mutex::new(prometheus)),
                cancel.child_token(),
            )
            .await
            .context("metrics endpoint startup failed")?;
        }

        // Best-effort reconnect to everyone we knew before the restart.
        let known = peerstore.all_addresses().await;
        if !known.is_empty() {
            info!(count = known.len(), "Re-dialing persisted peers");
            for (peer, addr) in known {
                if let Err(e) = mesh.dial(addr.clone()).await {
                    debug!(peer = %peer, addr = %addr, error = %e, "Reconnect dial failed");
                }
            }
        }

        Ok(Self {
            config,
            mesh,
            peerstore,
            registry,
            cancel,
        })
    }

    /// This relay's peer id.
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.mesh.local_peer_id()
    }

    /// The room registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Run until cancellation, then snapshot the peerstore.
    pub async fn run(self) -> Result<()> {
        self.cancel.cancelled().await;

        info!("Shutting down");
        if let Err(e) = self
            .peerstore
            .snapshot_to(&self.config.peerstore_path())
            .await
        {
            warn!(error = %e, "Peerstore snapshot failed");
        }
        Ok(())
    }
}

/// Forward room-state announcements from the registry onto the gossip topic.
fn spawn_announce_pump(
    mesh: MeshHandle,
    mut announce_rx: mpsc::Receiver<RoomStateMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe = announce_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    match serde_json::to_vec(&msg) {
                        Ok(bytes) => {
                            if let Err(e) = mesh.publish(TOPIC_ROOM_STATE, bytes).await {
                                // Expected while the mesh has no peers yet.
                                debug!(error = %e, "Room-state publish failed");
                            }
                        }
                        Err(e) => debug!(error = %e, "Room-state encode failed"),
                    }
                }
            }
        }
    });
}

/// Apply mesh events to the peerstore and the room registry.
fn spawn_event_pump(
    mesh: MeshHandle,
    peerstore: Arc<Peerstore>,
    registry: Arc<RoomRegistry>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let local = mesh.local_peer_id();
        let mut events = mesh.subscribe();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                result = events.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mesh event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match event {
                MeshEvent::Connected(peer, addr) => {
                    peerstore.record_address(peer, &addr).await;
                }
                MeshEvent::Discovered(peer, addr) => {
                    peerstore.record_address(peer, &addr).await;
                }
                MeshEvent::Disconnected(peer) => {
                    registry.on_peer_disconnected(peer).await;
                }
                MeshEvent::PingRtt(peer, rtt) => {
                    peerstore
                        .record_latency(&local, peer, rtt.as_millis() as u64)
                        .await;
                }
                MeshEvent::Message {
                    topic,
                    source,
                    data,
                } => {
                    let Some(source) = source else { continue };
                    if topic == TOPIC_ROOM_STATE {
                        match serde_json::from_slice::<RoomStateMessage>(&data) {
                            Ok(msg) => {
                                registry.on_room_state(source, &msg).await;
                                peerstore.apply_rooms(source, &msg.rooms).await;
                            }
                            Err(e) => {
                                debug!(source = %source, error = %e, "Malformed room-state message");
                            }
                        }
                    } else if topic == TOPIC_RELAY_METRICS {
                        match serde_json::from_slice::<RelayMetricsMessage>(&data) {
                            Ok(msg) => peerstore.apply_metrics(source, &msg).await,
                            Err(e) => {
                                debug!(source = %source, error = %e, "Malformed relay-metrics message");
                            }
                        }
                    }
                }
                MeshEvent::NewListenAddr(_) => {}
            }
        }
    });
}

/// Register both protocol handlers and fan inbound streams out to tasks.
fn spawn_accept_loops(ctx: &HandlerContext) -> Result<(), mesh::MeshError> {
    let mut push_streams = ctx.mesh.accept(PUSH_PROTOCOL)?;
    let push_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = push_ctx.cancel.cancelled() => break,
                maybe = push_streams.next() => {
                    let Some((peer, stream)) = maybe else { break };
                    tokio::spawn(push::serve(push_ctx.clone(), peer, stream));
                }
            }
        }
    });

    let mut request_streams = ctx.mesh.accept(REQUEST_PROTOCOL)?;
    let request_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = request_ctx.cancel.cancelled() => break,
                maybe = request_streams.next() => {
                    let Some((peer, stream)) = maybe else { break };
                    tokio::spawn(request::serve(request_ctx.clone(), peer, stream));
                }
            }
        }
    });

    Ok(())
}
