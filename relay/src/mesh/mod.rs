//! Mesh Layer
//!
//! Secure point-to-point connectivity between relays plus the two gossip
//! topics. One task owns the libp2p swarm; everything else talks to it
//! through [`MeshHandle`] (commands + a broadcast event stream) or directly
//! through the [`libp2p_stream`] control for protocol streams.
//!
//! Transports: TCP and WebSocket-over-TCP on both IP families, QUIC for
//! datagram-capable peers (browsers). Noise + yamux secure the byte-stream
//! transports; QUIC brings its own encryption. Relay client, DCUtR and
//! AutoNAT give NAT'd relays a path in.

pub mod error;
pub mod metrics;

use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    autonat, dcutr, gossipsub, identify, mdns, noise, ping, relay,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use libp2p::identity::Keypair;
use libp2p::metrics::Recorder;
use libp2p_stream::{Control, IncomingStreams};
use prometheus_client::registry::Registry;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use error::MeshError;

/// Gossip heartbeat and metrics broadcast interval.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(15);

/// Combined behaviour of the relay swarm.
#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    /// Raw protocol streams (push / request signalling).
    stream: libp2p_stream::Behaviour,
    /// Room-state and relay-metrics topics.
    gossipsub: gossipsub::Behaviour,
    /// Local network discovery.
    mdns: mdns::tokio::Behaviour,
    /// Peer information exchange.
    identify: identify::Behaviour,
    /// Round-trip latency probes.
    ping: ping::Behaviour,
    /// Circuit relay client for NAT traversal.
    relay_client: relay::client::Behaviour,
    /// Hole punching through relayed connections.
    dcutr: dcutr::Behaviour,
    /// Reachability / observed-address detection.
    autonat: autonat::Behaviour,
}

/// Events surfaced to the rest of the relay.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// First connection to a peer established.
    Connected(PeerId, Multiaddr),
    /// Last connection to a peer closed.
    Disconnected(PeerId),
    /// A gossip message arrived.
    Message {
        topic: String,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
    /// A ping round-trip completed.
    PingRtt(PeerId, Duration),
    /// mDNS found a peer on the local network.
    Discovered(PeerId, Multiaddr),
    /// A listener came up.
    NewListenAddr(Multiaddr),
}

enum MeshCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Addresses {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Cloneable handle to the mesh service.
#[derive(Clone)]
pub struct MeshHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<MeshCommand>,
    control: Control,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    /// This relay's peer id.
    #[must_use]
    pub const fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dial a multiaddr. Returns once the dial is queued; connection results
    /// arrive as [`MeshEvent`]s.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::Dial { addr, reply })
            .await
            .map_err(|_| MeshError::ServiceStopped)?;
        rx.await.map_err(|_| MeshError::ServiceStopped)?
    }

    /// Publish raw bytes on a gossip topic.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::Publish {
                topic: topic.to_owned(),
                data,
                reply,
            })
            .await
            .map_err(|_| MeshError::ServiceStopped)?;
        rx.await.map_err(|_| MeshError::ServiceStopped)?
    }

    /// Open a framed protocol stream to a peer. `addr_hints` seeds the
    /// swarm's address book so the open can dial a not-yet-connected peer.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
        addr_hints: Vec<Multiaddr>,
    ) -> Result<libp2p::Stream, MeshError> {
        if !addr_hints.is_empty() {
            let _ = self
                .cmd_tx
                .send(MeshCommand::AddAddresses {
                    peer,
                    addrs: addr_hints,
                })
                .await;
        }
        let mut control = self.control.clone();
        control
            .open_stream(peer, StreamProtocol::new(protocol))
            .await
            .map_err(|e| MeshError::StreamOpen(e.to_string()))
    }

    /// Register as the handler for a protocol id, receiving inbound streams.
    pub fn accept(&self, protocol: &'static str) -> Result<IncomingStreams, MeshError> {
        let mut control = self.control.clone();
        control
            .accept(StreamProtocol::new(protocol))
            .map_err(|e| MeshError::StreamOpen(e.to_string()))
    }

    /// Subscribe to mesh events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Current listen and external addresses.
    pub async fn addresses(&self) -> Vec<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MeshCommand::Addresses { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
impl MeshHandle {
    /// A handle with no backing swarm: commands fail, streams never open.
    /// Lets handler tests run without binding any sockets.
    pub(crate) fn detached() -> Self {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        Self {
            local_peer_id: PeerId::random(),
            cmd_tx,
            control: libp2p_stream::Behaviour::new().new_control(),
            events,
        }
    }
}

/// The swarm task. Built with [`spawn`], lives until cancellation.
struct MeshService {
    swarm: Swarm<MeshBehaviour>,
    cmd_rx: mpsc::Receiver<MeshCommand>,
    events: broadcast::Sender<MeshEvent>,
    metrics: libp2p::metrics::Metrics,
    cancel: CancellationToken,
}

/// Build the swarm, bind the listeners, and spawn the event loop. Listener
/// bind failure on the primary addresses is fatal; IPv6 binds are best
/// effort (not every host has the family enabled).
pub async fn spawn(
    keypair: Keypair,
    port: u16,
    prometheus: &mut Registry,
    cancel: CancellationToken,
) -> Result<(MeshHandle, JoinHandle<()>), MeshError> {
    let local_peer_id = keypair.public().to_peer_id();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| MeshError::Transport(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| MeshError::Transport(e.to_string()))?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| MeshError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| {
            let peer_id = key.public().to_peer_id();

            let mdns =
                mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                    .map_err(|e| e.to_string())?;

            // Tuned for a small mesh of relays rather than a large overlay.
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .mesh_outbound_min(0)
                .mesh_n_low(1)
                .mesh_n(3)
                .mesh_n_high(6)
                .gossip_lazy(3)
                .build()
                .map_err(|e| e.to_string())?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| e.to_string())?;

            let identify = identify::Behaviour::new(identify::Config::new(
                "/sr-relay/1.0.0".into(),
                key.public(),
            ));

            Ok(MeshBehaviour {
                stream: libp2p_stream::Behaviour::new(),
                gossipsub,
                mdns,
                identify,
                ping: ping::Behaviour::new(ping::Config::new()),
                relay_client,
                dcutr: dcutr::Behaviour::new(peer_id),
                autonat: autonat::Behaviour::new(peer_id, autonat::Config::default()),
            })
        })
        .map_err(|e| MeshError::Transport(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    // Primary listeners; a bind failure here aborts startup.
    for addr in [
        format!("/ip4/0.0.0.0/tcp/{port}"),
        format!("/ip4/0.0.0.0/tcp/{}/ws", ws_port(port)),
        format!("/ip4/0.0.0.0/udp/{port}/quic-v1"),
    ] {
        let parsed: Multiaddr = addr.parse().map_err(|e: libp2p::multiaddr::Error| {
            MeshError::Listen {
                addr: addr.clone(),
                reason: e.to_string(),
            }
        })?;
        swarm.listen_on(parsed).map_err(|e| MeshError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
    }

    // IPv6 is best effort.
    for addr in [
        format!("/ip6/::/tcp/{port}"),
        format!("/ip6/::/tcp/{}/ws", ws_port(port)),
        format!("/ip6/::/udp/{port}/quic-v1"),
    ] {
        if let Ok(parsed) = addr.parse::<Multiaddr>() {
            if let Err(e) = swarm.listen_on(parsed) {
                warn!(addr = %addr, error = %e, "IPv6 listener unavailable");
            }
        }
    }

    // Subscribe the gossip topics before the loop starts.
    for topic in [sr_proto::TOPIC_ROOM_STATE, sr_proto::TOPIC_RELAY_METRICS] {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic))
            .map_err(|e| MeshError::Transport(e.to_string()))?;
    }

    let control = swarm.behaviour().stream.new_control();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (events, _) = broadcast::channel(256);

    let handle = MeshHandle {
        local_peer_id,
        cmd_tx,
        control,
        events: events.clone(),
    };

    let service = MeshService {
        swarm,
        cmd_rx,
        events,
        metrics: libp2p::metrics::Metrics::new(prometheus),
        cancel,
    };

    info!(peer_id = %local_peer_id, port, "Mesh service starting");
    let task = tokio::spawn(service.run());
    Ok((handle, task))
}

/// WebSocket listener rides one port above the raw TCP listener. With an
/// ephemeral base port both listeners pick their own.
const fn ws_port(port: u16) -> u16 {
    if port == 0 {
        0
    } else {
        port.saturating_add(1)
    }
}

impl MeshService {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Mesh service shutting down");
                    break;
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd);
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: MeshCommand) {
        match cmd {
            MeshCommand::Dial { addr, reply } => {
                let result = self
                    .swarm
                    .dial(addr.clone())
                    .map_err(|e| MeshError::NetworkUnreachable(e.to_string()));
                if result.is_ok() {
                    debug!(addr = %addr, "Dialing");
                }
                let _ = reply.send(result);
            }
            MeshCommand::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(topic.clone()), data)
                    .map(|_| ())
                    .map_err(|e| MeshError::Publish {
                        topic,
                        reason: e.to_string(),
                    });
                let _ = reply.send(result);
            }
            MeshCommand::AddAddresses { peer, addrs } => {
                for addr in addrs {
                    self.swarm.add_peer_address(peer, addr);
                }
            }
            MeshCommand::Addresses { reply } => {
                let mut addrs: Vec<Multiaddr> =
                    self.swarm.listeners().cloned().collect();
                addrs.extend(self.swarm.external_addresses().cloned());
                addrs.dedup();
                let _ = reply.send(addrs);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match &event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(address = %address, "Listening");
                let _ = self.events.send(MeshEvent::NewListenAddr(address.clone()));
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                if num_established.get() == 1 {
                    debug!(peer = %peer_id, endpoint = %endpoint.get_remote_address(), "Peer connected");
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(peer_id);
                    let _ = self.events.send(MeshEvent::Connected(
                        *peer_id,
                        endpoint.get_remote_address().clone(),
                    ));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if *num_established == 0 {
                    debug!(peer = %peer_id, "Peer disconnected");
                    let _ = self.events.send(MeshEvent::Disconnected(*peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(peer = ?peer_id, error = %error, "Outgoing connection error");
            }
            SwarmEvent::Behaviour(behaviour) => {
                self.handle_behaviour_event(behaviour);
            }
            _ => {}
        }
        self.metrics.record(&event);
    }

    fn handle_behaviour_event(&mut self, event: &MeshBehaviourEvent) {
        match event {
            MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                let _ = self.events.send(MeshEvent::Message {
                    topic: message.topic.as_str().to_owned(),
                    source: message.source.or(Some(*propagation_source)),
                    data: message.data.clone(),
                });
            }
            MeshBehaviourEvent::Gossipsub(_) => {}
            MeshBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    if *peer_id == *self.swarm.local_peer_id() {
                        continue;
                    }
                    debug!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                    if let Err(e) = self.swarm.dial(addr.clone()) {
                        debug!(peer = %peer_id, error = %e, "Failed to dial discovered peer");
                    }
                    let _ = self
                        .events
                        .send(MeshEvent::Discovered(*peer_id, addr.clone()));
                }
            }
            MeshBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer_id, _) in peers {
                    debug!(peer = %peer_id, "mDNS peer expired");
                }
            }
            MeshBehaviourEvent::Ping(event) => {
                self.metrics.record(event);
                if let ping::Event {
                    peer,
                    result: Ok(rtt),
                    ..
                } = event
                {
                    let _ = self.events.send(MeshEvent::PingRtt(*peer, *rtt));
                }
            }
            MeshBehaviourEvent::Identify(event) => {
                self.metrics.record(event);
                if let identify::Event::Received { peer_id, info, .. } = event {
                    debug!(peer = %peer_id, protocol = %info.protocol_version, "Identified peer");
                    for addr in &info.listen_addrs {
                        self.swarm.add_peer_address(*peer_id, addr.clone());
                    }
                }
            }
            MeshBehaviourEvent::Dcutr(event) => {
                self.metrics.record(event);
                match &event.result {
                    Ok(_) => debug!(peer = %event.remote_peer_id, "Hole punch succeeded"),
                    Err(e) => debug!(peer = %event.remote_peer_id, error = %e, "Hole punch failed"),
                }
            }
            MeshBehaviourEvent::RelayClient(event) => {
                debug!(?event, "Relay client event");
            }
            MeshBehaviourEvent::Autonat(event) => {
                debug!(?event, "AutoNAT event");
            }
            MeshBehaviourEvent::Stream(()) => {}
        }
    }
}
