//! Peerstore
//!
//! The canonical arena of known peers. Records are keyed by peer id and hold
//! ids (never nested records) in their neighbour sets, so a peer appearing in
//! its own neighbour's neighbour list costs nothing. The mesh layer mutates
//! records through this handle; the snapshot functions never touch live
//! state beyond reading it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use sr_proto::{RelayMetricsMessage, RoomClaim};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Everything the relay knows about one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Canonical peer id string.
    pub peer_id: String,
    /// Dialable multiaddrs.
    pub addresses: HashSet<String>,
    /// Peer ids of the peer's own neighbours.
    pub neighbours: HashSet<String>,
    /// Observed round-trip latencies, peer id → milliseconds.
    pub latencies_ms: HashMap<String, u64>,
    /// Rooms the peer claims, by name.
    pub rooms: HashMap<String, RoomClaim>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    peers: Vec<PeerRecord>,
}

/// Concurrent map of peer records.
#[derive(Debug, Default)]
pub struct Peerstore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl Peerstore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dialable address for a peer, creating the record on first
    /// sighting.
    pub async fn record_address(&self, peer: PeerId, addr: &Multiaddr) {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer).or_insert_with(|| PeerRecord {
            peer_id: peer.to_string(),
            ..PeerRecord::default()
        });
        record.addresses.insert(addr.to_string());
    }

    /// Record a measured round-trip latency to a directly connected peer.
    pub async fn record_latency(&self, local: &PeerId, peer: PeerId, rtt_ms: u64) {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer).or_insert_with(|| PeerRecord {
            peer_id: peer.to_string(),
            ..PeerRecord::default()
        });
        record.latencies_ms.insert(local.to_string(), rtt_ms);
    }

    /// Merge a peer's `relay-metrics` broadcast into its record.
    pub async fn apply_metrics(&self, peer: PeerId, msg: &RelayMetricsMessage) {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer).or_insert_with(|| PeerRecord {
            peer_id: peer.to_string(),
            ..PeerRecord::default()
        });
        record.addresses.extend(msg.addresses.iter().cloned());
        record.neighbours = msg.neighbours.iter().cloned().collect();
        // Merge rather than replace so our own RTT measurement of this peer
        // survives between its broadcasts.
        record
            .latencies_ms
            .extend(msg.latencies_ms.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// Replace a peer's room claims from a `room-state` broadcast.
    pub async fn apply_rooms(&self, peer: PeerId, rooms: &[RoomClaim]) {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer).or_insert_with(|| PeerRecord {
            peer_id: peer.to_string(),
            ..PeerRecord::default()
        });
        record.rooms = rooms
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();
    }

    /// Known addresses of one peer.
    pub async fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let peers = self.peers.read().await;
        peers
            .get(peer)
            .map(|r| {
                r.addresses
                    .iter()
                    .filter_map(|a| a.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every known (peer, address) pair, used to re-dial the mesh at boot.
    pub async fn all_addresses(&self) -> Vec<(PeerId, Multiaddr)> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .flat_map(|(id, r)| {
                r.addresses
                    .iter()
                    .filter_map(|a| a.parse().ok())
                    .map(|a| (*id, a))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Latency snapshot (peer id → ms) for the metrics broadcast.
    pub async fn latency_snapshot(&self, local: &PeerId) -> HashMap<String, u64> {
        let local_key = local.to_string();
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter_map(|(id, r)| r.latencies_ms.get(&local_key).map(|ms| (id.to_string(), *ms)))
            .collect()
    }

    /// Peer ids with at least one live record.
    pub async fn known_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Serialise every record to `path`, atomically (temp file + rename).
    /// Failures are returned for the caller to log; live state is untouched.
    pub async fn snapshot_to(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = {
            let peers = self.peers.read().await;
            Snapshot {
                peers: peers.values().cloned().collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;

        // World-readable regardless of umask; the snapshot holds no secrets,
        // unlike the identity key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        }

        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Peerstore snapshot written");
        Ok(())
    }

    /// Load records from `path`, best effort: a missing file is an empty
    /// store, a corrupt file is logged and skipped.
    pub async fn load_from(&self, path: &Path) {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read peerstore snapshot");
                return;
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt peerstore snapshot, starting empty");
                return;
            }
        };

        let mut peers = self.peers.write().await;
        for record in snapshot.peers {
            if let Ok(id) = record.peer_id.parse::<PeerId>() {
                peers.insert(id, record);
            }
        }
        debug!(count = peers.len(), "Peerstore snapshot loaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstore.json");

        let store = Peerstore::new();
        let a = peer();
        let local = peer();
        store
            .record_address(a, &"/ip4/10.0.0.9/tcp/4001".parse().unwrap())
            .await;
        store.record_latency(&local, a, 17).await;
        store.snapshot_to(&path).await.unwrap();

        let restored = Peerstore::new();
        restored.load_from(&path).await;
        let addrs = restored.addresses_of(&a).await;
        assert_eq!(addrs, vec!["/ip4/10.0.0.9/tcp/4001".parse().unwrap()]);
        assert_eq!(restored.latency_snapshot(&local).await.get(&a.to_string()), Some(&17));
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Peerstore::new();
        store.load_from(&dir.path().join("nope.json")).await;
        assert!(store.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstore.json");
        fs::write(&path, b"{ definitely not json").unwrap();

        let store = Peerstore::new();
        store.load_from(&path).await;
        assert!(store.known_peers().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn snapshot_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstore.json");

        let store = Peerstore::new();
        store
            .record_address(peer(), &"/ip4/10.0.0.9/tcp/4001".parse().unwrap())
            .await;
        store.snapshot_to(&path).await.unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn metrics_broadcast_updates_neighbours() {
        let store = Peerstore::new();
        let a = peer();
        let msg = RelayMetricsMessage {
            peer_id: a.to_string(),
            addresses: vec!["/ip4/10.1.1.1/tcp/4001".into()],
            neighbours: vec!["12D3KooWNeighbour".into()],
            latencies_ms: HashMap::new(),
        };
        store.apply_metrics(a, &msg).await;
        assert_eq!(store.addresses_of(&a).await.len(), 1);
    }
}
