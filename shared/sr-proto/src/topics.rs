//! Gossip Topic Payloads
//!
//! Two mesh-wide topics keep the relays loosely synchronised: `room-state`
//! carries room-ownership claims, `relay-metrics` carries reachability and
//! latency snapshots. Both are published periodically and on change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room ownership announcements.
pub const TOPIC_ROOM_STATE: &str = "room-state";

/// Relay reachability and latency snapshots.
pub const TOPIC_RELAY_METRICS: &str = "relay-metrics";

/// One relay's claim on a room name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClaim {
    /// Room id, unique per claim.
    pub id: Uuid,
    /// Human-readable room name, globally unique after conflict resolution.
    pub name: String,
    /// Owning relay peer id.
    pub owner_id: String,
    /// When the owner accepted the producer's push, unix milliseconds.
    /// Earlier claims win name conflicts; ties break to the smaller peer id.
    pub claim_time_ms: i64,
}

/// Everything one relay currently claims, broadcast on `room-state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStateMessage {
    /// Announcing relay.
    pub peer_id: String,
    /// Rooms the relay owns. An empty list retracts all previous claims.
    pub rooms: Vec<RoomClaim>,
}

/// Periodic relay snapshot, broadcast on `relay-metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMetricsMessage {
    /// Announcing relay.
    pub peer_id: String,
    /// Dialable multiaddrs.
    pub addresses: Vec<String>,
    /// Peer ids of current mesh neighbours.
    pub neighbours: Vec<String>,
    /// Observed round-trip latency per neighbour, milliseconds.
    pub latencies_ms: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_state_round_trips() {
        let msg = RoomStateMessage {
            peer_id: "12D3KooWExample".into(),
            rooms: vec![RoomClaim {
                id: Uuid::nil(),
                name: "charlie".into(),
                owner_id: "12D3KooWExample".into(),
                claim_time_ms: 1_700_000_000_000,
            }],
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: RoomStateMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn metrics_round_trips() {
        let mut latencies_ms = HashMap::new();
        latencies_ms.insert("12D3KooWOther".to_owned(), 23u64);
        let msg = RelayMetricsMessage {
            peer_id: "12D3KooWExample".into(),
            addresses: vec!["/ip4/10.0.0.1/tcp/4001".into()],
            neighbours: vec!["12D3KooWOther".into()],
            latencies_ms,
        };
        let back: RelayMetricsMessage =
            serde_json::from_slice(&serde_json::to_vec(&msg).unwrap()).unwrap();
        assert_eq!(msg, back);
    }
}
