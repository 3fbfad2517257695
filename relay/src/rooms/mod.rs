//! Room Registry
//!
//! Maps room names to room records, tracks which relay owns each name, and
//! resolves viewer requests to a local room (serve) or a remote owner
//! (fetch). The mesh-wide ownership index is eventually consistent via the
//! `room-state` topic; name conflicts resolve to the earlier claim, with
//! ties going to the numerically smaller peer id.

pub mod control;
pub mod error;
pub mod fanout;
pub mod room;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use libp2p::PeerId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sr_proto::RoomStateMessage;

pub use error::RegistryError;
pub use room::{Participant, Room};

use crate::telemetry::RelayGauges;

/// One entry of the mesh-wide ownership index.
#[derive(Debug, Clone)]
pub struct OwnershipEntry {
    pub owner: PeerId,
    pub claim_time_ms: i64,
}

/// `true` when claim `a` wins the name over claim `b`: the earlier claim
/// time, with equal timestamps resolving to the smaller peer id.
#[must_use]
pub fn claim_beats(a_time_ms: i64, a_owner: &PeerId, b_time_ms: i64, b_owner: &PeerId) -> bool {
    match a_time_ms.cmp(&b_time_ms) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a_owner.to_bytes() < b_owner.to_bytes(),
    }
}

/// The registry of local rooms (owned and mirrored) plus the ownership
/// index. The index is mutated only by the gossip consumer and the
/// disconnect handler; room creation inserts the local claim directly so
/// resolution works before the first broadcast lands.
pub struct RoomRegistry {
    local_peer_id: PeerId,
    local: RwLock<HashMap<String, Arc<Room>>>,
    index: RwLock<HashMap<String, OwnershipEntry>>,
    announce_tx: mpsc::Sender<RoomStateMessage>,
    fetching: tokio::sync::Mutex<HashSet<String>>,
    gauges: RelayGauges,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(
        local_peer_id: PeerId,
        announce_tx: mpsc::Sender<RoomStateMessage>,
        gauges: RelayGauges,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer_id,
            local: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            announce_tx,
            fetching: tokio::sync::Mutex::new(HashSet::new()),
            gauges,
        })
    }

    /// This relay's peer id.
    #[must_use]
    pub const fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Gauges for room / viewer counts.
    #[must_use]
    pub const fn gauges(&self) -> &RelayGauges {
        &self.gauges
    }

    /// Create (or return) a locally owned room. Fails with `NameTaken` when
    /// the index holds the name for another relay.
    pub async fn create(&self, name: &str) -> Result<Arc<Room>, RegistryError> {
        self.create_at(name, Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn create_at(
        &self,
        name: &str,
        claim_time_ms: i64,
    ) -> Result<Arc<Room>, RegistryError> {
        {
            let index = self.index.read().await;
            if let Some(entry) = index.get(name) {
                if entry.owner != self.local_peer_id {
                    return Err(RegistryError::NameTaken(name.to_owned()));
                }
            }
        }

        let room = {
            let mut local = self.local.write().await;
            if let Some(existing) = local.get(name) {
                if existing.owner != self.local_peer_id {
                    return Err(RegistryError::NameTaken(name.to_owned()));
                }
                return Ok(Arc::clone(existing));
            }
            let room = Room::new(name.to_owned(), self.local_peer_id, claim_time_ms);
            local.insert(name.to_owned(), Arc::clone(&room));
            self.gauges.rooms.set(local.len() as i64);
            room
        };

        self.index.write().await.insert(
            name.to_owned(),
            OwnershipEntry {
                owner: self.local_peer_id,
                claim_time_ms,
            },
        );

        info!(room = %name, "Room created");
        self.announce().await;
        Ok(room)
    }

    /// Resolve a producer's push for `name`. Maps the state errors onto the
    /// push protocol's rejection reasons.
    pub async fn bind_push_room(&self, name: &str) -> Result<Arc<Room>, RegistryError> {
        self.bind_push_room_at(name, Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn bind_push_room_at(
        &self,
        name: &str,
        claim_time_ms: i64,
    ) -> Result<Arc<Room>, RegistryError> {
        {
            let index = self.index.read().await;
            if let Some(entry) = index.get(name) {
                if entry.owner != self.local_peer_id {
                    return Err(RegistryError::NotOwner(name.to_owned()));
                }
            }
        }
        {
            let local = self.local.read().await;
            if let Some(room) = local.get(name) {
                if room.owner != self.local_peer_id {
                    return Err(RegistryError::NotOwner(name.to_owned()));
                }
                if room.is_online().await {
                    return Err(RegistryError::AlreadyOnline(name.to_owned()));
                }
                return Ok(Arc::clone(room));
            }
        }
        match self.create_at(name, claim_time_ms).await {
            Ok(room) => Ok(room),
            Err(RegistryError::NameTaken(name)) => Err(RegistryError::NotOwner(name)),
            Err(e) => Err(e),
        }
    }

    /// Create (or return) the local mirror of a remote room. Mirrors carry
    /// the remote owner and never enter our ownership claims.
    pub async fn get_or_create_mirror(&self, name: &str, owner: PeerId) -> Arc<Room> {
        let mut local = self.local.write().await;
        if let Some(room) = local.get(name) {
            return Arc::clone(room);
        }
        let room = Room::new(name.to_owned(), owner, Utc::now().timestamp_millis());
        local.insert(name.to_owned(), Arc::clone(&room));
        self.gauges.rooms.set(local.len() as i64);
        info!(room = %name, owner = %owner, "Mirror room created");
        room
    }

    /// Look up a local room by name.
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.local.read().await.get(name).cloned()
    }

    /// Look up a local room by id.
    pub async fn get_by_id(&self, id: Uuid) -> Option<Arc<Room>> {
        self.local
            .read()
            .await
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Snapshot of all local rooms (owned and mirrored).
    pub async fn list_local(&self) -> Vec<Arc<Room>> {
        self.local.read().await.values().cloned().collect()
    }

    /// Who serves `name`: local rooms first, then the ownership index.
    pub async fn resolve_owner(&self, name: &str) -> Option<PeerId> {
        if let Some(room) = self.local.read().await.get(name) {
            return Some(room.owner);
        }
        self.index.read().await.get(name).map(|e| e.owner)
    }

    /// Remove and close a local room. Owned rooms retract their claim.
    pub async fn destroy_room(&self, name: &str) -> Option<Arc<Room>> {
        let room = {
            let mut local = self.local.write().await;
            let room = local.remove(name)?;
            self.gauges.rooms.set(local.len() as i64);
            room
        };
        // Only our own claim is retracted; a destroyed mirror leaves the
        // remote owner's index entry alone.
        if room.owner == self.local_peer_id {
            let mut index = self.index.write().await;
            if let Some(entry) = index.get(name) {
                if entry.owner == self.local_peer_id {
                    index.remove(name);
                }
            }
        }
        room.close().await;
        info!(room = %name, "Room destroyed");
        self.announce().await;
        Some(room)
    }

    /// Consume one `room-state` broadcast.
    pub async fn on_room_state(&self, source: PeerId, msg: &RoomStateMessage) {
        if source == self.local_peer_id {
            return;
        }
        if msg.peer_id != source.to_string() {
            debug!(source = %source, claimed = %msg.peer_id, "Ignoring room-state with mismatched peer id");
            return;
        }

        // Snapshot our own claims for conflict decisions.
        let local_rooms: Vec<(String, i64, PeerId)> = {
            let local = self.local.read().await;
            local
                .values()
                .map(|r| (r.name.clone(), r.claim_time_ms, r.owner))
                .collect()
        };
        let owned: HashMap<&str, i64> = local_rooms
            .iter()
            .filter(|(_, _, owner)| *owner == self.local_peer_id)
            .map(|(name, t, _)| (name.as_str(), *t))
            .collect();

        let claimed: HashSet<&str> = msg.rooms.iter().map(|c| c.name.as_str()).collect();
        let mut lost: Vec<String> = Vec::new();

        {
            let mut index = self.index.write().await;

            // Retract entries this peer no longer claims.
            index.retain(|name, entry| entry.owner != source || claimed.contains(name.as_str()));

            for claim in &msg.rooms {
                // Relays only announce their own rooms.
                let Ok(claim_owner) = claim.owner_id.parse::<PeerId>() else {
                    continue;
                };
                if claim_owner != source {
                    continue;
                }

                if let Some(our_time) = owned.get(claim.name.as_str()) {
                    if claim_beats(
                        claim.claim_time_ms,
                        &claim_owner,
                        *our_time,
                        &self.local_peer_id,
                    ) {
                        lost.push(claim.name.clone());
                        index.insert(
                            claim.name.clone(),
                            OwnershipEntry {
                                owner: claim_owner,
                                claim_time_ms: claim.claim_time_ms,
                            },
                        );
                    }
                    // Our claim stands; the remote concedes when it sees it.
                    continue;
                }

                match index.get(&claim.name) {
                    Some(existing) if existing.owner == claim_owner => {
                        // Refresh, keeping the earliest time we have seen.
                        let earliest = existing.claim_time_ms.min(claim.claim_time_ms);
                        index.insert(
                            claim.name.clone(),
                            OwnershipEntry {
                                owner: claim_owner,
                                claim_time_ms: earliest,
                            },
                        );
                    }
                    Some(existing) => {
                        if claim_beats(
                            claim.claim_time_ms,
                            &claim_owner,
                            existing.claim_time_ms,
                            &existing.owner,
                        ) {
                            index.insert(
                                claim.name.clone(),
                                OwnershipEntry {
                                    owner: claim_owner,
                                    claim_time_ms: claim.claim_time_ms,
                                },
                            );
                        }
                    }
                    None => {
                        index.insert(
                            claim.name.clone(),
                            OwnershipEntry {
                                owner: claim_owner,
                                claim_time_ms: claim.claim_time_ms,
                            },
                        );
                    }
                }
            }
        }

        for name in lost {
            warn!(
                room = %name,
                winner = %source,
                "Lost room ownership conflict, closing local room"
            );
            self.destroy_room(&name).await;
        }

        // Mirrors of rooms this peer no longer claims are dead.
        for (name, _, owner) in &local_rooms {
            if *owner == source && !claimed.contains(name.as_str()) {
                info!(room = %name, owner = %source, "Upstream room went away, closing mirror");
                self.destroy_room(name).await;
            }
        }
    }

    /// A peer left the mesh: drop its index entries and tear down any local
    /// mirrors of its rooms.
    pub async fn on_peer_disconnected(&self, peer: PeerId) {
        {
            let mut index = self.index.write().await;
            index.retain(|_, entry| entry.owner != peer);
        }

        let mirrored: Vec<String> = {
            let local = self.local.read().await;
            local
                .values()
                .filter(|r| r.owner == peer)
                .map(|r| r.name.clone())
                .collect()
        };
        for name in mirrored {
            info!(room = %name, owner = %peer, "Owner disconnected, closing mirror");
            self.destroy_room(&name).await;
        }
    }

    /// This relay's current `room-state` message (owned rooms only).
    pub async fn room_state_message(&self) -> RoomStateMessage {
        let local = self.local.read().await;
        RoomStateMessage {
            peer_id: self.local_peer_id.to_string(),
            rooms: local
                .values()
                .filter(|r| r.owner == self.local_peer_id)
                .map(|r| r.claim())
                .collect(),
        }
    }

    /// Claim the fetch slot for a remote room. Returns `false` when another
    /// task is already fetching it (wait on the mirror's online watch
    /// instead).
    pub async fn begin_fetch(&self, name: &str) -> bool {
        self.fetching.lock().await.insert(name.to_owned())
    }

    /// Release the fetch slot.
    pub async fn end_fetch(&self, name: &str) {
        self.fetching.lock().await.remove(name);
    }

    async fn announce(&self) {
        let msg = self.room_state_message().await;
        if let Err(e) = self.announce_tx.try_send(msg) {
            debug!(error = %e, "Room-state announcement queue full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;
    use sr_proto::RoomClaim;

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    fn registry(local: PeerId) -> (Arc<RoomRegistry>, mpsc::Receiver<RoomStateMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (RoomRegistry::new(local, tx, RelayGauges::new()), rx)
    }

    fn state_msg(owner: PeerId, name: &str, claim_time_ms: i64) -> RoomStateMessage {
        RoomStateMessage {
            peer_id: owner.to_string(),
            rooms: vec![RoomClaim {
                id: Uuid::new_v4(),
                name: name.to_owned(),
                owner_id: owner.to_string(),
                claim_time_ms,
            }],
        }
    }

    #[tokio::test]
    async fn created_rooms_resolve_locally() {
        let local = peer();
        let (registry, mut announcements) = registry(local);

        let room = registry.bind_push_room("alpha").await.unwrap();
        assert_eq!(room.owner, local);
        assert_eq!(registry.resolve_owner("alpha").await, Some(local));
        assert!(registry.get_by_id(room.id).await.is_some());

        // Creation announces the claim.
        let msg = announcements.recv().await.unwrap();
        assert_eq!(msg.rooms.len(), 1);
        assert_eq!(msg.rooms[0].name, "alpha");
    }

    #[tokio::test]
    async fn remote_claim_blocks_local_create_and_push() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry
            .on_room_state(remote, &state_msg(remote, "alpha", 100))
            .await;

        assert_eq!(
            registry.create("alpha").await.unwrap_err(),
            RegistryError::NameTaken("alpha".into())
        );
        assert_eq!(
            registry.bind_push_room("alpha").await.unwrap_err(),
            RegistryError::NotOwner("alpha".into())
        );
        assert_eq!(registry.resolve_owner("alpha").await, Some(remote));
    }

    #[tokio::test]
    async fn earlier_remote_claim_wins_the_conflict() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry.bind_push_room_at("charlie", 200).await.unwrap();
        registry
            .on_room_state(remote, &state_msg(remote, "charlie", 100))
            .await;

        assert!(registry.get_by_name("charlie").await.is_none());
        assert_eq!(registry.resolve_owner("charlie").await, Some(remote));
    }

    #[tokio::test]
    async fn later_remote_claim_loses_the_conflict() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry.bind_push_room_at("charlie", 100).await.unwrap();
        registry
            .on_room_state(remote, &state_msg(remote, "charlie", 200))
            .await;

        assert!(registry.get_by_name("charlie").await.is_some());
        assert_eq!(registry.resolve_owner("charlie").await, Some(local));
    }

    #[tokio::test]
    async fn equal_claims_tie_break_on_peer_id() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry.bind_push_room_at("charlie", 100).await.unwrap();
        registry
            .on_room_state(remote, &state_msg(remote, "charlie", 100))
            .await;

        let remote_wins = remote.to_bytes() < local.to_bytes();
        if remote_wins {
            assert!(registry.get_by_name("charlie").await.is_none());
            assert_eq!(registry.resolve_owner("charlie").await, Some(remote));
        } else {
            assert!(registry.get_by_name("charlie").await.is_some());
            assert_eq!(registry.resolve_owner("charlie").await, Some(local));
        }
    }

    #[tokio::test]
    async fn disconnect_drops_index_entries_and_mirrors() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry
            .on_room_state(remote, &state_msg(remote, "delta", 50))
            .await;
        registry.get_or_create_mirror("delta", remote).await;

        registry.on_peer_disconnected(remote).await;
        assert_eq!(registry.resolve_owner("delta").await, None);
        assert!(registry.get_by_name("delta").await.is_none());
    }

    #[tokio::test]
    async fn retraction_tears_down_the_mirror() {
        let local = peer();
        let remote = peer();
        let (registry, _announcements) = registry(local);

        registry
            .on_room_state(remote, &state_msg(remote, "echo", 50))
            .await;
        registry.get_or_create_mirror("echo", remote).await;

        let empty = RoomStateMessage {
            peer_id: remote.to_string(),
            rooms: vec![],
        };
        registry.on_room_state(remote, &empty).await;

        assert!(registry.get_by_name("echo").await.is_none());
        assert_eq!(registry.resolve_owner("echo").await, None);
    }

    #[test]
    fn claim_beats_orders_by_time_then_peer_id() {
        let a = peer();
        let b = peer();
        assert!(claim_beats(1, &a, 2, &b));
        assert!(!claim_beats(2, &a, 1, &b));

        let a_smaller = a.to_bytes() < b.to_bytes();
        assert_eq!(claim_beats(5, &a, 5, &b), a_smaller);
        assert_eq!(claim_beats(5, &b, 5, &a), !a_smaller);
    }
}
