//! Room and Participant Records
//!
//! A room is one named live media session: the producer's inbound media
//! session plus the fan-out towards its participants. A room is online if
//! and only if it has a live inbound session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use sr_proto::RoomClaim;

use super::fanout::Fanout;
use crate::media::MediaSession;

/// Codec parameters recorded from the producer's inbound tracks.
#[derive(Debug, Default, Clone)]
pub struct NegotiatedCodecs {
    pub audio: Option<RTCRtpCodecCapability>,
    pub video: Option<RTCRtpCodecCapability>,
}

/// A viewer's per-room runtime record on the serving relay.
pub struct Participant {
    /// Unique participant id.
    pub id: Uuid,
    /// Session id, stable across reconnect attempts.
    pub session_id: String,
    /// The requesting peer.
    pub requester: PeerId,
    /// Outbound media session towards the viewer.
    pub session: Arc<MediaSession>,
    /// Outbound audio track; codec equals the room's recorded audio codec.
    pub audio_track: Arc<TrackLocalStaticRTP>,
    /// Outbound video track; codec equals the room's recorded video codec.
    pub video_track: Arc<TrackLocalStaticRTP>,
    /// Control channel towards the viewer.
    pub control: Arc<RTCDataChannel>,
    writer: Mutex<Option<JoinHandle<()>>>,
    cleaned: AtomicBool,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("requester", &self.requester)
            .field("cleaned", &self.cleaned.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Participant {
    #[must_use]
    pub fn new(
        session_id: String,
        requester: PeerId,
        session: Arc<MediaSession>,
        audio_track: Arc<TrackLocalStaticRTP>,
        video_track: Arc<TrackLocalStaticRTP>,
        control: Arc<RTCDataChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            session_id,
            requester,
            session,
            audio_track,
            video_track,
            control,
            writer: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        })
    }

    pub(super) async fn set_writer(&self, handle: JoinHandle<()>) {
        *self.writer.lock().await = Some(handle);
    }

    /// Release the participant's resources. Latched: runs at most once.
    pub async fn close(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.close().await;
        if let Some(writer) = self.writer.lock().await.take() {
            // The writer exits when its queue closes; the handle is dropped
            // rather than aborted so in-flight writes finish.
            drop(writer);
        }
        debug!(participant = %self.id, session = %self.session_id, "Participant closed");
    }
}

/// One named live media session owned by exactly one relay.
pub struct Room {
    /// Unique room id.
    pub id: Uuid,
    /// Globally unique room name.
    pub name: String,
    /// Owning relay.
    pub owner: PeerId,
    /// When the owner accepted the producer's push, unix milliseconds.
    pub claim_time_ms: i64,
    /// Packet distributor towards participants.
    pub fanout: Arc<Fanout>,
    codecs: RwLock<NegotiatedCodecs>,
    inbound: RwLock<Option<Arc<MediaSession>>>,
    control: RwLock<Option<Arc<RTCDataChannel>>>,
    participants: RwLock<HashMap<Uuid, Arc<Participant>>>,
    by_session: RwLock<HashMap<String, Uuid>>,
    online_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("claim_time_ms", &self.claim_time_ms)
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}

impl Room {
    #[must_use]
    pub fn new(name: String, owner: PeerId, claim_time_ms: i64) -> Arc<Self> {
        let (online_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            owner,
            claim_time_ms,
            fanout: Arc::new(Fanout::new()),
            codecs: RwLock::new(NegotiatedCodecs::default()),
            inbound: RwLock::new(None),
            control: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            online_tx,
        })
    }

    /// A room is online iff it has a live inbound media session.
    pub async fn is_online(&self) -> bool {
        self.inbound.read().await.is_some()
    }

    /// Watch online transitions (mid-handshake viewers use this to learn the
    /// room went away).
    #[must_use]
    pub fn online_watch(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Install the producer's inbound session, marking the room online.
    pub async fn set_inbound(&self, session: Arc<MediaSession>) {
        *self.inbound.write().await = Some(session);
        let _ = self.online_tx.send_replace(true);
    }

    /// The inbound session, when online.
    pub async fn inbound(&self) -> Option<Arc<MediaSession>> {
        self.inbound.read().await.clone()
    }

    /// Install the producer's control channel.
    pub async fn set_control_channel(&self, channel: Arc<RTCDataChannel>) {
        *self.control.write().await = Some(channel);
    }

    /// The producer's control channel, when open.
    pub async fn control_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.control.read().await.clone()
    }

    /// Record codec parameters from an inbound track.
    pub async fn record_track_codec(&self, kind: RTPCodecType, capability: RTCRtpCodecCapability) {
        let mut codecs = self.codecs.write().await;
        match kind {
            RTPCodecType::Audio => codecs.audio = Some(capability),
            RTPCodecType::Video => codecs.video = Some(capability),
            RTPCodecType::Unspecified => {}
        }
    }

    /// The codecs negotiated by the producer so far.
    pub async fn negotiated_codecs(&self) -> NegotiatedCodecs {
        self.codecs.read().await.clone()
    }

    /// Insert a connected participant: joins the fan-out and starts its
    /// writer. A participant reconnecting under the same session id replaces
    /// its predecessor.
    pub async fn insert_participant(&self, participant: Arc<Participant>) {
        if let Some(old_id) = {
            let by_session = self.by_session.read().await;
            by_session.get(&participant.session_id).copied()
        } {
            if let Some(old) = self.remove_participant(old_id).await {
                old.close().await;
            }
        }

        let rx = self.fanout.add(participant.id);
        let writer = super::fanout::spawn_writer(
            self.name.clone(),
            participant.id,
            rx,
            Arc::clone(&participant.audio_track),
            Arc::clone(&participant.video_track),
        );
        participant.set_writer(writer).await;

        self.by_session
            .write()
            .await
            .insert(participant.session_id.clone(), participant.id);
        self.participants
            .write()
            .await
            .insert(participant.id, Arc::clone(&participant));

        info!(
            room = %self.name,
            participant = %participant.id,
            session = %participant.session_id,
            viewers = self.fanout.len(),
            "Participant joined"
        );
    }

    /// Remove a participant from the room and its fan-out. The caller closes
    /// the returned participant.
    pub async fn remove_participant(&self, id: Uuid) -> Option<Arc<Participant>> {
        let participant = self.participants.write().await.remove(&id)?;
        self.by_session.write().await.remove(&participant.session_id);
        self.fanout.remove(id);
        info!(
            room = %self.name,
            participant = %id,
            viewers = self.fanout.len(),
            "Participant left"
        );
        Some(participant)
    }

    /// Look up a participant by its session id.
    pub async fn participant_by_session(&self, session_id: &str) -> Option<Arc<Participant>> {
        let id = { self.by_session.read().await.get(session_id).copied() }?;
        self.participants.read().await.get(&id).cloned()
    }

    /// Snapshot of current participants.
    pub async fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.read().await.values().cloned().collect()
    }

    /// Number of current participants.
    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Take the room offline and release everything: inbound session,
    /// participant sessions, queues.
    pub async fn close(&self) {
        let inbound = self.inbound.write().await.take();
        let _ = self.online_tx.send_replace(false);

        if let Some(session) = inbound {
            session.close().await;
        }
        *self.control.write().await = None;

        self.by_session.write().await.clear();
        let participants: Vec<Arc<Participant>> = {
            let mut map = self.participants.write().await;
            map.drain().map(|(_, p)| p).collect()
        };
        self.fanout.clear();
        for participant in participants {
            participant.close().await;
        }

        info!(room = %self.name, "Room closed");
    }

    /// This room's ownership claim for the `room-state` topic.
    #[must_use]
    pub fn claim(&self) -> RoomClaim {
        RoomClaim {
            id: self.id,
            name: self.name.clone(),
            owner_id: self.owner.to_string(),
            claim_time_ms: self.claim_time_ms,
        }
    }
}
