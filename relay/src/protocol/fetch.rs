//! Remote Room Fetch (outbound request)
//!
//! When a viewer asks for a room owned by another relay, this relay becomes
//! a viewer itself: it opens `/stream-request/1` to the owner, answers the
//! owner's offer with a local inbound session, and feeds the received tracks
//! into a mirror room that local viewers are then served from. The mirror's
//! control channel is the upstream data channel, so input and feedback flow
//! through unchanged.

use std::sync::Arc;
use std::time::Duration;

use futures::io::AsyncReadExt;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use sr_proto::{write_frame, Frame, FramePayload, SessionDescription, REQUEST_PROTOCOL};

use super::{next_session_event, spawn_frame_reader, HandlerContext, ProtocolError};
use crate::media::{MediaSession, SessionEvent};
use crate::rooms::fanout::{spawn_ingest_reader, PacketKind};
use crate::rooms::{control, Room};

/// How long a viewer request waits for the mirror to come online.
const FETCH_ONLINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ensure a live local mirror of `name` fetched from `owner`. Concurrent
/// callers share one fetch; everyone waits on the mirror's online watch.
pub async fn ensure_mirror(
    ctx: &HandlerContext,
    owner: PeerId,
    name: &str,
) -> Result<Arc<Room>, ProtocolError> {
    let room = ctx.registry.get_or_create_mirror(name, owner).await;
    if room.owner != owner {
        return Err(ProtocolError::Unavailable(format!(
            "room {name} is not owned by {owner}"
        )));
    }
    if room.is_online().await {
        return Ok(room);
    }

    let mut online = room.online_watch();

    if ctx.registry.begin_fetch(name).await {
        let addr_hints = ctx.peerstore.addresses_of(&owner).await;
        match ctx.mesh.open_stream(owner, REQUEST_PROTOCOL, addr_hints).await {
            Ok(stream) => {
                info!(room = %name, owner = %owner, "Fetching room from owner");
                tokio::spawn(run_fetch(ctx.clone(), Arc::clone(&room), stream));
            }
            Err(e) => {
                ctx.registry.end_fetch(name).await;
                ctx.registry.destroy_room(name).await;
                return Err(e.into());
            }
        }
    }

    let became_online = tokio::time::timeout(FETCH_ONLINE_TIMEOUT, async {
        loop {
            if *online.borrow() {
                return true;
            }
            if online.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;

    match became_online {
        Ok(true) => Ok(room),
        _ => Err(ProtocolError::Unavailable(format!(
            "room {name} did not come online at {owner}"
        ))),
    }
}

/// Drive the requester side of the request protocol for one mirror's life.
async fn run_fetch(ctx: HandlerContext, room: Arc<Room>, stream: libp2p::Stream) {
    let name = room.name.clone();
    let (reader, mut writer) = stream.split();
    let mut frames = spawn_frame_reader(reader);

    let mut events: Option<mpsc::Receiver<SessionEvent>> = None;
    let mut session: Option<Arc<MediaSession>> = None;
    // Candidates the owner trickles ahead of its offer.
    let mut early_candidates = Vec::new();

    // The stream open carries no request; the initial frame is ours to send.
    let request = Frame::new(FramePayload::RequestStreamRoom {
        name: name.clone(),
        session_id: None,
    });
    if let Err(e) = write_frame(&mut writer, &request).await {
        warn!(room = %name, error = %e, "Fetch request failed");
        finish_fetch(&ctx, &room).await;
        return;
    }

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,

            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else { break };
                match frame.payload {
                    FramePayload::SessionAssigned { session_id, .. } => {
                        debug!(room = %name, session = %session_id, "Upstream session assigned");
                    }
                    FramePayload::Offer(desc) => {
                        if session.is_some() {
                            warn!(room = %name, "Duplicate offer from owner, resetting");
                            break;
                        }
                        let created = MediaSession::new(ctx.media.api(), ctx.media.rtc_config()).await;
                        let (media_session, session_events) = match created {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(room = %name, error = %e, "Mirror session creation failed");
                                break;
                            }
                        };

                        room.set_inbound(Arc::clone(&media_session)).await;

                        // Early candidates ride the held buffer and flush
                        // with the offer installation.
                        for candidate in early_candidates.drain(..) {
                            if let Err(e) = media_session.add_remote_candidate(candidate).await {
                                warn!(room = %name, error = %e, "Early candidate rejected");
                            }
                        }
                        let answer = match media_session.apply_offer(&desc.sdp).await {
                            Ok(answer) => answer,
                            Err(e) => {
                                warn!(room = %name, error = %e, "Owner offer rejected");
                                break;
                            }
                        };
                        let frame = Frame::new(FramePayload::Answer(SessionDescription {
                            sdp: answer,
                        }));
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            warn!(room = %name, error = %e, "Answer write failed");
                            break;
                        }
                        session = Some(media_session);
                        events = Some(session_events);
                    }
                    FramePayload::IceCandidate(candidate) => {
                        if let Some(session) = session.as_ref() {
                            if let Err(e) = session.add_remote_candidate(candidate).await {
                                warn!(room = %name, error = %e, "Upstream candidate rejected");
                            }
                        } else {
                            early_candidates.push(candidate);
                        }
                    }
                    FramePayload::RequestStreamOffline { .. } => {
                        info!(room = %name, "Owner reports room offline");
                        break;
                    }
                    payload => {
                        warn!(room = %name, kind = %payload.kind(), "Unexpected frame from owner, resetting");
                        break;
                    }
                }
            }

            event = next_session_event(&mut events) => {
                match event {
                    SessionEvent::Track(track) => {
                        let Some(kind) = PacketKind::from_codec_type(track.kind()) else {
                            warn!(room = %name, "Upstream track of unspecified kind, ignoring");
                            continue;
                        };
                        let codec = track.codec();
                        info!(room = %name, ?kind, mime = %codec.capability.mime_type, "Upstream track arrived");
                        room.record_track_codec(track.kind(), codec.capability).await;
                        spawn_ingest_reader(name.clone(), kind, track, Arc::clone(&room.fanout));
                    }
                    SessionEvent::DataChannel(channel) => {
                        debug!(room = %name, label = %channel.label(), "Upstream control channel open");
                        room.set_control_channel(Arc::clone(&channel)).await;
                        control::wire_producer_channel(&room, &channel);
                    }
                    SessionEvent::StateChanged(RTCPeerConnectionState::Connected) => {
                        info!(room = %name, "Mirror connected to owner");
                    }
                    SessionEvent::StateChanged(
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed,
                    ) => {
                        warn!(room = %name, "Mirror session to owner lost");
                        break;
                    }
                    SessionEvent::StateChanged(_) => {}
                    SessionEvent::LocalCandidate(candidate) => {
                        let frame = Frame::new(FramePayload::IceCandidate(candidate));
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            debug!(room = %name, error = %e, "Candidate write failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Some(session) = session {
        session.latch_closed();
    }
    finish_fetch(&ctx, &room).await;
}

async fn finish_fetch(ctx: &HandlerContext, room: &Arc<Room>) {
    ctx.registry.end_fetch(&room.name).await;
    ctx.registry.destroy_room(&room.name).await;
    info!(room = %room.name, "Mirror torn down");
}
