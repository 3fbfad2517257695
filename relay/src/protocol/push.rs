//! Push Protocol (inbound)
//!
//! Producer → owning relay. Binds a room name, answers the producer's offer,
//! and feeds the resulting inbound tracks into the room's fan-out. The room
//! lives exactly as long as this conversation: stream EOF or a media-session
//! failure destroys it.

use std::sync::Arc;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use libp2p::PeerId;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use sr_proto::{write_frame, Frame, FramePayload, RejectReason};

use super::{next_session_event, spawn_frame_reader, HandlerContext};
use crate::media::{MediaSession, SessionEvent};
use crate::rooms::fanout::{spawn_ingest_reader, PacketKind};
use crate::rooms::{control, RegistryError, Room};

/// Push conversation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    Init,
    RoomBound,
    Offered,
    Connected,
}

impl PushState {
    const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::RoomBound => "room-bound",
            Self::Offered => "offered",
            Self::Connected => "connected",
        }
    }
}

/// Serve one inbound push stream until it closes.
pub async fn serve<S>(ctx: HandlerContext, remote: PeerId, io: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = io.split();
    let mut frames = spawn_frame_reader(reader);

    let mut state = PushState::Init;
    let mut room: Option<Arc<Room>> = None;
    let mut session: Option<Arc<MediaSession>> = None;
    let mut events = None;
    // Candidates trickled before the offer; fed into the session's held
    // buffer once it exists.
    let mut early_candidates = Vec::new();

    debug!(peer = %remote, "Push stream opened");

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,

            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else { break };
                match handle_frame(&ctx, &remote, frame, &mut state, &mut room, &mut session, &mut events, &mut early_candidates, &mut writer).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(peer = %remote, error = %e, "Push stream error, resetting");
                        break;
                    }
                }
            }

            event = next_session_event(&mut events) => {
                match event {
                    SessionEvent::Track(track) => {
                        let Some(room) = room.as_ref() else { continue };
                        let Some(kind) = PacketKind::from_codec_type(track.kind()) else {
                            warn!(room = %room.name, "Inbound track of unspecified kind, ignoring");
                            continue;
                        };
                        let codec = track.codec();
                        info!(
                            room = %room.name,
                            ?kind,
                            mime = %codec.capability.mime_type,
                            "Producer track arrived"
                        );
                        room.record_track_codec(track.kind(), codec.capability).await;
                        spawn_ingest_reader(
                            room.name.clone(),
                            kind,
                            track,
                            Arc::clone(&room.fanout),
                        );
                    }
                    SessionEvent::DataChannel(channel) => {
                        let Some(room) = room.as_ref() else { continue };
                        debug!(room = %room.name, label = %channel.label(), "Producer control channel open");
                        room.set_control_channel(Arc::clone(&channel)).await;
                        control::wire_producer_channel(room, &channel);
                    }
                    SessionEvent::StateChanged(RTCPeerConnectionState::Connected) => {
                        state = PushState::Connected;
                        if let Some(room) = room.as_ref() {
                            info!(room = %room.name, peer = %remote, "Producer connected");
                        }
                    }
                    SessionEvent::StateChanged(
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed,
                    ) => {
                        if let Some(room) = room.as_ref() {
                            warn!(room = %room.name, peer = %remote, "Producer session lost");
                        }
                        break;
                    }
                    SessionEvent::StateChanged(_) => {}
                    SessionEvent::LocalCandidate(candidate) => {
                        let frame = Frame::new(FramePayload::IceCandidate(candidate));
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            debug!(peer = %remote, error = %e, "Candidate write failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    // Latch cleanup against a racing state callback, then take the room down
    // with everything attached to it.
    if let Some(session) = session {
        session.latch_closed();
    }
    if let Some(room) = room {
        info!(room = %room.name, peer = %remote, state = state.name(), "Push stream closed, destroying room");
        ctx.registry.destroy_room(&room.name).await;
    } else {
        debug!(peer = %remote, "Push stream closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame<W>(
    ctx: &HandlerContext,
    remote: &PeerId,
    frame: Frame,
    state: &mut PushState,
    room: &mut Option<Arc<Room>>,
    session: &mut Option<Arc<MediaSession>>,
    events: &mut Option<tokio::sync::mpsc::Receiver<SessionEvent>>,
    early_candidates: &mut Vec<sr_proto::IceCandidate>,
    writer: &mut W,
) -> Result<(), super::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    match (*state, frame.payload) {
        (PushState::Init, FramePayload::PushStreamRoom { name }) => {
            match ctx.registry.bind_push_room(&name).await {
                Ok(bound) => {
                    info!(room = %name, peer = %remote, "Push accepted");
                    write_frame(writer, &Frame::new(FramePayload::PushStreamOk { name }))
                        .await?;
                    *room = Some(bound);
                    *state = PushState::RoomBound;
                }
                Err(e) => {
                    let reason = match e {
                        RegistryError::AlreadyOnline(_) => RejectReason::AlreadyOnline,
                        RegistryError::NotOwner(_) | RegistryError::NameTaken(_) => {
                            RejectReason::NotOwner
                        }
                    };
                    info!(room = %name, peer = %remote, ?reason, "Push rejected");
                    write_frame(
                        writer,
                        &Frame::new(FramePayload::PushStreamRejected { name, reason }),
                    )
                    .await?;
                }
            }
            Ok(())
        }

        (PushState::RoomBound, FramePayload::Offer(desc)) => {
            let Some(bound) = room.as_ref() else {
                return Err(super::ProtocolError::UnexpectedFrame {
                    kind: sr_proto::PayloadKind::Offer,
                    state: state.name(),
                });
            };

            let (media_session, session_events) =
                MediaSession::new(ctx.media.api(), ctx.media.rtc_config()).await?;

            // The room is online from the moment it has an inbound session.
            bound.set_inbound(Arc::clone(&media_session)).await;

            // Candidates that raced ahead of the offer go through the held
            // buffer; applying the offer flushes them exactly once.
            for candidate in early_candidates.drain(..) {
                if let Err(e) = media_session.add_remote_candidate(candidate).await {
                    warn!(peer = %remote, error = %e, "Early candidate rejected");
                }
            }
            let answer = media_session.apply_offer(&desc.sdp).await?;

            write_frame(
                writer,
                &Frame::new(FramePayload::Answer(sr_proto::SessionDescription {
                    sdp: answer,
                })),
            )
            .await?;

            *session = Some(media_session);
            *events = Some(session_events);
            *state = PushState::Offered;
            Ok(())
        }

        (PushState::RoomBound, FramePayload::IceCandidate(candidate)) => {
            early_candidates.push(candidate);
            Ok(())
        }

        (
            PushState::Offered | PushState::Connected,
            FramePayload::IceCandidate(candidate),
        ) => {
            if let Some(session) = session.as_ref() {
                if let Err(e) = session.add_remote_candidate(candidate).await {
                    warn!(peer = %remote, error = %e, "Remote candidate rejected");
                }
            }
            Ok(())
        }

        (current, payload) => Err(super::ProtocolError::UnexpectedFrame {
            kind: payload.kind(),
            state: current.name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_proto::Framed;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::protocol::test_support::test_context;

    #[tokio::test]
    async fn solo_push_binds_a_room() {
        let ctx = test_context().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let remote = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();

        let handler = tokio::spawn(serve(ctx.clone(), remote, server.compat()));

        let mut framed = Framed::new(client.compat());
        framed
            .send(&Frame::new(FramePayload::PushStreamRoom {
                name: "alpha".into(),
            }))
            .await
            .unwrap();

        let reply = framed.read().await.unwrap().unwrap();
        assert_eq!(
            reply.payload,
            FramePayload::PushStreamOk {
                name: "alpha".into()
            }
        );
        assert!(ctx.registry.get_by_name("alpha").await.is_some());

        // Severing the stream destroys the room.
        drop(framed);
        handler.await.unwrap();
        assert!(ctx.registry.get_by_name("alpha").await.is_none());
    }

    #[tokio::test]
    async fn push_for_a_remote_room_is_rejected() {
        let ctx = test_context().await;
        let remote_owner = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        ctx.registry
            .on_room_state(
                remote_owner,
                &sr_proto::RoomStateMessage {
                    peer_id: remote_owner.to_string(),
                    rooms: vec![sr_proto::RoomClaim {
                        id: uuid::Uuid::new_v4(),
                        name: "alpha".into(),
                        owner_id: remote_owner.to_string(),
                        claim_time_ms: 1,
                    }],
                },
            )
            .await;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let producer = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let _handler = tokio::spawn(serve(ctx.clone(), producer, server.compat()));

        let mut framed = Framed::new(client.compat());
        framed
            .send(&Frame::new(FramePayload::PushStreamRoom {
                name: "alpha".into(),
            }))
            .await
            .unwrap();

        let reply = framed.read().await.unwrap().unwrap();
        assert_eq!(
            reply.payload,
            FramePayload::PushStreamRejected {
                name: "alpha".into(),
                reason: RejectReason::NotOwner,
            }
        );
    }

    #[tokio::test]
    async fn unexpected_frame_resets_the_stream() {
        let ctx = test_context().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let producer = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let handler = tokio::spawn(serve(ctx.clone(), producer, server.compat()));

        let mut framed = Framed::new(client.compat());
        // An answer before any room binding is a protocol error.
        framed
            .send(&Frame::new(FramePayload::Answer(
                sr_proto::SessionDescription { sdp: "v=0".into() },
            )))
            .await
            .unwrap();

        handler.await.unwrap();
        assert!(framed.read().await.unwrap().is_none());
    }
}
