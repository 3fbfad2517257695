//! Request Protocol (inbound)
//!
//! Viewer or downstream relay → serving relay. Assigns a session id, offers
//! the room's media plus a control channel, and promotes the participant
//! into the room's fan-out once the media engine reports the connection.
//!
//! A broken request stream does not tear down a healthy media session: the
//! participant keeps being served and a detached monitor finishes the
//! cleanup when the session eventually dies.

use std::sync::Arc;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use libp2p::PeerId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use sr_proto::{write_frame, Frame, FramePayload, SessionDescription};

use super::{next_session_event, spawn_frame_reader, HandlerContext, ProtocolError};
use crate::media::{self, MediaSession, SessionEvent};
use crate::rooms::{control, Participant, Room};

/// Serve one inbound request stream until it closes.
pub async fn serve<S>(ctx: HandlerContext, remote: PeerId, io: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = io.split();
    let mut frames = spawn_frame_reader(reader);

    let mut events: Option<mpsc::Receiver<SessionEvent>> = None;
    let mut room: Option<Arc<Room>> = None;
    let mut participant: Option<Arc<Participant>> = None;
    let mut inserted = false;
    let mut answered = false;
    let mut offline_watch: Option<watch::Receiver<bool>> = None;

    debug!(peer = %remote, "Request stream opened");

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,

            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else { break };
                let outcome = handle_frame(
                    &ctx,
                    &remote,
                    frame,
                    &mut writer,
                    &mut events,
                    &mut room,
                    &mut participant,
                    &mut answered,
                    inserted,
                )
                .await;
                match outcome {
                    Ok(Some(watch)) => offline_watch = Some(watch),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %remote, error = %e, "Request stream error, resetting");
                        break;
                    }
                }
            }

            event = next_session_event(&mut events) => {
                match event {
                    SessionEvent::StateChanged(RTCPeerConnectionState::Connected) => {
                        if let (Some(r), Some(p)) = (room.as_ref(), participant.as_ref()) {
                            if !inserted {
                                r.insert_participant(Arc::clone(p)).await;
                                ctx.registry.gauges().viewers.inc();
                                inserted = true;
                            }
                        }
                    }
                    SessionEvent::StateChanged(
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed,
                    ) => {
                        if let Some(p) = participant.take() {
                            info!(peer = %remote, session = %p.session_id, "Viewer session lost");
                            if let Some(r) = room.as_ref() {
                                r.remove_participant(p.id).await;
                            }
                            p.close().await;
                            if inserted {
                                ctx.registry.gauges().viewers.dec();
                            }
                        }
                        // Back to square one; the viewer may re-request with
                        // its session id on this same stream.
                        events = None;
                        room = None;
                        offline_watch = None;
                        inserted = false;
                        answered = false;
                    }
                    SessionEvent::StateChanged(_) => {}
                    SessionEvent::LocalCandidate(candidate) => {
                        let frame = Frame::new(FramePayload::IceCandidate(candidate));
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            debug!(peer = %remote, error = %e, "Candidate write failed");
                            break;
                        }
                    }
                    SessionEvent::Track(_) | SessionEvent::DataChannel(_) => {
                        debug!(peer = %remote, "Ignoring inbound media on outbound session");
                    }
                }
            }

            () = room_went_offline(&mut offline_watch) => {
                if let Some(r) = room.take() {
                    info!(room = %r.name, peer = %remote, "Room went offline mid-session");
                    let frame = Frame::new(FramePayload::RequestStreamOffline {
                        name: r.name.clone(),
                    });
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(peer = %remote, error = %e, "Offline notification failed");
                    }
                    if let Some(p) = participant.take() {
                        r.remove_participant(p.id).await;
                        p.close().await;
                        if inserted {
                            ctx.registry.gauges().viewers.dec();
                        }
                    }
                }
                events = None;
                offline_watch = None;
                inserted = false;
                answered = false;
            }
        }
    }

    // Stream gone. A healthy media session keeps its viewer; everything else
    // is torn down here.
    if let Some(p) = participant.take() {
        if inserted && p.session.is_connected() && !ctx.cancel.is_cancelled() {
            info!(peer = %remote, session = %p.session_id, "Request stream broken, continuing to serve");
            if let (Some(r), Some(ev)) = (room.clone(), events.take()) {
                spawn_detached_monitor(ctx.clone(), r, p, ev);
            }
        } else {
            if let Some(r) = room.as_ref() {
                r.remove_participant(p.id).await;
            }
            p.close().await;
            if inserted {
                ctx.registry.gauges().viewers.dec();
            }
        }
    }
    debug!(peer = %remote, "Request stream closed");
}

/// Resolve the room a viewer asked for: a local online room serves directly;
/// a room owned elsewhere is fetched into a mirror first.
async fn resolve_serving_room(ctx: &HandlerContext, name: &str) -> Option<Arc<Room>> {
    if let Some(room) = ctx.registry.get_by_name(name).await {
        if room.is_online().await {
            return Some(room);
        }
        if room.owner == ctx.registry.local_peer_id() {
            return None;
        }
        // Offline mirror: fall through and re-fetch from the owner.
    }

    let owner = ctx.registry.resolve_owner(name).await?;
    if owner == ctx.registry.local_peer_id() {
        return None;
    }
    match super::fetch::ensure_mirror(ctx, owner, name).await {
        Ok(room) => Some(room),
        Err(e) => {
            warn!(room = %name, owner = %owner, error = %e, "Fetch from owner failed");
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame<W>(
    ctx: &HandlerContext,
    remote: &PeerId,
    frame: Frame,
    writer: &mut W,
    events: &mut Option<mpsc::Receiver<SessionEvent>>,
    room: &mut Option<Arc<Room>>,
    participant: &mut Option<Arc<Participant>>,
    answered: &mut bool,
    inserted: bool,
) -> Result<Option<watch::Receiver<bool>>, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let state = if participant.is_none() {
        "init"
    } else if inserted {
        "served"
    } else {
        "session-assigned"
    };

    match frame.payload {
        FramePayload::RequestStreamRoom { name, session_id } if participant.is_none() => {
            // An absent or empty id gets a fresh monotonic one; a previous
            // id survives reconnects untouched.
            let session_id = session_id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| Uuid::now_v7().to_string());

            write_frame(
                writer,
                &Frame::new(FramePayload::SessionAssigned {
                    session_id: session_id.clone(),
                    name: name.clone(),
                }),
            )
            .await?;

            let Some(serving) = resolve_serving_room(ctx, &name).await else {
                info!(room = %name, peer = %remote, "Requested room is offline");
                write_frame(
                    writer,
                    &Frame::new(FramePayload::RequestStreamOffline { name }),
                )
                .await?;
                return Ok(None);
            };

            let (session, session_events) =
                MediaSession::new(ctx.media.api(), ctx.media.rtc_config()).await?;
            let control_channel = session.create_control_channel("control").await?;

            let codecs = serving.negotiated_codecs().await;
            let audio_track = session
                .add_outbound_track(
                    codecs.audio.unwrap_or_else(media::opus_capability),
                    "audio",
                    &format!("stream-{name}"),
                )
                .await?;
            let video_track = session
                .add_outbound_track(
                    codecs.video.unwrap_or_else(media::default_video_capability),
                    "video",
                    &format!("stream-{name}"),
                )
                .await?;

            let new_participant = Participant::new(
                session_id.clone(),
                *remote,
                Arc::clone(&session),
                audio_track,
                video_track,
                control_channel,
            );
            control::wire_viewer_channel(&serving, &new_participant);

            let offer = session.create_offer().await?;
            write_frame(
                writer,
                &Frame::new(FramePayload::Offer(SessionDescription { sdp: offer })),
            )
            .await?;

            info!(room = %name, peer = %remote, session = %session_id, "Viewer offered");
            let watch = serving.online_watch();
            *room = Some(serving);
            *participant = Some(new_participant);
            *events = Some(session_events);
            Ok(Some(watch))
        }

        FramePayload::Answer(desc) => {
            let Some(p) = participant.as_ref() else {
                return Err(ProtocolError::UnexpectedFrame {
                    kind: sr_proto::PayloadKind::Answer,
                    state,
                });
            };
            if *answered {
                return Err(ProtocolError::UnexpectedFrame {
                    kind: sr_proto::PayloadKind::Answer,
                    state,
                });
            }
            p.session.apply_answer(&desc.sdp).await?;
            *answered = true;
            Ok(None)
        }

        FramePayload::IceCandidate(candidate) => {
            if let Some(p) = participant.as_ref() {
                if let Err(e) = p.session.add_remote_candidate(candidate).await {
                    warn!(peer = %remote, error = %e, "Remote candidate rejected");
                }
            }
            Ok(None)
        }

        payload => Err(ProtocolError::UnexpectedFrame {
            kind: payload.kind(),
            state,
        }),
    }
}

async fn room_went_offline(offline_watch: &mut Option<watch::Receiver<bool>>) {
    match offline_watch {
        Some(rx) => loop {
            if !*rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

/// Finish a surviving participant's lifecycle after its request stream died.
fn spawn_detached_monitor(
    ctx: HandlerContext,
    room: Arc<Room>,
    participant: Arc<Participant>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                maybe = events.recv() => {
                    match maybe {
                        Some(SessionEvent::StateChanged(
                            RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Closed,
                        ))
                        | None => break,
                        Some(_) => {}
                    }
                }
            }
        }
        room.remove_participant(participant.id).await;
        participant.close().await;
        ctx.registry.gauges().viewers.dec();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_proto::Framed;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::protocol::test_support::test_context;

    fn viewer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    #[tokio::test]
    async fn request_against_offline_room_gets_session_then_offline() {
        let ctx = test_context().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _handler = tokio::spawn(serve(ctx.clone(), viewer(), server.compat()));

        let mut framed = Framed::new(client.compat());
        framed
            .send(&Frame::new(FramePayload::RequestStreamRoom {
                name: "bravo".into(),
                session_id: None,
            }))
            .await
            .unwrap();

        let assigned = framed.read().await.unwrap().unwrap();
        let FramePayload::SessionAssigned { session_id, name } = assigned.payload else {
            panic!("expected session-assigned, got {:?}", assigned.payload);
        };
        assert_eq!(name, "bravo");
        assert!(!session_id.is_empty());

        let offline = framed.read().await.unwrap().unwrap();
        assert_eq!(
            offline.payload,
            FramePayload::RequestStreamOffline {
                name: "bravo".into()
            }
        );

        // No participant, no room record.
        assert!(ctx.registry.get_by_name("bravo").await.is_none());
    }

    #[tokio::test]
    async fn presented_session_id_is_echoed_for_reconnect() {
        let ctx = test_context().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _handler = tokio::spawn(serve(ctx.clone(), viewer(), server.compat()));

        let mut framed = Framed::new(client.compat());
        framed
            .send(&Frame::new(FramePayload::RequestStreamRoom {
                name: "bravo".into(),
                session_id: Some("0190-resume".into()),
            }))
            .await
            .unwrap();

        let assigned = framed.read().await.unwrap().unwrap();
        assert_eq!(
            assigned.payload,
            FramePayload::SessionAssigned {
                session_id: "0190-resume".into(),
                name: "bravo".into(),
            }
        );
    }

    #[tokio::test]
    async fn online_room_is_offered_with_a_control_channel() {
        let ctx = test_context().await;

        // Bring a local room online with a real inbound session.
        let room = ctx.registry.bind_push_room("alpha").await.unwrap();
        let (inbound, _inbound_events) =
            MediaSession::new(ctx.media.api(), ctx.media.rtc_config())
                .await
                .unwrap();
        room.set_inbound(inbound).await;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let _handler = tokio::spawn(serve(ctx.clone(), viewer(), server.compat()));

        let mut framed = Framed::new(client.compat());
        framed
            .send(&Frame::new(FramePayload::RequestStreamRoom {
                name: "alpha".into(),
                session_id: None,
            }))
            .await
            .unwrap();

        let assigned = framed.read().await.unwrap().unwrap();
        assert!(matches!(
            assigned.payload,
            FramePayload::SessionAssigned { .. }
        ));

        // The offer must carry audio, video and the data channel m-lines.
        let offer = framed.read().await.unwrap().unwrap();
        let FramePayload::Offer(desc) = offer.payload else {
            panic!("expected offer, got {:?}", offer.payload);
        };
        assert!(desc.sdp.contains("m=audio"));
        assert!(desc.sdp.contains("m=video"));
        assert!(desc.sdp.contains("m=application"));

        // Not connected yet: the participant is not in the room.
        assert_eq!(room.participant_count().await, 0);
    }
}
