//! Control Channel Router
//!
//! Splices the producer's control channel to the viewers' channels in both
//! directions. The router inspects only the envelope fields it needs for
//! routing and forwards the original bytes verbatim; payloads stay opaque.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;

use sr_proto::{ControlEnvelope, CONTROL_KIND_CONTROLLER_INPUT, CONTROL_KIND_INPUT};

use super::room::{Participant, Room};

/// Where a control message goes.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// Producer → the viewer with this session id.
    ToParticipant(String),
    /// Viewer → producer.
    ToProducer,
    /// Unroutable; dropped with a log line.
    Drop,
}

/// Classify a message arriving on the producer's channel.
fn classify_from_producer(bytes: &[u8]) -> Route {
    let Ok(envelope) = ControlEnvelope::decode(bytes) else {
        return Route::Drop;
    };
    if envelope.kind == CONTROL_KIND_CONTROLLER_INPUT {
        match envelope.session_id {
            Some(session_id) => Route::ToParticipant(session_id),
            None => Route::Drop,
        }
    } else {
        Route::Drop
    }
}

/// Classify a message arriving on a viewer's channel.
fn classify_from_viewer(bytes: &[u8]) -> Route {
    match ControlEnvelope::decode(bytes) {
        Ok(envelope) if envelope.kind == CONTROL_KIND_INPUT => Route::ToProducer,
        _ => Route::Drop,
    }
}

/// Wire the producer's (or, for a mirror room, the upstream relay's) control
/// channel: controller feedback is routed to the targeted participant only.
pub fn wire_producer_channel(room: &Arc<Room>, channel: &Arc<RTCDataChannel>) {
    let room_weak = Arc::downgrade(room);
    channel.on_message(Box::new(move |msg| {
        let room_weak = room_weak.clone();
        Box::pin(async move {
            let Some(room) = room_weak.upgrade() else {
                return;
            };
            route_from_producer(&room, &msg.data).await;
        })
    }));
}

async fn route_from_producer(room: &Arc<Room>, data: &Bytes) {
    match classify_from_producer(data) {
        Route::ToParticipant(session_id) => {
            let Some(participant) = room.participant_by_session(&session_id).await else {
                debug!(room = %room.name, session = %session_id, "Feedback for unknown session");
                return;
            };
            if let Err(e) = participant.control.send(data).await {
                // A dead channel means the viewer is gone; drop them now
                // rather than waiting for the engine's state callback.
                warn!(
                    room = %room.name,
                    participant = %participant.id,
                    error = %e,
                    "Viewer control channel closed, removing participant"
                );
                if let Some(p) = room.remove_participant(participant.id).await {
                    p.close().await;
                }
            }
        }
        Route::ToProducer | Route::Drop => {
            debug!(room = %room.name, "Unroutable message on producer channel");
        }
    }
}

/// Wire one viewer's control channel: input events are forwarded verbatim to
/// the producer's channel.
pub fn wire_viewer_channel(room: &Arc<Room>, participant: &Arc<Participant>) {
    let room_weak = Arc::downgrade(room);
    let participant_id = participant.id;
    participant.control.on_message(Box::new(move |msg| {
        let room_weak = room_weak.clone();
        Box::pin(async move {
            let Some(room) = room_weak.upgrade() else {
                return;
            };
            match classify_from_viewer(&msg.data) {
                Route::ToProducer => {
                    let Some(producer) = room.control_channel().await else {
                        debug!(room = %room.name, "Input dropped, room has no control channel");
                        return;
                    };
                    if let Err(e) = producer.send(&msg.data).await {
                        // Producer channel loss surfaces through the inbound
                        // session's state callback; just log here.
                        warn!(room = %room.name, participant = %participant_id, error = %e, "Producer control channel write failed");
                    }
                }
                Route::ToParticipant(_) | Route::Drop => {
                    debug!(room = %room.name, participant = %participant_id, "Unroutable message on viewer channel");
                }
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_routes_to_the_named_session() {
        let raw = br#"{"kind":"controllerInput","session_id":"s-1","data":{"rumble":1.0}}"#;
        assert_eq!(
            classify_from_producer(raw),
            Route::ToParticipant("s-1".into())
        );
    }

    #[test]
    fn feedback_without_session_id_is_dropped() {
        let raw = br#"{"kind":"controllerInput","data":{}}"#;
        assert_eq!(classify_from_producer(raw), Route::Drop);
    }

    #[test]
    fn viewer_input_routes_to_producer() {
        let raw = br#"{"kind":"input","data":{"key":"W"}}"#;
        assert_eq!(classify_from_viewer(raw), Route::ToProducer);
    }

    #[test]
    fn unknown_kinds_and_garbage_are_dropped() {
        assert_eq!(classify_from_viewer(br#"{"kind":"telemetry"}"#), Route::Drop);
        assert_eq!(classify_from_viewer(b"not json"), Route::Drop);
        assert_eq!(classify_from_producer(br#"{"kind":"input"}"#), Route::Drop);
    }
}
