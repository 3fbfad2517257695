//! Signalling Frames
//!
//! Every message on a push or request stream is a [`Frame`]: a small header
//! naming the payload kind (kept as a string on the wire for
//! interoperability) plus one payload variant. In Rust the payload is the
//! closed sum type [`FramePayload`]; encode/decode map the wire string onto
//! the enum bijectively and reject unknown kinds.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Optional latency probe carried in a frame header.
///
/// A sender stamps `sent_at_ms` with its wall clock; the receiver echoes the
/// `sequence_id` back so round-trip time can be attributed to a specific
/// frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyTracker {
    /// Sender-chosen sequence number.
    pub sequence_id: u64,
    /// Sender wall clock, unix milliseconds.
    pub sent_at_ms: i64,
}

/// Why a push handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// The room name is owned by a different relay.
    NotOwner,
    /// The room already has a live producer.
    AlreadyOnline,
}

/// A session description offer or answer, SDP carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// An ICE candidate in the standard JSON shape.
///
/// Candidates may arrive before the corresponding remote description; the
/// receiver buffers them rather than rejecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The payload kinds understood by the signalling protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    PushStreamRoom,
    PushStreamOk,
    PushStreamRejected,
    RequestStreamRoom,
    SessionAssigned,
    RequestStreamOffline,
    Offer,
    Answer,
    IceCandidate,
}

impl PayloadKind {
    /// The wire string for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PushStreamRoom => "push-stream-room",
            Self::PushStreamOk => "push-stream-ok",
            Self::PushStreamRejected => "push-stream-rejected",
            Self::RequestStreamRoom => "request-stream-room",
            Self::SessionAssigned => "session-assigned",
            Self::RequestStreamOffline => "request-stream-offline",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Parse a wire string. Unknown kinds are `None`; callers turn that into
    /// a protocol error rather than ignoring the frame.
    pub fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "push-stream-room" => Self::PushStreamRoom,
            "push-stream-ok" => Self::PushStreamOk,
            "push-stream-rejected" => Self::PushStreamRejected,
            "request-stream-room" => Self::RequestStreamRoom,
            "session-assigned" => Self::SessionAssigned,
            "request-stream-offline" => Self::RequestStreamOffline,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice-candidate" => Self::IceCandidate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame payload. Exactly one variant is valid per header kind.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Producer binds a room name on the owning relay.
    PushStreamRoom { name: String },
    /// Relay accepted the push for `name`.
    PushStreamOk { name: String },
    /// Relay refused the push.
    PushStreamRejected { name: String, reason: RejectReason },
    /// Viewer (or downstream relay) requests a room. An empty/absent
    /// `session_id` asks the relay to assign one; a previous id resumes the
    /// same session after reconnect.
    RequestStreamRoom {
        name: String,
        session_id: Option<String>,
    },
    /// Relay assigned (or confirmed) the session id for this requester.
    SessionAssigned { session_id: String, name: String },
    /// The room is unknown, offline, or not served by this relay.
    RequestStreamOffline { name: String },
    /// SDP offer.
    Offer(SessionDescription),
    /// SDP answer.
    Answer(SessionDescription),
    /// Trickled ICE candidate.
    IceCandidate(IceCandidate),
}

impl FramePayload {
    /// The header kind this payload serialises under.
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::PushStreamRoom { .. } => PayloadKind::PushStreamRoom,
            Self::PushStreamOk { .. } => PayloadKind::PushStreamOk,
            Self::PushStreamRejected { .. } => PayloadKind::PushStreamRejected,
            Self::RequestStreamRoom { .. } => PayloadKind::RequestStreamRoom,
            Self::SessionAssigned { .. } => PayloadKind::SessionAssigned,
            Self::RequestStreamOffline { .. } => PayloadKind::RequestStreamOffline,
            Self::Offer(_) => PayloadKind::Offer,
            Self::Answer(_) => PayloadKind::Answer,
            Self::IceCandidate(_) => PayloadKind::IceCandidate,
        }
    }
}

/// A complete signalling frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Optional latency probe.
    pub latency: Option<LatencyTracker>,
    /// The payload; its kind is written into the wire header.
    pub payload: FramePayload,
}

impl Frame {
    /// Frame a payload with no latency probe.
    pub const fn new(payload: FramePayload) -> Self {
        Self {
            latency: None,
            payload,
        }
    }

    /// Frame a payload with a latency probe attached.
    pub const fn with_latency(payload: FramePayload, latency: LatencyTracker) -> Self {
        Self {
            latency: Some(latency),
            payload,
        }
    }

    /// The payload kind.
    pub const fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }
}

// Wire shape: { "header": { "payload_kind": "...", "latency": ... }, "payload": {...} }

#[derive(Serialize, Deserialize)]
struct WireHeader {
    payload_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latency: Option<LatencyTracker>,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    header: WireHeader,
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct NamedBody {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct RejectedBody {
    name: String,
    reason: RejectReason,
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AssignedBody {
    session_id: String,
    name: String,
}

impl Frame {
    /// Serialise to the wire JSON document.
    pub fn to_wire_json(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match &self.payload {
            FramePayload::PushStreamRoom { name }
            | FramePayload::PushStreamOk { name }
            | FramePayload::RequestStreamOffline { name } => {
                serde_json::to_value(NamedBody { name: name.clone() })
            }
            FramePayload::PushStreamRejected { name, reason } => {
                serde_json::to_value(RejectedBody {
                    name: name.clone(),
                    reason: *reason,
                })
            }
            FramePayload::RequestStreamRoom { name, session_id } => {
                serde_json::to_value(RequestBody {
                    name: name.clone(),
                    session_id: session_id.clone(),
                })
            }
            FramePayload::SessionAssigned { session_id, name } => {
                serde_json::to_value(AssignedBody {
                    session_id: session_id.clone(),
                    name: name.clone(),
                })
            }
            FramePayload::Offer(desc) | FramePayload::Answer(desc) => serde_json::to_value(desc),
            FramePayload::IceCandidate(c) => serde_json::to_value(c),
        }?;

        let wire = WireFrame {
            header: WireHeader {
                payload_kind: self.kind().as_str().to_owned(),
                latency: self.latency.clone(),
            },
            payload,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse from the wire JSON document. Unknown payload kinds and payload
    /// bodies that do not match their declared kind are errors.
    pub fn from_wire_json(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireFrame = serde_json::from_slice(bytes)?;
        let kind = PayloadKind::from_wire(&wire.header.payload_kind)
            .ok_or_else(|| CodecError::UnknownPayloadKind(wire.header.payload_kind.clone()))?;

        let payload = match kind {
            PayloadKind::PushStreamRoom => {
                let body: NamedBody = serde_json::from_value(wire.payload)?;
                FramePayload::PushStreamRoom { name: body.name }
            }
            PayloadKind::PushStreamOk => {
                let body: NamedBody = serde_json::from_value(wire.payload)?;
                FramePayload::PushStreamOk { name: body.name }
            }
            PayloadKind::PushStreamRejected => {
                let body: RejectedBody = serde_json::from_value(wire.payload)?;
                FramePayload::PushStreamRejected {
                    name: body.name,
                    reason: body.reason,
                }
            }
            PayloadKind::RequestStreamRoom => {
                let body: RequestBody = serde_json::from_value(wire.payload)?;
                FramePayload::RequestStreamRoom {
                    name: body.name,
                    session_id: body.session_id,
                }
            }
            PayloadKind::SessionAssigned => {
                let body: AssignedBody = serde_json::from_value(wire.payload)?;
                FramePayload::SessionAssigned {
                    session_id: body.session_id,
                    name: body.name,
                }
            }
            PayloadKind::RequestStreamOffline => {
                let body: NamedBody = serde_json::from_value(wire.payload)?;
                FramePayload::RequestStreamOffline { name: body.name }
            }
            PayloadKind::Offer => FramePayload::Offer(serde_json::from_value(wire.payload)?),
            PayloadKind::Answer => FramePayload::Answer(serde_json::from_value(wire.payload)?),
            PayloadKind::IceCandidate => {
                FramePayload::IceCandidate(serde_json::from_value(wire.payload)?)
            }
        };

        Ok(Self {
            latency: wire.header.latency,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<FramePayload> {
        vec![
            FramePayload::PushStreamRoom {
                name: "alpha".into(),
            },
            FramePayload::PushStreamOk {
                name: "alpha".into(),
            },
            FramePayload::PushStreamRejected {
                name: "alpha".into(),
                reason: RejectReason::AlreadyOnline,
            },
            FramePayload::RequestStreamRoom {
                name: "bravo".into(),
                session_id: None,
            },
            FramePayload::RequestStreamRoom {
                name: "bravo".into(),
                session_id: Some("0190-abc".into()),
            },
            FramePayload::SessionAssigned {
                session_id: "0190-abc".into(),
                name: "bravo".into(),
            },
            FramePayload::RequestStreamOffline {
                name: "bravo".into(),
            },
            FramePayload::Offer(SessionDescription {
                sdp: "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n".into(),
            }),
            FramePayload::Answer(SessionDescription {
                sdp: "v=0\r\n".into(),
            }),
            FramePayload::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        ]
    }

    #[test]
    fn round_trips_every_variant() {
        for payload in all_variants() {
            let frame = Frame::new(payload);
            let bytes = frame.to_wire_json().unwrap();
            let back = Frame::from_wire_json(&bytes).unwrap();
            assert_eq!(frame, back);
        }
    }

    #[test]
    fn latency_tracker_survives_round_trip() {
        let frame = Frame::with_latency(
            FramePayload::PushStreamOk {
                name: "alpha".into(),
            },
            LatencyTracker {
                sequence_id: 42,
                sent_at_ms: 1_700_000_000_000,
            },
        );
        let back = Frame::from_wire_json(&frame.to_wire_json().unwrap()).unwrap();
        assert_eq!(back.latency.as_ref().unwrap().sequence_id, 42);
        assert_eq!(frame, back);
    }

    #[test]
    fn header_kind_matches_payload_on_the_wire() {
        let frame = Frame::new(FramePayload::Offer(SessionDescription { sdp: "v=0".into() }));
        let bytes = frame.to_wire_json().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["header"]["payload_kind"], "offer");
        assert_eq!(doc["payload"]["sdp"], "v=0");
    }

    #[test]
    fn unknown_payload_kind_is_an_error() {
        let doc = br#"{"header":{"payload_kind":"warp-stream"},"payload":{}}"#;
        let err = Frame::from_wire_json(doc).unwrap_err();
        assert!(matches!(err, CodecError::UnknownPayloadKind(k) if k == "warp-stream"));
    }

    #[test]
    fn mismatched_body_is_an_error() {
        // Declared as session-assigned but the body is missing session_id.
        let doc = br#"{"header":{"payload_kind":"session-assigned"},"payload":{"name":"x"}}"#;
        assert!(Frame::from_wire_json(doc).is_err());
    }
}
