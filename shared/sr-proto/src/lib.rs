//! Stream Relay Wire Schema
//!
//! Shared message definitions consumed by every mesh participant: relays,
//! producers and viewers. Covers the framed signalling protocol carried over
//! mesh streams, the gossip topic payloads, and the control-channel envelope
//! exchanged over WebRTC data channels.

pub mod codec;
pub mod control;
pub mod frame;
pub mod topics;

pub use codec::{read_frame, write_frame, CodecError, Framed, MAX_FRAME_LEN};
pub use control::{ControlEnvelope, CONTROL_KIND_CONTROLLER_INPUT, CONTROL_KIND_INPUT};
pub use frame::{
    Frame, FramePayload, IceCandidate, LatencyTracker, PayloadKind, RejectReason,
    SessionDescription,
};
pub use topics::{
    RelayMetricsMessage, RoomClaim, RoomStateMessage, TOPIC_RELAY_METRICS, TOPIC_ROOM_STATE,
};

/// Protocol id for producer push streams (producer → owning relay).
pub const PUSH_PROTOCOL: &str = "/stream-push/1";

/// Protocol id for viewer/relay request streams (requester → owning relay).
pub const REQUEST_PROTOCOL: &str = "/stream-request/1";
