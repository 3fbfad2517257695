//! Control-Channel Envelope
//!
//! Messages on the WebRTC data channels are routed, never interpreted: the
//! relay reads only the envelope fields it needs for routing and forwards the
//! original bytes verbatim.

use serde::{Deserialize, Serialize};

/// Viewer → producer input events (key presses, pointer motion, gamepad).
pub const CONTROL_KIND_INPUT: &str = "input";

/// Producer → one viewer controller feedback (rumble, LED state). The
/// envelope's `session_id` selects the target viewer.
pub const CONTROL_KIND_CONTROLLER_INPUT: &str = "controllerInput";

/// The routing envelope of a control-channel message.
///
/// `data` is opaque to the relay; producers and viewers agree on its shape
/// out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    /// Message kind; unknown kinds are dropped by the router with a log line.
    pub kind: String,
    /// Target session for producer → viewer messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ControlEnvelope {
    /// Decode just the envelope from raw data-channel bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode to data-channel bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_extracted_for_feedback_routing() {
        let raw = br#"{"kind":"controllerInput","session_id":"0190-abc","data":{"rumble":0.7}}"#;
        let env = ControlEnvelope::decode(raw).unwrap();
        assert_eq!(env.kind, CONTROL_KIND_CONTROLLER_INPUT);
        assert_eq!(env.session_id.as_deref(), Some("0190-abc"));
    }

    #[test]
    fn input_without_session_id_decodes() {
        let raw = br#"{"kind":"input","data":{"key":"W","down":true}}"#;
        let env = ControlEnvelope::decode(raw).unwrap();
        assert_eq!(env.kind, CONTROL_KIND_INPUT);
        assert!(env.session_id.is_none());
    }

    #[test]
    fn round_trip_preserves_opaque_data() {
        let env = ControlEnvelope {
            kind: CONTROL_KIND_INPUT.into(),
            session_id: None,
            data: serde_json::json!({"axes": [0.1, -0.4], "buttons": 3}),
        };
        let back = ControlEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(env, back);
    }
}
