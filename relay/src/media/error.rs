//! Media Session Errors

use thiserror::Error;

/// Errors from media engine and session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Underlying media engine failure.
    #[error("webrtc error: {0}")]
    WebRtc(String),

    /// Malformed or out-of-order signalling input.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Binding the media UDP socket or port range failed.
    #[error("media transport error: {0}")]
    Transport(String),
}

impl From<webrtc::Error> for SessionError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
