//! Protocol Handler Errors

use thiserror::Error;

use sr_proto::{CodecError, PayloadKind};

use crate::media::error::SessionError;
use crate::mesh::MeshError;

/// Errors from the push / request signalling conversations. Handlers recover
/// at the per-frame boundary; anything escaping a handler resets its stream
/// and never crosses the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed frame, unknown payload kind, stream IO failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A valid frame arrived in a state that does not accept it.
    #[error("unexpected {kind} frame in state {state}")]
    UnexpectedFrame {
        kind: PayloadKind,
        state: &'static str,
    },

    /// Media session creation or signalling failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The mesh could not reach the remote relay.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// A remote room could not be brought online for serving.
    #[error("room unavailable: {0}")]
    Unavailable(String),
}
