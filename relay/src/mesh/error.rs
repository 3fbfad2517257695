//! Mesh Layer Errors

use thiserror::Error;

/// Errors from the mesh transport and gossip layer.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport could not be assembled.
    #[error("transport setup failed: {0}")]
    Transport(String),

    /// A listener could not bind. Fatal at startup.
    #[error("listen failed on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    /// Dial failed; the peer is unreachable from here.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Publishing to a gossip topic failed.
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Opening a protocol stream to a peer failed.
    #[error("stream open failed: {0}")]
    StreamOpen(String),

    /// The mesh task is gone.
    #[error("mesh service stopped")]
    ServiceStopped,
}
