//! Room Registry Errors

use thiserror::Error;

/// State errors surfaced to remote peers as typed rejection frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The name is held by an online owner somewhere in the mesh.
    #[error("room name taken: {0}")]
    NameTaken(String),

    /// The name is owned by a different relay.
    #[error("not the owner of room {0}")]
    NotOwner(String),

    /// The room already has a live producer.
    #[error("room {0} is already online")]
    AlreadyOnline(String),
}
