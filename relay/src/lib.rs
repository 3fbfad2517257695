//! Stream Relay
//!
//! Peer-to-peer live media relay node. A producer pushes one audio/video
//! stream plus a control channel into its room's owning relay; viewers pull
//! the stream through the same relay or any neighbour, which fetches remote
//! rooms on their behalf. Relays form a mesh and gossip room ownership.

pub mod config;
pub mod identity;
pub mod media;
pub mod mesh;
pub mod peerstore;
pub mod protocol;
pub mod relay;
pub mod rooms;
pub mod telemetry;
