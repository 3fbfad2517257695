//! Relay Configuration
//!
//! Parsed from command-line flags at startup and threaded through the
//! constructors; nothing here is re-read at runtime.

use std::path::{Path, PathBuf};

use clap::Parser;

/// Command-line interface of the relay binary.
#[derive(Parser, Debug)]
#[command(name = "sr-relay")]
#[command(about = "Peer-to-peer live media relay node", long_about = None)]
pub struct Cli {
    /// Mesh listen port (TCP; WebSocket listens on port + 1, QUIC on the
    /// same UDP port).
    #[arg(long, default_value_t = 4001)]
    pub port: u16,

    /// Enable the Prometheus metrics endpoint.
    #[arg(long, default_value_t = false)]
    pub metrics: bool,

    /// Port for the metrics endpoint.
    #[arg(long, default_value_t = 8585)]
    pub metrics_port: u16,

    /// Directory for the identity key and peerstore snapshot.
    #[arg(long, default_value = ".sr-relay")]
    pub persist_dir: PathBuf,

    /// Discard any persisted identity and generate a fresh one.
    #[arg(long, default_value_t = false)]
    pub regen_identity: bool,

    /// Enable verbose (debug) logging.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// First UDP port WebRTC may bind for media (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    pub webrtc_udp_start: u16,

    /// Last UDP port WebRTC may bind for media (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    pub webrtc_udp_end: u16,

    /// Multiplex all WebRTC media over a single UDP port (0 = disabled).
    #[arg(long, default_value_t = 0)]
    pub udp_mux_port: u16,

    /// Public IP advertised in ICE candidates when behind 1:1 NAT.
    #[arg(long)]
    pub nat_1to1_ip: Option<String>,
}

/// Runtime configuration derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Mesh listen port.
    pub port: u16,
    /// Whether the metrics endpoint is served.
    pub metrics_enabled: bool,
    /// Metrics endpoint port.
    pub metrics_port: u16,
    /// Persistence directory.
    pub persist_dir: PathBuf,
    /// Force identity regeneration.
    pub regen_identity: bool,
    /// Verbose logging.
    pub verbose: bool,
    /// WebRTC ephemeral UDP range start (0 = unrestricted).
    pub webrtc_udp_start: u16,
    /// WebRTC ephemeral UDP range end (0 = unrestricted).
    pub webrtc_udp_end: u16,
    /// Single-port UDP mux for media (0 = disabled).
    pub udp_mux_port: u16,
    /// 1:1 NAT public IP for ICE candidates.
    pub nat_1to1_ip: Option<String>,
}

impl Config {
    /// Build the runtime configuration from parsed flags.
    #[must_use]
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            port: cli.port,
            metrics_enabled: cli.metrics,
            metrics_port: cli.metrics_port,
            persist_dir: cli.persist_dir.clone(),
            regen_identity: cli.regen_identity,
            verbose: cli.verbose,
            webrtc_udp_start: cli.webrtc_udp_start,
            webrtc_udp_end: cli.webrtc_udp_end,
            udp_mux_port: cli.udp_mux_port,
            nat_1to1_ip: cli.nat_1to1_ip.clone(),
        }
    }

    /// Path of the persisted identity key.
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.persist_dir.join("identity.key")
    }

    /// Path of the peerstore snapshot.
    #[must_use]
    pub fn peerstore_path(&self) -> PathBuf {
        self.persist_dir.join("peerstore.json")
    }

    /// Configuration for tests: ephemeral ports, persistence under `dir`.
    #[must_use]
    pub fn default_for_test(dir: &Path) -> Self {
        Self {
            port: 0,
            metrics_enabled: false,
            metrics_port: 0,
            persist_dir: dir.to_path_buf(),
            regen_identity: false,
            verbose: false,
            webrtc_udp_start: 0,
            webrtc_udp_end: 0,
            udp_mux_port: 0,
            nat_1to1_ip: None,
        }
    }
}
