//! Stream Protocols
//!
//! The two framed signalling conversations carried over mesh streams:
//! `/stream-push/1` (producer → owning relay) and `/stream-request/1`
//! (viewer or downstream relay → owning relay). Media flows out of band
//! over the negotiated media sessions; these streams carry only frames.
//!
//! Handlers are generic over the byte stream so the state machines run
//! unchanged over an in-memory pipe in tests.

pub mod error;
pub mod fetch;
pub mod push;
pub mod request;

use std::sync::Arc;

use futures::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sr_proto::Frame;

pub use error::ProtocolError;

use crate::media::{MediaStack, SessionEvent};
use crate::mesh::MeshHandle;
use crate::peerstore::Peerstore;
use crate::rooms::RoomRegistry;

/// Everything a protocol handler needs, threaded through construction.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<RoomRegistry>,
    pub media: Arc<MediaStack>,
    pub mesh: MeshHandle,
    pub peerstore: Arc<Peerstore>,
    pub cancel: CancellationToken,
}

/// Pump frames off the read half into a channel. Frame reads span multiple
/// awaits, so they live in their own task rather than racing inside a
/// `select!`. The pump ends on EOF or a codec error (which resets the
/// stream); the handler observes either as a closed channel.
pub(crate) fn spawn_frame_reader<R>(mut reader: R) -> mpsc::Receiver<Frame>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            match sr_proto::read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Protocol stream read failed, resetting");
                    break;
                }
            }
        }
    });
    rx
}

/// Await the next session event, or forever when no session exists yet.
/// Handlers hold their session alive, so a closed channel only happens
/// during teardown; parking on it is harmless.
pub(crate) async fn next_session_event(
    events: &mut Option<mpsc::Receiver<SessionEvent>>,
) -> SessionEvent {
    match events {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;
    use crate::telemetry::RelayGauges;

    /// A handler context with a real media engine but no mesh behind it.
    pub(crate) async fn test_context() -> HandlerContext {
        let dir = tempfile::tempdir().unwrap();
        let media = Arc::new(
            crate::media::build(&Config::default_for_test(dir.path()))
                .await
                .unwrap(),
        );
        let (announce_tx, _announce_rx) = mpsc::channel(32);
        let registry = RoomRegistry::new(
            libp2p::PeerId::random(),
            announce_tx,
            RelayGauges::new(),
        );
        HandlerContext {
            registry,
            media,
            mesh: MeshHandle::detached(),
            peerstore: Arc::new(Peerstore::new()),
            cancel: CancellationToken::new(),
        }
    }
}
