//! Media Session
//!
//! One peer connection (producer or viewer) plus its signalling glue. The
//! engine's callbacks are funnelled into a single typed event channel
//! consumed by the owning protocol handler, which keeps event ordering
//! explicit and makes cancellation a matter of dropping the receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use sr_proto::IceCandidate;

use super::error::SessionError;

/// Events a session surfaces to its owning handler.
pub enum SessionEvent {
    /// Connection state transition.
    StateChanged(RTCPeerConnectionState),
    /// The remote peer delivered a media track.
    Track(Arc<TrackRemote>),
    /// The remote peer opened a data channel.
    DataChannel(Arc<RTCDataChannel>),
    /// The engine gathered a local ICE candidate to trickle to the remote.
    LocalCandidate(IceCandidate),
}

/// Candidates received before the remote description is installed.
///
/// Flush happens exactly once, when the description lands; afterwards the
/// buffer waves candidates straight through.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    held: Vec<IceCandidate>,
    flushed: bool,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate. Returns it back when the buffer has already
    /// flushed and the caller should apply it directly.
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.flushed {
            Some(candidate)
        } else {
            self.held.push(candidate);
            None
        }
    }

    /// Drain the held candidates and latch the flush. Idempotent: a second
    /// call returns nothing.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.flushed = true;
        std::mem::take(&mut self.held)
    }

    /// Number of candidates currently held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub const fn is_flushed(&self) -> bool {
        self.flushed
    }
}

/// A peer connection with candidate sequencing and latched close.
pub struct MediaSession {
    pc: Arc<RTCPeerConnection>,
    pending: Mutex<CandidateBuffer>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MediaSession {
    /// Create a session and the event channel its owner consumes.
    pub async fn new(
        api: &API,
        config: RTCConfiguration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>), SessionError> {
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (tx, rx) = mpsc::channel(64);

        {
            let tx = tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(SessionEvent::StateChanged(state)).await;
                })
            }));
        }

        {
            let tx = tx.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(SessionEvent::Track(track)).await;
                })
            }));
        }

        {
            let tx = tx.clone();
            pc.on_data_channel(Box::new(move |channel| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(SessionEvent::DataChannel(channel)).await;
                })
            }));
        }

        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(SessionEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        Ok((
            Arc::new(Self {
                pc,
                pending: Mutex::new(CandidateBuffer::new()),
                closed: AtomicBool::new(false),
            }),
            rx,
        ))
    }

    /// Install a remote offer, flush held candidates, and produce the
    /// answer SDP (local description set).
    pub async fn apply_offer(&self, sdp: &str) -> Result<String, SessionError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        self.install_remote(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    /// Create an offer and set it as the local description.
    pub async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    /// Install a remote answer and flush held candidates.
    pub async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        self.install_remote(answer).await
    }

    async fn install_remote(&self, desc: RTCSessionDescription) -> Result<(), SessionError> {
        self.pc.set_remote_description(desc).await?;

        // Hold the buffer lock through the drain: a candidate arriving
        // mid-flush waits, then sees the flushed latch and applies directly.
        let mut pending = self.pending.lock().await;
        let held = pending.flush();
        let count = held.len();
        for candidate in held {
            if let Err(e) = self.pc.add_ice_candidate(to_init(candidate)).await {
                warn!(error = %e, "Buffered ICE candidate rejected");
            }
        }
        if count > 0 {
            debug!(count, "Flushed held ICE candidates");
        }
        Ok(())
    }

    /// Apply a remote candidate, buffering it while the remote description
    /// is not yet installed.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let direct = {
            let mut pending = self.pending.lock().await;
            pending.offer(candidate)
        };
        if let Some(candidate) = direct {
            self.pc.add_ice_candidate(to_init(candidate)).await?;
        }
        Ok(())
    }

    /// Attach a static outbound RTP track.
    pub async fn add_outbound_track(
        &self,
        capability: RTCRtpCodecCapability,
        id: &str,
        stream_id: &str,
    ) -> Result<Arc<TrackLocalStaticRTP>, SessionError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.to_owned(),
            stream_id.to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(track)
    }

    /// Create the ordered, retransmit-limited control channel offered to a
    /// viewer.
    pub async fn create_control_channel(
        &self,
        label: &str,
    ) -> Result<Arc<RTCDataChannel>, SessionError> {
        let channel = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(2),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(channel)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Whether the session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Latch the close. Returns `true` exactly once so cleanup cannot run
    /// twice.
    pub fn latch_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Close the peer connection.
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Peer connection close failed");
        }
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.1 {} typ host", 50000 + n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn candidates_are_held_until_flush() {
        let mut buf = CandidateBuffer::new();
        assert!(buf.offer(candidate(1)).is_none());
        assert!(buf.offer(candidate(2)).is_none());
        assert_eq!(buf.held(), 2);

        let flushed = buf.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut buf = CandidateBuffer::new();
        buf.offer(candidate(1));
        assert_eq!(buf.flush().len(), 1);
        assert!(buf.flush().is_empty());
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn flushing_an_empty_buffer_is_a_noop() {
        let mut buf = CandidateBuffer::new();
        assert!(buf.flush().is_empty());
        assert!(buf.is_flushed());
    }

    #[test]
    fn post_flush_candidates_pass_through() {
        let mut buf = CandidateBuffer::new();
        buf.flush();
        let c = candidate(3);
        assert_eq!(buf.offer(c.clone()), Some(c));
        assert_eq!(buf.held(), 0);
    }
}
