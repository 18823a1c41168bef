//! Peer connection abstraction
//!
//! The negotiator drives a [`PeerLink`] and listens to the [`PeerEvent`]s it
//! emits. [`connection::WebRtcPeerFactory`] builds real `webrtc` peer
//! connections; tests plug in simulated peers.

pub mod connection;

use async_trait::async_trait;
use duet_core::{IceCandidate, IceServer, Result, Role, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

pub use connection::{WebRtcPeerFactory, WebRtcPeerLink};

/// Connectivity reported by the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Incoming provider media track
#[derive(Clone)]
pub struct RemoteMedia {
    /// Track id from the remote SDP
    pub track_id: String,
    /// MediaStream id the track belongs to
    pub stream_id: String,
    /// "audio" or "video"
    pub kind: String,
    /// Underlying RTP track; `None` for simulated peers
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(
        track_id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            kind: kind.into(),
            track: None,
        }
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteMedia {
    fn eq(&self, other: &Self) -> bool {
        self.track_id == other.track_id
            && self.stream_id == other.stream_id
            && self.kind == other.kind
    }
}

/// Something a peer connection reports asynchronously
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was found; trickle it to the provider
    CandidateDiscovered(IceCandidate),
    /// Local ICE gathering reached "complete"
    GatheringComplete,
    /// Connectivity changed
    StateChanged(LinkState),
    /// Provider media arrived
    RemoteTrack(RemoteMedia),
}

/// One local peer connection, answering a provider offer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Apply the provider's offer, then create and apply a local answer
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()>;

    /// Current local answer SDP, including candidates gathered so far
    async fn local_answer(&self) -> Result<String>;

    /// Close the connection; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Builds peer links for negotiators
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a peer configured with `ice_servers` that reports into `events`
    async fn create(
        &self,
        role: Role,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}
