//! WebRTC peer connection backed by the `webrtc` crate

use super::{LinkState, PeerEvent, PeerFactory, PeerLink, RemoteMedia};
use async_trait::async_trait;
use duet_core::{Error, IceCandidate, IceServer, Result, Role, SdpType, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`WebRtcPeerLink`]s with default codecs and interceptors
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        role: Role,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = WebRtcPeerLink::new(role, ice_servers, events).await?;
        Ok(Arc::new(link))
    }
}

/// Answering side of one provider session
///
/// Wraps a webrtc::RTCPeerConnection and reports candidates, gathering
/// completion, connectivity and remote tracks as [`PeerEvent`]s.
pub struct WebRtcPeerLink {
    role: Role,

    /// Actual WebRTC peer connection
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeerLink {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `role` - Role the connection renders, for logging
    /// * `ice_servers` - STUN/TURN servers handed out by the provider
    /// * `events` - Sink for everything the connection reports
    #[instrument(skip(ice_servers, events), fields(role = %role))]
    pub async fn new(
        role: Role,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        info!(ice_servers = ice_servers.len(), "Creating peer connection");

        // Create MediaEngine with default codecs (Opus, VP8/VP9/H.264)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Negotiation(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::Negotiation(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::Negotiation(format!("Failed to create peer connection: {}", e))
            })?);

        // Trickle: every local candidate goes out as soon as it is found
        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::CandidateDiscovered(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let gathering_tx = events.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(
            move |state: RTCIceGathererState| {
                let tx = gathering_tx.clone();
                Box::pin(async move {
                    debug!("ICE gathering state: {}", state);
                    if state == RTCIceGathererState::Complete {
                        let _ = tx.send(PeerEvent::GatheringComplete);
                    }
                })
            },
        ));

        let state_tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    let link_state = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    let _ = tx.send(PeerEvent::StateChanged(link_state));
                })
            },
        ));

        let track_tx = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                Box::pin(async move {
                    let media = RemoteMedia {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind: track.kind().to_string(),
                        track: Some(track),
                    };
                    debug!(track_id = %media.track_id, kind = %media.kind, "Remote track");
                    let _ = tx.send(PeerEvent::RemoteTrack(media));
                })
            },
        ));

        Ok(Self {
            role,
            peer_connection,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[allow(clippy::needless_update)]
fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.to_vec(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::Negotiation(
                "provider description is not an offer".to_string(),
            ));
        }

        let offer = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| Error::Negotiation(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        debug!(role = %self.role, "Applied provider offer and local answer");
        Ok(())
    }

    async fn local_answer(&self) -> Result<String> {
        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::Negotiation("No local description after setting answer".to_string())
            })?;
        Ok(local_desc.sdp)
    }

    async fn close(&self) -> Result<()> {
        info!(role = %self.role, "Closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::Transport(format!("Failed to close connection: {}", e)))
    }
}
