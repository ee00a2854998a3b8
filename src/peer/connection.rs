//! Media endpoint over the WebRTC stack
//!
//! [`MediaEndpoint`] is the seam between session coordination and the
//! transport: the coordinator drives SDP and candidate exchange through it
//! and consumes its event stream. [`RtcEndpoint`] is the production
//! implementation over `webrtc-rs`.

use crate::config::CoordinatorConfig;
use crate::peer::media::{LocalStream, RemoteStream};
use crate::signaling::protocol::{IceCandidate, SessionDescription, SessionId};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// Transport-level state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by an endpoint while a session runs
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A local ICE candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// The transport state changed
    StateChanged(EndpointState),
    /// Remote media arrived
    RemoteStream(RemoteStream),
}

/// One peer connection's negotiation surface
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Attach (or replace) the local media stream. Idempotent.
    async fn attach_local_stream(&self, stream: LocalStream) -> Result<()>;

    /// Create a local offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer and produce the local answer
    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer to a pending local offer
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate. Unusable candidates are logged and
    /// dropped, never an error.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Close the endpoint. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Take the endpoint's event receiver. Yields `Some` exactly once.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>>;
}

/// Creates endpoints for new sessions
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create_endpoint(&self, session_id: &SessionId) -> Result<Arc<dyn MediaEndpoint>>;
}

/// WebRTC endpoint backed by `webrtc-rs`
pub struct RtcEndpoint {
    session_id: SessionId,
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    media_attached: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
    closed: AtomicBool,
}

impl RtcEndpoint {
    pub async fn new(session_id: SessionId, ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        let candidate_session = session_id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let session_id = candidate_session.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(session_id = %session_id, "ICE candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(EndpointEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, "Failed to serialize local candidate: {}", e);
                    }
                }
            })
        }));

        let state_tx = tx.clone();
        let state_session = session_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                let session_id = state_session.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::New => EndpointState::New,
                        RTCPeerConnectionState::Connecting => EndpointState::Connecting,
                        RTCPeerConnectionState::Connected => EndpointState::Connected,
                        RTCPeerConnectionState::Disconnected => EndpointState::Disconnected,
                        RTCPeerConnectionState::Failed => EndpointState::Failed,
                        RTCPeerConnectionState::Closed => EndpointState::Closed,
                        _ => return,
                    };
                    debug!(session_id = %session_id, state = ?mapped, "Endpoint state changed");
                    let _ = tx.send(EndpointEvent::StateChanged(mapped));
                })
            },
        ));

        let track_tx = tx.clone();
        let track_session = session_id.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            let session_id = track_session.clone();
            Box::pin(async move {
                debug!(
                    session_id = %session_id,
                    kind = ?track.kind(),
                    "Remote track arrived"
                );
                let stream = RemoteStream {
                    session_id,
                    stream_id: track.stream_id(),
                    tracks: vec![track],
                };
                let _ = tx.send(EndpointEvent::RemoteStream(stream));
            })
        }));

        Ok(Self {
            session_id,
            peer_connection,
            senders: Mutex::new(Vec::new()),
            media_attached: AtomicBool::new(false),
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    fn require_media(&self) -> Result<()> {
        if self.media_attached.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MediaNegotiation(
                "no local media stream attached".to_string(),
            ))
        }
    }

    async fn local_description(&self) -> Result<RTCSessionDescription> {
        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::MediaNegotiation("no local description after setting it".to_string())
            })
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn attach_local_stream(&self, stream: LocalStream) -> Result<()> {
        let mut senders = self.senders.lock().await;

        // Replace any previously attached stream
        for sender in senders.drain(..) {
            if let Err(e) = self.peer_connection.remove_track(&sender).await {
                warn!(session_id = %self.session_id, "Failed to remove stale track: {}", e);
            }
        }

        for track in stream.tracks() {
            let sender = self
                .peer_connection
                .add_track(track)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to add local track: {}", e)))?;
            senders.push(sender);
        }

        self.media_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.require_media()?;

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::MediaNegotiation(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::MediaNegotiation(format!("Failed to set local offer: {}", e)))?;

        let desc = self.local_description().await?;
        debug!(session_id = %self.session_id, "Created local offer");
        Ok(SessionDescription::offer(desc.sdp))
    }

    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        self.require_media()?;

        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| Error::IncompatibleDescription(format!("Invalid remote offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| {
                Error::IncompatibleDescription(format!("Failed to apply remote offer: {}", e))
            })?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::MediaNegotiation(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::MediaNegotiation(format!("Failed to set local answer: {}", e)))?;

        let desc = self.local_description().await?;
        debug!(session_id = %self.session_id, "Created local answer");
        Ok(SessionDescription::answer(desc.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| Error::IncompatibleDescription(format!("Invalid remote answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| {
                Error::IncompatibleDescription(format!("Failed to apply remote answer: {}", e))
            })?;

        debug!(session_id = %self.session_id, "Applied remote answer");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
            warn!(
                session_id = %self.session_id,
                "Dropping ICE candidate that could not be applied: {}", e
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close peer connection: {}", e)))
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.events.lock().await.take()
    }
}

/// Factory producing [`RtcEndpoint`]s configured with the coordinator's
/// STUN/TURN servers
#[derive(Clone)]
pub struct RtcEndpointFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcEndpointFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create_endpoint(&self, session_id: &SessionId) -> Result<Arc<dyn MediaEndpoint>> {
        let endpoint = RtcEndpoint::new(session_id.clone(), self.ice_servers.clone()).await?;
        Ok(Arc::new(endpoint))
    }
}
