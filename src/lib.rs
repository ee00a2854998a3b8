//! # peerlink
//!
//! WebRTC session coordinator for two-party calls signaled over a pub/sub
//! message broker.
//!
//! Peers exchange SDP offers, answers and trickled ICE candidates as JSON
//! envelopes on broker topics. The coordinator wires a signaling channel, a
//! local media source and a WebRTC endpoint factory together and drives each
//! session through a pure state machine, handling offer glare, early
//! candidate buffering, and broker reconnection.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  SessionCoordinator                    │
//! │                 (serial dispatch loop)                 │
//! └──────┬──────────────────┬───────────────────┬──────────┘
//!        │                  │                   │
//! ┌──────▼───────┐   ┌──────▼────────┐   ┌──────▼────────┐
//! │ Signaling    │   │ Session       │   │ Media         │
//! │ Channel      │   │ Machine       │   │ Endpoint      │
//! │ (broker ws)  │   │ (pure logic)  │   │ (webrtc-rs)   │
//! └──────────────┘   └───────────────┘   └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use peerlink::{CoordinatorConfig, Role, SessionCoordinator};
//! use std::sync::Arc;
//!
//! # async fn run() -> peerlink::Result<()> {
//! let config = CoordinatorConfig::new("wss://broker.example.com/signaling")
//!     .with_sender_id("alice");
//! let coordinator = SessionCoordinator::new(config)?;
//!
//! coordinator
//!     .on_remote_stream(Arc::new(|stream| {
//!         println!("remote media for session {}", stream.session_id);
//!     }))
//!     .await;
//!
//! coordinator.start(Role::Caller).await?;
//! // ... call in progress ...
//! coordinator.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{CoordinatorConfig, TurnServerConfig};
pub use coordinator::{
    RemoteStreamCallback, SessionCoordinator, SessionSnapshot, SessionStateCallback,
};
pub use error::{Error, Result};
pub use peer::{
    EndpointEvent, EndpointFactory, EndpointState, LocalStream, MediaEndpoint, MediaSource,
    RemoteStream, RtcEndpoint, RtcEndpointFactory, SampleMediaSource, StaticMediaSource,
};
pub use session::{Role, SessionState};
pub use signaling::{
    BrokerClient, ChannelFault, IceCandidate, ReconnectPolicy, SdpKind, SessionDescription,
    SessionId, SignalingChannel, SignalingMessage, SignalingPayload, TopicScope, TopicSet,
};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
