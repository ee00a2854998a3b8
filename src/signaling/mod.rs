//! Signaling layer: wire protocol, topic naming, and the broker channel

pub mod channel;
pub mod protocol;
pub mod topics;

pub use channel::{
    BrokerClient, BrokerFrame, ChannelErrorHandler, ChannelFault, MessageHandler, ReconnectPolicy,
    SignalingChannel,
};
pub use protocol::{
    IceCandidate, SdpKind, SessionDescription, SessionId, SignalingMessage, SignalingPayload,
};
pub use topics::{TopicScope, TopicSet, ANSWER_TOPIC, ICE_CANDIDATE_TOPIC, OFFER_TOPIC};
