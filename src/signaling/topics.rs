//! Broker topic naming
//!
//! The broker relays each message kind on its own topic. The default layout
//! is a single shared set of topics for all peers; per-session scoping
//! appends the session id so traffic from unrelated calls never reaches a
//! subscriber.

use crate::signaling::protocol::{SessionId, SignalingPayload};
use serde::{Deserialize, Serialize};

/// Shared topic for SDP offers
pub const OFFER_TOPIC: &str = "/topic/peer/offer";
/// Shared topic for SDP answers
pub const ANSWER_TOPIC: &str = "/topic/peer/answer";
/// Shared topic for trickled ICE candidates
pub const ICE_CANDIDATE_TOPIC: &str = "/topic/peer/iceCandidate";

/// How broker topics are partitioned across sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicScope {
    /// All peers share one topic per message kind; receivers filter by
    /// session id.
    #[default]
    Shared,
    /// Topics are suffixed with the session id, so the broker itself
    /// partitions traffic.
    PerSession,
}

/// The three topics a coordinator subscribes to for one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub offer: String,
    pub answer: String,
    pub ice_candidate: String,
}

impl TopicSet {
    /// Shared topics used by every peer
    pub fn shared() -> Self {
        Self {
            offer: OFFER_TOPIC.to_string(),
            answer: ANSWER_TOPIC.to_string(),
            ice_candidate: ICE_CANDIDATE_TOPIC.to_string(),
        }
    }

    /// Topics scoped to a single session
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            offer: format!("{}/{}", OFFER_TOPIC, session_id),
            answer: format!("{}/{}", ANSWER_TOPIC, session_id),
            ice_candidate: format!("{}/{}", ICE_CANDIDATE_TOPIC, session_id),
        }
    }

    /// All topics in the set
    pub fn all(&self) -> [&str; 3] {
        [&self.offer, &self.answer, &self.ice_candidate]
    }

    /// The topic a payload is published on
    pub fn topic_for(&self, payload: &SignalingPayload) -> &str {
        match payload {
            SignalingPayload::Offer(_) => &self.offer,
            SignalingPayload::Answer(_) => &self.answer,
            SignalingPayload::IceCandidate(_) => &self.ice_candidate,
        }
    }
}
