//! Signaling wire format
//!
//! Every message exchanged through the broker is a JSON envelope carrying the
//! session it belongs to, the peer that sent it, and a typed payload:
//!
//! ```json
//! {
//!   "sessionId": "8f41...",
//!   "senderId": "a3c9...",
//!   "type": "offer",
//!   "payload": { "type": "offer", "sdp": "v=0..." }
//! }
//! ```
//!
//! Payload shapes mirror the browser's `RTCSessionDescriptionInit` and
//! `RTCIceCandidateInit` so either end of the call can be a web client.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier tying the offer, answer and candidates of one call together.
///
/// Minted by the caller, adopted by the callee from the first offer it
/// accepts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Typed payload of a signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalingPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalingPayload {
    /// Message kind string as it appears on the wire, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::Offer(_) => "offer",
            SignalingPayload::Answer(_) => "answer",
            SignalingPayload::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Envelope for all broker-relayed signaling traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub session_id: SessionId,
    pub sender_id: String,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

impl SignalingMessage {
    pub fn offer(session_id: SessionId, sender_id: impl Into<String>, description: SessionDescription) -> Self {
        Self {
            session_id,
            sender_id: sender_id.into(),
            payload: SignalingPayload::Offer(description),
        }
    }

    pub fn answer(session_id: SessionId, sender_id: impl Into<String>, description: SessionDescription) -> Self {
        Self {
            session_id,
            sender_id: sender_id.into(),
            payload: SignalingPayload::Answer(description),
        }
    }

    pub fn ice_candidate(session_id: SessionId, sender_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Self {
            session_id,
            sender_id: sender_id.into(),
            payload: SignalingPayload::IceCandidate(candidate),
        }
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_roundtrip() {
        let msg = SignalingMessage::offer(
            SessionId::from("session-1"),
            "peer-a",
            SessionDescription::offer("v=0\r\n"),
        );

        let json = msg.to_json().unwrap();
        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SignalingMessage::ice_candidate(
            SessionId::from("session-1"),
            "peer-a",
            IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        );

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["sessionId"], "session-1");
        assert_eq!(value["senderId"], "peer-a");
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_parses_browser_shaped_offer() {
        let json = r#"{
            "sessionId": "room-42",
            "senderId": "web-client",
            "type": "offer",
            "payload": { "type": "offer", "sdp": "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n" }
        }"#;

        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(msg.session_id.as_str(), "room-42");
        assert_eq!(msg.payload.kind(), "offer");
        match msg.payload {
            SignalingPayload::Offer(desc) => assert_eq!(desc.kind, SdpKind::Offer),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = SignalingMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));

        // Valid JSON but missing required fields
        let err = SignalingMessage::from_json(r#"{"sessionId": "x"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));

        // Unknown message type
        let err = SignalingMessage::from_json(
            r#"{"sessionId": "x", "senderId": "y", "type": "hangup", "payload": {}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_candidate_without_mid_omits_fields() {
        let msg = SignalingMessage::ice_candidate(
            SessionId::from("s"),
            "p",
            IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        );

        let json = msg.to_json().unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpMLineIndex"));

        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_session_id_ordering_is_lexicographic() {
        // Tie-break logic depends on this ordering
        assert!(SessionId::from("aaa") < SessionId::from("aab"));
        assert!("peer-a" < "peer-b");
    }
}
