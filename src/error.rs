//! Error types for the peerlink coordinator
//!
//! Errors are grouped by the layer that produced them: configuration,
//! signaling transport, media/SDP negotiation, and session bookkeeping.
//! Helper predicates classify errors for retry and session-failure policy.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a session
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling broker connection error
    #[error("Signaling connection error: {0}")]
    Connection(String),

    /// Local media could not be acquired
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// SDP offer/answer generation failed
    #[error("Media negotiation error: {0}")]
    MediaNegotiation(String),

    /// Remote description could not be applied
    #[error("Incompatible remote description: {0}")]
    IncompatibleDescription(String),

    /// Inbound signaling message failed to parse
    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// WebRTC stack error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the operation that produced this error can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::WebSocket(_) | Error::Io(_)
        )
    }

    /// Whether this error is a configuration problem
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Whether this error terminates the session it occurred in
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::MediaAccess(_)
                | Error::MediaNegotiation(_)
                | Error::IncompatibleDescription(_)
                | Error::WebRtc(_)
        )
    }

    /// Human-readable failure reason for surfacing to the application.
    ///
    /// The prefix distinguishes the three failure families callers are
    /// expected to present differently: unreachable peer, denied media
    /// permissions, and incompatible negotiation.
    pub fn failure_reason(&self) -> String {
        match self {
            Error::Connection(msg) | Error::WebSocket(msg) => {
                format!("peer unreachable: {}", msg)
            }
            Error::Io(err) => format!("peer unreachable: {}", err),
            Error::MediaAccess(msg) => format!("media permission denied: {}", msg),
            Error::MediaNegotiation(msg) | Error::IncompatibleDescription(msg) => {
                format!("negotiation incompatible: {}", msg)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Signaling connection error: refused");

        let err = Error::MalformedMessage("not json".to_string());
        assert_eq!(err.to_string(), "Malformed signaling message: not json");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Connection("timeout".to_string()).is_retryable());
        assert!(Error::WebSocket("closed".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("bad url".to_string()).is_retryable());
        assert!(!Error::MediaAccess("denied".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal_to_session_classification() {
        assert!(Error::MediaAccess("denied".to_string()).is_fatal_to_session());
        assert!(Error::IncompatibleDescription("no codec".to_string()).is_fatal_to_session());
        assert!(!Error::MalformedMessage("junk".to_string()).is_fatal_to_session());
        assert!(!Error::Connection("timeout".to_string()).is_fatal_to_session());
    }

    #[test]
    fn test_failure_reason_families() {
        let reason = Error::Connection("timeout".to_string()).failure_reason();
        assert!(reason.starts_with("peer unreachable"));

        let reason = Error::MediaAccess("camera busy".to_string()).failure_reason();
        assert!(reason.starts_with("media permission denied"));

        let reason = Error::MediaNegotiation("no common codec".to_string()).failure_reason();
        assert!(reason.starts_with("negotiation incompatible"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();
        assert!(err.is_retryable());
    }
}
