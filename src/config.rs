//! Coordinator configuration

use crate::signaling::{ReconnectPolicy, TopicScope};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// TURN server credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (e.g. "turn:turn.example.com:3478")
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Configuration for a [`SessionCoordinator`](crate::SessionCoordinator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// WebSocket URL of the signaling broker
    pub broker_url: String,

    /// Stable identifier for this peer on the signaling topics. Generated
    /// when not set.
    pub sender_id: Option<String>,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN servers with credentials
    pub turn_servers: Vec<TurnServerConfig>,

    /// How broker topics are partitioned
    pub topic_scope: TopicScope,

    /// Maximum concurrently live sessions
    pub max_sessions: usize,

    /// Broker reconnect behavior
    pub reconnect: ReconnectPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8080/signaling".to_string(),
            sender_id: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            topic_scope: TopicScope::Shared,
            max_sessions: 8,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Default::default()
        }
    }

    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_turn_servers(mut self, servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = servers;
        self
    }

    pub fn with_topic_scope(mut self, scope: TopicScope) -> Self {
        self.topic_scope = scope;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.broker_url.starts_with("ws://") && !self.broker_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "broker_url must be a ws:// or wss:// URL, got: {}",
                self.broker_url
            )));
        }

        if let Some(sender_id) = &self.sender_id {
            if sender_id.is_empty() {
                return Err(Error::InvalidConfig(
                    "sender_id must not be empty".to_string(),
                ));
            }
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun:, got: {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got: {}",
                    turn.url
                )));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    turn.url
                )));
            }
        }

        if self.max_sessions == 0 || self.max_sessions > 64 {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be between 1 and 64, got: {}",
                self.max_sessions
            )));
        }

        if self.reconnect.initial_backoff_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.initial_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(Error::InvalidConfig(
                "reconnect.max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect.backoff_multiplier must be >= 1.0, got: {}",
                self.reconnect.backoff_multiplier
            )));
        }

        Ok(())
    }
}
