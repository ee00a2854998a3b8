//! Bookkeeping for live sessions

use crate::peer::MediaEndpoint;
use crate::session::machine::{Role, SessionMachine, SessionState};
use crate::signaling::protocol::SessionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// One live session: its state machine, its endpoint, and delivery flags
pub struct SessionEntry {
    pub machine: SessionMachine,
    pub endpoint: Arc<dyn MediaEndpoint>,
    /// Whether the remote stream callback has already fired for this session
    pub remote_delivered: bool,
    /// Incremented each time the endpoint is replaced; events from an older
    /// endpoint carry a stale generation and are discarded
    pub generation: u64,
}

impl SessionEntry {
    pub fn new(machine: SessionMachine, endpoint: Arc<dyn MediaEndpoint>) -> Self {
        Self {
            machine,
            endpoint,
            remote_delivered: false,
            generation: 0,
        }
    }
}

/// Capacity-bounded map of live sessions
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Check that a new session with this id could be inserted
    pub fn ensure_capacity(&self, session_id: &SessionId) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            return Err(Error::Session(format!(
                "session {} already exists",
                session_id
            )));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::Session(format!(
                "session limit reached ({})",
                self.max_sessions
            )));
        }
        Ok(())
    }

    pub fn insert(&mut self, entry: SessionEntry) -> Result<()> {
        self.ensure_capacity(entry.machine.session_id())?;
        self.sessions
            .insert(entry.machine.session_id().clone(), entry);
        Ok(())
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    /// The locally initiated session still waiting for its answer, if any.
    /// Used to resolve offer glare across distinct session ids.
    pub fn pending_local_offer(&self) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, entry)| {
                entry.machine.role() == Some(Role::Caller)
                    && entry.machine.state() == SessionState::AwaitingAnswer
            })
            .map(|(id, _)| id.clone())
    }

    /// Remove and return every session, for shutdown
    pub fn drain(&mut self) -> Vec<(SessionId, SessionEntry)> {
        self.sessions.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{EndpointEvent, LocalStream};
    use crate::session::machine::{SessionEvent, SessionMachine};
    use crate::signaling::protocol::{IceCandidate, SessionDescription};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullEndpoint;

    #[async_trait]
    impl MediaEndpoint for NullEndpoint {
        async fn attach_local_stream(&self, _stream: LocalStream) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self, _offer: &SessionDescription) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn apply_answer(&self, _answer: &SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
            None
        }
    }

    fn entry(id: &str, local_id: &str) -> SessionEntry {
        SessionEntry::new(
            SessionMachine::new(SessionId::from(id), local_id),
            Arc::new(NullEndpoint),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = SessionRegistry::new(4);
        registry.insert(entry("s1", "peer-a")).unwrap();

        assert!(registry.contains(&SessionId::from("s1")));
        assert!(!registry.contains(&SessionId::from("s2")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rejects_duplicate_session() {
        let mut registry = SessionRegistry::new(4);
        registry.insert(entry("s1", "peer-a")).unwrap();

        let err = registry.insert(entry("s1", "peer-a")).unwrap_err();
        assert!(matches!(err, Error::Session(_)));
    }

    #[test]
    fn test_enforces_capacity() {
        let mut registry = SessionRegistry::new(2);
        registry.insert(entry("s1", "peer-a")).unwrap();
        registry.insert(entry("s2", "peer-a")).unwrap();

        let err = registry.insert(entry("s3", "peer-a")).unwrap_err();
        assert!(matches!(err, Error::Session(_)));

        registry.remove(&SessionId::from("s1"));
        assert!(registry.insert(entry("s3", "peer-a")).is_ok());
    }

    #[test]
    fn test_pending_local_offer_lookup() {
        let mut registry = SessionRegistry::new(4);
        let mut caller = entry("s1", "peer-a");
        caller.machine.handle(SessionEvent::Start(Role::Caller));
        registry.insert(caller).unwrap();
        registry.insert(entry("s2", "peer-a")).unwrap();

        assert_eq!(registry.pending_local_offer(), Some(SessionId::from("s1")));

        registry.remove(&SessionId::from("s1"));
        assert_eq!(registry.pending_local_offer(), None);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = SessionRegistry::new(4);
        registry.insert(entry("s1", "peer-a")).unwrap();
        registry.insert(entry("s2", "peer-a")).unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
