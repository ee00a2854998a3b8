//! Per-session negotiation state machine
//!
//! The machine is pure: it owns no I/O and no clocks. The coordinator feeds
//! it [`SessionEvent`]s and executes the [`SessionAction`]s it returns, so
//! every transition (including glare resolution and candidate buffering) can
//! be tested synchronously.
//!
//! States:
//!
//! ```text
//! Idle ──start(caller)──▶ AwaitingAnswer ──answer──▶ Connected
//!   │                         │   ▲
//!   │                         └───┘ glare: lower sender id keeps its offer
//! Idle ──offer──▶ AwaitingOffer ──answer sent──▶ Connected
//!
//! any active state ──endpoint failure──▶ Failed
//! any state ──stop──▶ Closed
//! ```

use crate::signaling::protocol::{IceCandidate, SessionDescription, SessionId};
use tracing::{debug, info, warn};

/// Which side of the call this peer is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the session by sending an offer
    Caller,
    /// Waits for an offer and answers it
    Callee,
}

/// Lifecycle state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No negotiation in progress
    Idle,
    /// Local offer published, waiting for the remote answer
    AwaitingAnswer,
    /// Remote offer accepted, answering
    AwaitingOffer,
    /// Signaling negotiation completed
    Connected,
    /// Terminal failure; requires stop/start to recover
    Failed,
    /// Session torn down
    Closed,
}

impl SessionState {
    /// Whether the session can still make progress
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Events fed into the machine by the coordinator
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Begin negotiating in the given role
    Start(Role),
    /// Remote offer received
    Offer {
        sender_id: String,
        description: SessionDescription,
    },
    /// Remote answer received
    Answer {
        sender_id: String,
        description: SessionDescription,
    },
    /// Remote ICE candidate received
    Candidate {
        sender_id: String,
        candidate: IceCandidate,
    },
    /// The local answer was generated and published
    AnswerSent,
    /// The media endpoint failed with the given reason
    EndpointFailed(String),
    /// Tear the session down
    Stop,
}

/// Side effects the coordinator must perform after a transition.
///
/// Actions are ordered; candidate applications always follow the action that
/// installs the remote description they depend on.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Create a local offer on the endpoint and publish it
    PublishOffer,
    /// Apply the remote offer, create an answer and publish it
    AnswerIncomingOffer(SessionDescription),
    /// Close and recreate the endpoint (glare loser discards its own offer)
    ResetEndpoint,
    /// Apply the remote answer to the endpoint
    ApplyAnswer(SessionDescription),
    /// Apply a remote ICE candidate to the endpoint
    ApplyCandidate(IceCandidate),
    /// Report the session as connected
    NotifyConnected,
    /// Report the session as failed with a reason
    NotifyFailed(String),
    /// Close the endpoint
    CloseEndpoint,
}

/// State machine for one session
#[derive(Debug)]
pub struct SessionMachine {
    session_id: SessionId,
    local_id: String,
    state: SessionState,
    role: Option<Role>,
    remote_description_set: bool,
    candidate_buffer: Vec<IceCandidate>,
    failure_reason: Option<String>,
}

impl SessionMachine {
    pub fn new(session_id: SessionId, local_id: impl Into<String>) -> Self {
        Self {
            session_id,
            local_id: local_id.into(),
            state: SessionState::Idle,
            role: None,
            remote_description_set: false,
            candidate_buffer: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Number of remote candidates waiting for a remote description
    pub fn buffered_candidates(&self) -> usize {
        self.candidate_buffer.len()
    }

    /// Advance the machine with one event, returning the actions to execute
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        match event {
            SessionEvent::Start(role) => self.on_start(role),
            SessionEvent::Offer {
                sender_id,
                description,
            } => self.on_offer(sender_id, description),
            SessionEvent::Answer {
                sender_id,
                description,
            } => self.on_answer(sender_id, description),
            SessionEvent::Candidate {
                sender_id,
                candidate,
            } => self.on_candidate(sender_id, candidate),
            SessionEvent::AnswerSent => self.on_answer_sent(),
            SessionEvent::EndpointFailed(reason) => self.on_endpoint_failed(reason),
            SessionEvent::Stop => self.on_stop(),
        }
    }

    fn on_start(&mut self, role: Role) -> Vec<SessionAction> {
        if self.state != SessionState::Idle {
            warn!(
                session_id = %self.session_id,
                state = ?self.state,
                "Ignoring start on a session that already left Idle"
            );
            return Vec::new();
        }

        self.role = Some(role);
        match role {
            Role::Caller => {
                self.transition(SessionState::AwaitingAnswer);
                vec![SessionAction::PublishOffer]
            }
            // A callee stays Idle until an offer arrives
            Role::Callee => Vec::new(),
        }
    }

    fn on_offer(&mut self, sender_id: String, description: SessionDescription) -> Vec<SessionAction> {
        match self.state {
            SessionState::Idle => {
                if self.role.is_none() {
                    self.role = Some(Role::Callee);
                }
                self.transition(SessionState::AwaitingOffer);
                self.remote_description_set = true;

                let mut actions = vec![SessionAction::AnswerIncomingOffer(description)];
                actions.extend(self.drain_candidates());
                actions
            }
            SessionState::AwaitingAnswer => self.on_glare(sender_id, description),
            SessionState::AwaitingOffer => {
                debug!(
                    session_id = %self.session_id,
                    sender_id = %sender_id,
                    "Ignoring duplicate offer while answering"
                );
                Vec::new()
            }
            SessionState::Connected => {
                warn!(
                    session_id = %self.session_id,
                    sender_id = %sender_id,
                    "Rejecting offer for an already-connected session"
                );
                Vec::new()
            }
            SessionState::Failed | SessionState::Closed => Vec::new(),
        }
    }

    /// Both sides sent an offer for the same session. The peer with the
    /// lexicographically smaller sender id keeps its offer; the other side
    /// discards its own pending offer and answers instead.
    fn on_glare(&mut self, sender_id: String, description: SessionDescription) -> Vec<SessionAction> {
        if self.local_id < sender_id {
            info!(
                session_id = %self.session_id,
                local_id = %self.local_id,
                sender_id = %sender_id,
                "Glare detected; local offer wins, ignoring remote offer"
            );
            return Vec::new();
        }

        info!(
            session_id = %self.session_id,
            local_id = %self.local_id,
            sender_id = %sender_id,
            "Glare detected; remote offer wins, answering it"
        );

        self.transition(SessionState::AwaitingOffer);
        self.remote_description_set = true;

        // The endpoint holds a pending local offer that must be discarded
        // before the remote one can be applied.
        let mut actions = vec![
            SessionAction::ResetEndpoint,
            SessionAction::AnswerIncomingOffer(description),
        ];
        actions.extend(self.drain_candidates());
        actions
    }

    fn on_answer(&mut self, sender_id: String, description: SessionDescription) -> Vec<SessionAction> {
        match self.state {
            SessionState::AwaitingAnswer => {
                self.transition(SessionState::Connected);
                self.remote_description_set = true;

                let mut actions = vec![SessionAction::ApplyAnswer(description)];
                actions.extend(self.drain_candidates());
                actions.push(SessionAction::NotifyConnected);
                actions
            }
            _ => {
                debug!(
                    session_id = %self.session_id,
                    sender_id = %sender_id,
                    state = ?self.state,
                    "Ignoring answer outside AwaitingAnswer"
                );
                Vec::new()
            }
        }
    }

    fn on_candidate(&mut self, sender_id: String, candidate: IceCandidate) -> Vec<SessionAction> {
        if !self.state.is_active() {
            debug!(
                session_id = %self.session_id,
                sender_id = %sender_id,
                "Dropping candidate for a terminated session"
            );
            return Vec::new();
        }

        if self.remote_description_set {
            vec![SessionAction::ApplyCandidate(candidate)]
        } else {
            // Trickled candidates can outrun the offer/answer they belong
            // to; hold them until the remote description lands.
            self.candidate_buffer.push(candidate);
            debug!(
                session_id = %self.session_id,
                buffered = self.candidate_buffer.len(),
                "Buffered early ICE candidate"
            );
            Vec::new()
        }
    }

    fn on_answer_sent(&mut self) -> Vec<SessionAction> {
        match self.state {
            SessionState::AwaitingOffer => {
                self.transition(SessionState::Connected);
                vec![SessionAction::NotifyConnected]
            }
            _ => Vec::new(),
        }
    }

    fn on_endpoint_failed(&mut self, reason: String) -> Vec<SessionAction> {
        if !self.state.is_active() {
            return Vec::new();
        }

        warn!(session_id = %self.session_id, reason = %reason, "Session failed");
        self.transition(SessionState::Failed);
        self.failure_reason = Some(reason.clone());
        self.candidate_buffer.clear();

        vec![
            SessionAction::NotifyFailed(reason),
            SessionAction::CloseEndpoint,
        ]
    }

    fn on_stop(&mut self) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        self.transition(SessionState::Closed);
        self.candidate_buffer.clear();
        vec![SessionAction::CloseEndpoint]
    }

    /// Drain buffered candidates into apply actions, in arrival order.
    /// The buffer is emptied so no candidate is ever applied twice.
    fn drain_candidates(&mut self) -> Vec<SessionAction> {
        self.candidate_buffer
            .drain(..)
            .map(SessionAction::ApplyCandidate)
            .collect()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(
                session_id = %self.session_id,
                from = ?self.state,
                to = ?next,
                "Session state transition"
            );
            self.state = next;
        }
    }
}
