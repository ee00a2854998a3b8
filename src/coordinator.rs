//! Session coordinator
//!
//! [`SessionCoordinator`] owns the signaling channel, a media source, and an
//! endpoint factory, and runs every session's state machine on one serial
//! dispatch loop. Inbound signaling, endpoint events and channel faults all
//! funnel into a single queue, so session state is only ever touched from
//! one task and needs no locking.

use crate::config::CoordinatorConfig;
use crate::peer::{
    EndpointEvent, EndpointFactory, EndpointState, LocalStream, MediaEndpoint, MediaSource,
    RemoteStream, RtcEndpointFactory, SampleMediaSource,
};
use crate::session::{
    Role, SessionAction, SessionEntry, SessionEvent, SessionMachine, SessionRegistry, SessionState,
};
use crate::signaling::{
    BrokerClient, ChannelFault, IceCandidate, SessionId, SignalingChannel, SignalingMessage,
    SignalingPayload, TopicScope, TopicSet,
};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked when remote media first arrives for a session
pub type RemoteStreamCallback = Arc<dyn Fn(RemoteStream) + Send + Sync>;

/// Callback invoked on connected/failed session transitions
pub type SessionStateCallback = Arc<dyn Fn(SessionId, SessionState, Option<String>) + Send + Sync>;

/// Point-in-time view of one session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub failure_reason: Option<String>,
}

// Bounds for candidates that arrive before their session's offer
const EARLY_CANDIDATE_SESSIONS: usize = 64;
const EARLY_CANDIDATES_PER_SESSION: usize = 32;

struct Callbacks {
    remote_stream: RwLock<Option<RemoteStreamCallback>>,
    session_state: RwLock<Option<SessionStateCallback>>,
}

enum DispatchEvent {
    StartLocalSession(SessionId),
    Signal(SignalingMessage),
    Malformed { topic: String, error: Error },
    Endpoint(SessionId, u64, EndpointEvent),
    ChannelFault(ChannelFault),
    Shutdown(oneshot::Sender<()>),
}

struct RunningHandle {
    tx: mpsc::UnboundedSender<DispatchEvent>,
    task: JoinHandle<()>,
    topics: TopicSet,
}

/// Coordinates WebRTC sessions over a pub/sub signaling broker
pub struct SessionCoordinator {
    config: CoordinatorConfig,
    local_id: String,
    channel: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaSource>,
    endpoints: Arc<dyn EndpointFactory>,
    callbacks: Arc<Callbacks>,
    snapshots: Arc<RwLock<HashMap<SessionId, SessionSnapshot>>>,
    running: Mutex<Option<RunningHandle>>,
}

impl SessionCoordinator {
    /// Create a coordinator with the production broker client and WebRTC
    /// endpoint factory
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        let local_id = config
            .sender_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let channel: Arc<dyn SignalingChannel> = Arc::new(BrokerClient::new(
            config.broker_url.clone(),
            config.reconnect.clone(),
        ));
        let endpoints: Arc<dyn EndpointFactory> = Arc::new(RtcEndpointFactory::from_config(&config));
        let media: Arc<dyn MediaSource> = Arc::new(SampleMediaSource::new(local_id.clone()));

        Ok(Self {
            config,
            local_id,
            channel,
            media,
            endpoints,
            callbacks: Arc::new(Callbacks {
                remote_stream: RwLock::new(None),
                session_state: RwLock::new(None),
            }),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        })
    }

    /// Replace the signaling channel (used for in-memory testing)
    pub fn with_channel(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Replace the media source
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = media;
        self
    }

    /// Replace the endpoint factory
    pub fn with_endpoint_factory(mut self, endpoints: Arc<dyn EndpointFactory>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// This peer's sender id on the signaling topics
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Register the callback that receives remote media. Fired at most once
    /// per session.
    pub async fn on_remote_stream(&self, callback: RemoteStreamCallback) {
        *self.callbacks.remote_stream.write().await = Some(callback);
    }

    /// Register the callback for connected/failed transitions
    pub async fn on_session_state(&self, callback: SessionStateCallback) {
        *self.callbacks.session_state.write().await = Some(callback);
    }

    /// Start coordinating. A caller mints a session id and publishes an
    /// offer; a callee waits for offers.
    pub async fn start(&self, role: Role) -> Result<()> {
        self.start_inner(role, None).await
    }

    /// Start with an externally agreed session id. Required for a callee
    /// under [`TopicScope::PerSession`].
    pub async fn start_with_session(&self, role: Role, session_id: SessionId) -> Result<()> {
        self.start_inner(role, Some(session_id)).await
    }

    async fn start_inner(&self, role: Role, session_id: Option<SessionId>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Session("coordinator already started".to_string()));
        }

        if self.config.topic_scope == TopicScope::PerSession
            && role == Role::Callee
            && session_id.is_none()
        {
            return Err(Error::InvalidConfig(
                "per-session topics require an explicit session id for the callee".to_string(),
            ));
        }

        // Media first: a denied permission should fail start() before any
        // broker traffic happens.
        let stream = self.media.acquire().await?;

        self.snapshots.write().await.clear();

        let (tx, rx) = mpsc::unbounded_channel();

        let fault_tx = tx.clone();
        self.channel
            .set_error_handler(Arc::new(move |fault| {
                let _ = fault_tx.send(DispatchEvent::ChannelFault(fault));
            }))
            .await;

        if let Err(e) = self.channel.connect().await {
            warn!("Initial broker connection failed, retrying in background: {}", e);
        }

        let local_session = match role {
            Role::Caller => Some(session_id.unwrap_or_else(SessionId::generate)),
            Role::Callee => session_id,
        };

        let topics = match self.config.topic_scope {
            TopicScope::Shared => TopicSet::shared(),
            TopicScope::PerSession => {
                let sid = local_session.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("per-session topics require a session id".to_string())
                })?;
                TopicSet::for_session(sid)
            }
        };

        for topic in topics.all() {
            let topic_name = topic.to_string();
            let handler_tx = tx.clone();
            let local_id = self.local_id.clone();
            self.channel
                .subscribe(
                    topic,
                    Arc::new(move |body: String| {
                        match SignalingMessage::from_json(&body) {
                            Ok(msg) => {
                                // Shared topics echo our own messages back
                                if msg.sender_id == local_id {
                                    return;
                                }
                                let _ = handler_tx.send(DispatchEvent::Signal(msg));
                            }
                            Err(error) => {
                                let _ = handler_tx.send(DispatchEvent::Malformed {
                                    topic: topic_name.clone(),
                                    error,
                                });
                            }
                        }
                    }),
                )
                .await?;
        }

        let worker = DispatchLoop {
            local_id: self.local_id.clone(),
            channel: Arc::clone(&self.channel),
            endpoints: Arc::clone(&self.endpoints),
            topics: topics.clone(),
            stream,
            registry: SessionRegistry::new(self.config.max_sessions),
            early_candidates: HashMap::new(),
            callbacks: Arc::clone(&self.callbacks),
            snapshots: Arc::clone(&self.snapshots),
            tx: tx.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        if role == Role::Caller {
            if let Some(sid) = &local_session {
                tx.send(DispatchEvent::StartLocalSession(sid.clone()))
                    .map_err(|_| Error::Internal("dispatch loop unavailable".to_string()))?;
            }
        }

        info!(
            local_id = %self.local_id,
            role = ?role,
            "Session coordinator started"
        );

        *running = Some(RunningHandle { tx, task, topics });
        Ok(())
    }

    /// Stop coordinating: close every session, unsubscribe, and disconnect
    /// from the broker. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.running.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.tx.send(DispatchEvent::Shutdown(ack_tx)).is_ok()
            && tokio::time::timeout(Duration::from_secs(5), ack_rx)
                .await
                .is_err()
        {
            warn!("Dispatch loop did not acknowledge shutdown in time");
        }
        handle.task.abort();

        for topic in handle.topics.all() {
            if let Err(e) = self.channel.unsubscribe(topic).await {
                debug!("Unsubscribe during stop failed: {}", e);
            }
        }
        self.channel.disconnect().await?;

        info!(local_id = %self.local_id, "Session coordinator stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Current state of one session, if known
    pub async fn session_state(&self, session_id: &SessionId) -> Option<SessionState> {
        self.snapshots
            .read()
            .await
            .get(session_id)
            .map(|s| s.state)
    }

    /// Failure reason of one session, if it failed
    pub async fn failure_reason(&self, session_id: &SessionId) -> Option<String> {
        self.snapshots
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.failure_reason.clone())
    }

    /// Snapshots of every session seen since the last start
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.snapshots.read().await.values().cloned().collect()
    }
}

/// Owns all session state; runs on one task
struct DispatchLoop {
    local_id: String,
    channel: Arc<dyn SignalingChannel>,
    endpoints: Arc<dyn EndpointFactory>,
    topics: TopicSet,
    stream: LocalStream,
    registry: SessionRegistry,
    early_candidates: HashMap<SessionId, Vec<(String, IceCandidate)>>,
    callbacks: Arc<Callbacks>,
    snapshots: Arc<RwLock<HashMap<SessionId, SessionSnapshot>>>,
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl DispatchLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DispatchEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                DispatchEvent::Shutdown(ack) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                DispatchEvent::StartLocalSession(session_id) => {
                    self.start_local_session(session_id).await;
                }
                DispatchEvent::Signal(msg) => self.handle_signal(msg).await,
                DispatchEvent::Malformed { topic, error } => {
                    warn!(topic = %topic, "Discarding malformed signaling message: {}", error);
                }
                DispatchEvent::Endpoint(session_id, generation, event) => {
                    self.handle_endpoint_event(session_id, generation, event)
                        .await;
                }
                DispatchEvent::ChannelFault(fault) => self.handle_fault(fault).await,
            }
        }
    }

    async fn start_local_session(&mut self, session_id: SessionId) {
        if let Err(e) = self.create_entry(&session_id).await {
            error!(session_id = %session_id, "Failed to start local session: {}", e);
            self.write_snapshot(
                &session_id,
                SessionState::Failed,
                Some(e.failure_reason()),
            )
            .await;
            return;
        }
        self.dispatch_to_session(&session_id, SessionEvent::Start(Role::Caller))
            .await;
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        let session_id = msg.session_id.clone();

        let mut drained_early = Vec::new();
        if !self.registry.contains(&session_id) {
            match &msg.payload {
                SignalingPayload::Offer(_) => {
                    if !self.accept_inbound_offer(&msg).await {
                        return;
                    }
                    drained_early = self
                        .early_candidates
                        .remove(&session_id)
                        .unwrap_or_default();
                }
                SignalingPayload::IceCandidate(candidate) => {
                    // The candidate topic can outrun the offer topic; park
                    // a bounded number of candidates until the offer lands.
                    self.buffer_early_candidate(session_id, msg.sender_id, candidate.clone());
                    return;
                }
                SignalingPayload::Answer(_) => {
                    debug!(
                        session_id = %session_id,
                        sender_id = %msg.sender_id,
                        "Dropping answer for unknown session"
                    );
                    return;
                }
            }
        }

        let event = match msg.payload {
            SignalingPayload::Offer(description) => SessionEvent::Offer {
                sender_id: msg.sender_id,
                description,
            },
            SignalingPayload::Answer(description) => SessionEvent::Answer {
                sender_id: msg.sender_id,
                description,
            },
            SignalingPayload::IceCandidate(candidate) => SessionEvent::Candidate {
                sender_id: msg.sender_id,
                candidate,
            },
        };
        self.dispatch_to_session(&session_id, event).await;

        for (sender_id, candidate) in drained_early {
            self.dispatch_to_session(
                &session_id,
                SessionEvent::Candidate {
                    sender_id,
                    candidate,
                },
            )
            .await;
        }
    }

    /// Decide whether an offer for an unknown session opens a new one.
    ///
    /// When both peers initiated simultaneously each side minted its own
    /// session id, so glare shows up here rather than inside one machine.
    /// Same tie-break as the machine: the smaller sender id keeps its offer.
    async fn accept_inbound_offer(&mut self, msg: &SignalingMessage) -> bool {
        if let Some(pending) = self.registry.pending_local_offer() {
            if pending != msg.session_id {
                if self.local_id < msg.sender_id {
                    info!(
                        session_id = %msg.session_id,
                        sender_id = %msg.sender_id,
                        "Concurrent offer loses tie-break, keeping local offer"
                    );
                    return false;
                }
                info!(
                    session_id = %msg.session_id,
                    sender_id = %msg.sender_id,
                    abandoned = %pending,
                    "Concurrent offer wins tie-break, abandoning local offer"
                );
                self.dispatch_to_session(&pending, SessionEvent::Stop).await;
            }
        }

        if let Err(e) = self.create_entry(&msg.session_id).await {
            warn!(
                session_id = %msg.session_id,
                sender_id = %msg.sender_id,
                "Cannot accept inbound offer: {}", e
            );
            return false;
        }
        true
    }

    fn buffer_early_candidate(
        &mut self,
        session_id: SessionId,
        sender_id: String,
        candidate: IceCandidate,
    ) {
        if self.early_candidates.len() >= EARLY_CANDIDATE_SESSIONS
            && !self.early_candidates.contains_key(&session_id)
        {
            debug!(session_id = %session_id, "Early candidate table full, dropping candidate");
            return;
        }

        let parked = self.early_candidates.entry(session_id.clone()).or_default();
        if parked.len() >= EARLY_CANDIDATES_PER_SESSION {
            debug!(session_id = %session_id, "Early candidate buffer full, dropping candidate");
            return;
        }
        parked.push((sender_id, candidate));
        debug!(
            session_id = %session_id,
            parked = parked.len(),
            "Parked candidate ahead of its offer"
        );
    }

    async fn create_entry(&mut self, session_id: &SessionId) -> Result<()> {
        // Checked before the endpoint exists so a rejected session never
        // leaves one behind
        self.registry.ensure_capacity(session_id)?;

        let endpoint = self.endpoints.create_endpoint(session_id).await?;
        endpoint.attach_local_stream(self.stream.clone()).await?;
        self.pump_endpoint(session_id, 0, &endpoint).await;

        let machine = SessionMachine::new(session_id.clone(), self.local_id.clone());
        self.registry.insert(SessionEntry::new(machine, endpoint))?;
        self.sync_snapshot(session_id).await;
        Ok(())
    }

    /// Forward endpoint events into the dispatch queue, tagged with the
    /// generation of the endpoint that produced them
    async fn pump_endpoint(
        &self,
        session_id: &SessionId,
        generation: u64,
        endpoint: &Arc<dyn MediaEndpoint>,
    ) {
        if let Some(mut events) = endpoint.take_events().await {
            let tx = self.tx.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx
                        .send(DispatchEvent::Endpoint(session_id.clone(), generation, event))
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    }

    async fn dispatch_to_session(&mut self, session_id: &SessionId, event: SessionEvent) {
        let Some(entry) = self.registry.get_mut(session_id) else {
            return;
        };
        let actions = entry.machine.handle(event);
        self.execute(session_id, actions).await;
        self.sync_snapshot(session_id).await;
    }

    async fn execute(&mut self, session_id: &SessionId, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            // Refetched every iteration: ResetEndpoint swaps the endpoint
            let endpoint = match self.registry.get(session_id) {
                Some(entry) => Arc::clone(&entry.endpoint),
                None => return,
            };

            match action {
                SessionAction::PublishOffer => match endpoint.create_offer().await {
                    Ok(description) => {
                        let msg = SignalingMessage::offer(
                            session_id.clone(),
                            self.local_id.clone(),
                            description,
                        );
                        self.publish(msg).await;
                    }
                    Err(e) => self.feed(session_id, failure_event(e), &mut queue),
                },

                SessionAction::AnswerIncomingOffer(offer) => {
                    match endpoint.create_answer(&offer).await {
                        Ok(description) => {
                            let msg = SignalingMessage::answer(
                                session_id.clone(),
                                self.local_id.clone(),
                                description,
                            );
                            self.publish(msg).await;
                            self.feed(session_id, SessionEvent::AnswerSent, &mut queue);
                        }
                        Err(e) => self.feed(session_id, failure_event(e), &mut queue),
                    }
                }

                SessionAction::ResetEndpoint => {
                    if let Err(e) = endpoint.close().await {
                        debug!(session_id = %session_id, "Error closing endpoint for reset: {}", e);
                    }
                    match self.endpoints.create_endpoint(session_id).await {
                        Ok(fresh) => {
                            if let Err(e) = fresh.attach_local_stream(self.stream.clone()).await {
                                self.feed(session_id, failure_event(e), &mut queue);
                            } else if let Some(entry) = self.registry.get_mut(session_id) {
                                // Invalidates events still in flight from the
                                // endpoint being replaced
                                entry.generation += 1;
                                entry.endpoint = Arc::clone(&fresh);
                                let generation = entry.generation;
                                self.pump_endpoint(session_id, generation, &fresh).await;
                            }
                        }
                        Err(e) => self.feed(session_id, failure_event(e), &mut queue),
                    }
                }

                SessionAction::ApplyAnswer(answer) => {
                    if let Err(e) = endpoint.apply_answer(&answer).await {
                        self.feed(session_id, failure_event(e), &mut queue);
                    }
                }

                SessionAction::ApplyCandidate(candidate) => {
                    // Candidate problems never take the session down
                    if let Err(e) = endpoint.add_ice_candidate(&candidate).await {
                        warn!(session_id = %session_id, "Failed to apply remote candidate: {}", e);
                    }
                }

                SessionAction::NotifyConnected | SessionAction::NotifyFailed(_) => {
                    self.notify_state(session_id).await;
                }

                SessionAction::CloseEndpoint => {
                    if let Err(e) = endpoint.close().await {
                        debug!(session_id = %session_id, "Error closing endpoint: {}", e);
                    }
                }
            }
        }
    }

    /// Feed a follow-up event into the machine mid-execution, queueing
    /// whatever actions it produces
    fn feed(
        &mut self,
        session_id: &SessionId,
        event: SessionEvent,
        queue: &mut VecDeque<SessionAction>,
    ) {
        if let Some(entry) = self.registry.get_mut(session_id) {
            queue.extend(entry.machine.handle(event));
        }
    }

    async fn handle_endpoint_event(
        &mut self,
        session_id: SessionId,
        generation: u64,
        event: EndpointEvent,
    ) {
        // A replaced endpoint's pump can still be draining; its candidates
        // and state changes must not touch the session.
        let current = self.registry.get(&session_id).map(|e| e.generation);
        if current != Some(generation) {
            debug!(
                session_id = %session_id,
                generation,
                "Dropping event from a replaced endpoint"
            );
            return;
        }

        match event {
            EndpointEvent::LocalCandidate(candidate) => {
                let active = self
                    .registry
                    .get(&session_id)
                    .map(|e| e.machine.state().is_active())
                    .unwrap_or(false);
                if active {
                    let msg = SignalingMessage::ice_candidate(
                        session_id,
                        self.local_id.clone(),
                        candidate,
                    );
                    self.publish(msg).await;
                }
            }

            EndpointEvent::StateChanged(state) => match state {
                EndpointState::Failed | EndpointState::Disconnected => {
                    self.dispatch_to_session(
                        &session_id,
                        SessionEvent::EndpointFailed(format!(
                            "peer unreachable: transport state {:?}",
                            state
                        )),
                    )
                    .await;
                }
                other => {
                    debug!(session_id = %session_id, state = ?other, "Endpoint state changed");
                }
            },

            EndpointEvent::RemoteStream(stream) => {
                let Some(entry) = self.registry.get_mut(&session_id) else {
                    return;
                };
                if entry.remote_delivered || !entry.machine.state().is_active() {
                    return;
                }
                entry.remote_delivered = true;

                let callback = self.callbacks.remote_stream.read().await.clone();
                match callback {
                    Some(callback) => callback(stream),
                    None => {
                        debug!(session_id = %session_id, "Remote stream arrived with no callback registered");
                    }
                }
            }
        }
    }

    async fn handle_fault(&mut self, fault: ChannelFault) {
        if !fault.fatal {
            warn!("Signaling channel fault: {}", fault.error);
            return;
        }

        error!("Signaling channel failed permanently: {}", fault.error);
        let reason = fault.error.failure_reason();
        for session_id in self.registry.session_ids() {
            self.dispatch_to_session(&session_id, SessionEvent::EndpointFailed(reason.clone()))
                .await;
        }
    }

    async fn shutdown(&mut self) {
        for session_id in self.registry.session_ids() {
            self.dispatch_to_session(&session_id, SessionEvent::Stop)
                .await;
        }
    }

    async fn publish(&self, msg: SignalingMessage) {
        let topic = self.topics.topic_for(&msg.payload).to_string();
        match msg.to_json() {
            Ok(body) => self.channel.publish(&topic, body).await,
            Err(e) => error!(
                session_id = %msg.session_id,
                kind = msg.payload.kind(),
                "Failed to serialize outbound message: {}", e
            ),
        }
    }

    async fn sync_snapshot(&self, session_id: &SessionId) {
        let Some(entry) = self.registry.get(session_id) else {
            return;
        };
        let state = entry.machine.state();
        let reason = entry.machine.failure_reason().map(String::from);
        self.write_snapshot(session_id, state, reason).await;
    }

    async fn write_snapshot(
        &self,
        session_id: &SessionId,
        state: SessionState,
        failure_reason: Option<String>,
    ) {
        self.snapshots.write().await.insert(
            session_id.clone(),
            SessionSnapshot {
                session_id: session_id.clone(),
                state,
                failure_reason,
            },
        );
    }

    /// Update the snapshot and fire the state callback
    async fn notify_state(&self, session_id: &SessionId) {
        let Some(entry) = self.registry.get(session_id) else {
            return;
        };
        let state = entry.machine.state();
        let reason = entry.machine.failure_reason().map(String::from);
        self.write_snapshot(session_id, state, reason.clone()).await;

        let callback = self.callbacks.session_state.read().await.clone();
        if let Some(callback) = callback {
            callback(session_id.clone(), state, reason);
        }
    }
}

fn failure_event(error: Error) -> SessionEvent {
    SessionEvent::EndpointFailed(error.failure_reason())
}
