//! Shared test harness: an in-memory signaling hub, scripted media
//! endpoints, and a hand-driven remote peer.

#![allow(dead_code)]

use async_trait::async_trait;
use peerlink::{
    ChannelFault, EndpointEvent, EndpointFactory, EndpointState, IceCandidate, LocalStream,
    MediaEndpoint, RemoteStream, Result, SessionCoordinator, SessionDescription, SessionId,
    SessionState, SignalingChannel, SignalingMessage, SignalingPayload, TopicSet,
};
use peerlink::signaling::{ChannelErrorHandler, MessageHandler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory pub/sub hub shared by every channel in a test.
///
/// Like a real broker, it echoes published messages to all subscribers of a
/// topic, including the publisher's own channel.
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    next_client: usize,
    subscribers: HashMap<String, Vec<(usize, MessageHandler)>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                next_client: 0,
                subscribers: HashMap::new(),
            }),
        })
    }

    pub fn channel(self: &Arc<Self>) -> Arc<MemoryChannel> {
        let client_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_client += 1;
            inner.next_client
        };
        Arc::new(MemoryChannel {
            hub: Arc::clone(self),
            client_id,
            error_handler: Mutex::new(None),
        })
    }

    fn deliver(&self, topic: &str, body: String) {
        let handlers: Vec<MessageHandler> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .get(topic)
                .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(body.clone());
        }
    }
}

/// One client's connection to the [`MemoryHub`]
pub struct MemoryChannel {
    hub: Arc<MemoryHub>,
    client_id: usize,
    error_handler: Mutex<Option<ChannelErrorHandler>>,
}

impl MemoryChannel {
    /// Drive the coordinator's fault path directly
    pub fn inject_fault(&self, fault: ChannelFault) {
        let handler = self.error_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(fault);
        }
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        for subs in inner.subscribers.values_mut() {
            subs.retain(|(id, _)| *id != self.client_id);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push((self.client_id, handler));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(subs) = inner.subscribers.get_mut(topic) {
            subs.retain(|(id, _)| *id != self.client_id);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, body: String) {
        self.hub.deliver(topic, body);
    }

    async fn set_error_handler(&self, handler: ChannelErrorHandler) {
        *self.error_handler.lock().unwrap() = Some(handler);
    }
}

/// Scripted endpoint: fabricates SDP, emits two local candidates plus a
/// remote stream once negotiation completes, and records every remote
/// candidate applied to it.
pub struct FakeEndpoint {
    session_id: SessionId,
    label: String,
    fail_offers: bool,
    attached: AtomicBool,
    closed: Arc<AtomicBool>,
    applied_candidates: Arc<Mutex<Vec<String>>>,
    tx: mpsc::UnboundedSender<EndpointEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
}

impl FakeEndpoint {
    fn new(session_id: SessionId, label: String, fail_offers: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            label,
            fail_offers,
            attached: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            applied_candidates: Arc::new(Mutex::new(Vec::new())),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an event as if the transport produced it, for scripting late
    /// activity from this endpoint
    pub fn emit(&self, event: EndpointEvent) {
        let _ = self.tx.send(event);
    }

    fn require_media(&self) -> Result<()> {
        if self.attached.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(peerlink::Error::MediaNegotiation(
                "no local media stream attached".to_string(),
            ))
        }
    }

    /// Emit what a real endpoint produces once both descriptions are set
    fn emit_negotiated(&self) {
        for n in 1..=2 {
            let _ = self.tx.send(EndpointEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{}-{}", self.label, n),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        let _ = self
            .tx
            .send(EndpointEvent::StateChanged(EndpointState::Connected));
        let _ = self.tx.send(EndpointEvent::RemoteStream(RemoteStream {
            session_id: self.session_id.clone(),
            stream_id: format!("stream-{}", self.label),
            tracks: Vec::new(),
        }));
    }
}

#[async_trait]
impl MediaEndpoint for FakeEndpoint {
    async fn attach_local_stream(&self, _stream: LocalStream) -> Result<()> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.fail_offers {
            return Err(peerlink::Error::MediaNegotiation(
                "scripted offer failure".to_string(),
            ));
        }
        self.require_media()?;
        Ok(SessionDescription::offer(format!(
            "v=0 fake offer from {}",
            self.label
        )))
    }

    async fn create_answer(&self, _offer: &SessionDescription) -> Result<SessionDescription> {
        self.require_media()?;
        self.emit_negotiated();
        Ok(SessionDescription::answer(format!(
            "v=0 fake answer from {}",
            self.label
        )))
    }

    async fn apply_answer(&self, _answer: &SessionDescription) -> Result<()> {
        self.emit_negotiated();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.applied_candidates
            .lock()
            .unwrap()
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.rx.lock().unwrap().take()
    }
}

/// Factory that records every endpoint it hands out, so tests can inspect
/// them afterwards
pub struct FakeEndpointFactory {
    label: String,
    fail_offers: bool,
    created: Arc<Mutex<Vec<(SessionId, Arc<FakeEndpoint>)>>>,
}

impl FakeEndpointFactory {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            fail_offers: false,
            created: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn failing_offers(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            fail_offers: true,
            created: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn endpoints_for(&self, session_id: &SessionId) -> Vec<Arc<FakeEndpoint>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, ep)| Arc::clone(ep))
            .collect()
    }

    pub fn all_endpoints(&self) -> Vec<Arc<FakeEndpoint>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ep)| Arc::clone(ep))
            .collect()
    }
}

#[async_trait]
impl EndpointFactory for FakeEndpointFactory {
    async fn create_endpoint(&self, session_id: &SessionId) -> Result<Arc<dyn MediaEndpoint>> {
        let endpoint = Arc::new(FakeEndpoint::new(
            session_id.clone(),
            self.label.clone(),
            self.fail_offers,
        ));
        self.created
            .lock()
            .unwrap()
            .push((session_id.clone(), Arc::clone(&endpoint)));
        Ok(endpoint as Arc<dyn MediaEndpoint>)
    }
}

/// A remote peer driven directly by the test body: it subscribes to the
/// shared topics, collects everything the coordinator sends, and publishes
/// whatever the test scripts.
pub struct TestPeer {
    pub sender_id: String,
    channel: Arc<MemoryChannel>,
    inbox: Arc<Mutex<Vec<SignalingMessage>>>,
    topics: TopicSet,
}

impl TestPeer {
    pub async fn new(hub: &Arc<MemoryHub>, sender_id: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        let channel = hub.channel();
        let inbox: Arc<Mutex<Vec<SignalingMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let topics = TopicSet::shared();

        for topic in topics.all() {
            let inbox = Arc::clone(&inbox);
            let own_id = sender_id.clone();
            channel
                .subscribe(
                    topic,
                    Arc::new(move |body: String| {
                        if let Ok(msg) = SignalingMessage::from_json(&body) {
                            if msg.sender_id != own_id {
                                inbox.lock().unwrap().push(msg);
                            }
                        }
                    }),
                )
                .await
                .unwrap();
        }

        Self {
            sender_id,
            channel,
            inbox,
            topics,
        }
    }

    pub async fn send(&self, msg: SignalingMessage) {
        let topic = self.topics.topic_for(&msg.payload).to_string();
        self.channel.publish(&topic, msg.to_json().unwrap()).await;
    }

    /// Publish a raw body on a topic, for malformed-input tests
    pub async fn send_raw(&self, topic: &str, body: &str) {
        self.channel.publish(topic, body.to_string()).await;
    }

    pub fn received(&self) -> Vec<SignalingMessage> {
        self.inbox.lock().unwrap().clone()
    }

    /// Wait until a received message matches the predicate
    pub async fn wait_for<F>(&self, predicate: F) -> Option<SignalingMessage>
    where
        F: Fn(&SignalingMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(msg) = self.inbox.lock().unwrap().iter().find(|m| predicate(m)) {
                return Some(msg.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_offer(&self) -> Option<SignalingMessage> {
        self.wait_for(|m| matches!(m.payload, SignalingPayload::Offer(_)))
            .await
    }

    pub async fn wait_for_answer(&self, session_id: &SessionId) -> Option<SignalingMessage> {
        let session_id = session_id.clone();
        self.wait_for(move |m| {
            m.session_id == session_id && matches!(m.payload, SignalingPayload::Answer(_))
        })
        .await
    }
}

/// Poll until the session reaches the given state
pub async fn wait_for_state(
    coordinator: &SessionCoordinator,
    session_id: &SessionId,
    state: SessionState,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if coordinator.session_state(session_id).await == Some(state) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the coordinator has a session in the given state, returning
/// its id
pub async fn wait_for_any_session(
    coordinator: &SessionCoordinator,
    state: SessionState,
) -> Option<SessionId> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(snapshot) = coordinator
            .sessions()
            .await
            .into_iter()
            .find(|s| s.state == state)
        {
            return Some(snapshot.session_id);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Route crate logs through `RUST_LOG` when a test is run by hand
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let in-flight dispatch work settle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn test_offer(session_id: &SessionId, sender_id: &str) -> SignalingMessage {
    SignalingMessage::offer(
        session_id.clone(),
        sender_id,
        SessionDescription::offer(format!("v=0 fake offer from {}", sender_id)),
    )
}

pub fn test_answer(session_id: &SessionId, sender_id: &str) -> SignalingMessage {
    SignalingMessage::answer(
        session_id.clone(),
        sender_id,
        SessionDescription::answer(format!("v=0 fake answer from {}", sender_id)),
    )
}

pub fn test_candidate(session_id: &SessionId, sender_id: &str, n: u32) -> SignalingMessage {
    SignalingMessage::ice_candidate(
        session_id.clone(),
        sender_id,
        IceCandidate {
            candidate: format!("candidate:{}-{}", sender_id, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
    )
}
