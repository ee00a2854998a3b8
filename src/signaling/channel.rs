//! Signaling channel abstraction and the WebSocket broker client
//!
//! The coordinator talks to signaling through the [`SignalingChannel`] trait
//! so tests can swap in an in-memory hub. The production implementation,
//! [`BrokerClient`], speaks a small JSON frame protocol over a WebSocket to a
//! pub/sub broker and transparently reconnects with exponential backoff,
//! replaying its subscriptions after each successful reconnect.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Handler invoked with the body of each message delivered on a topic
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Handler invoked when the channel reports a transport fault
pub type ChannelErrorHandler = Arc<dyn Fn(ChannelFault) + Send + Sync>;

/// A transport fault surfaced through the channel's error handler.
///
/// Faults are fatal only when the channel has given up reconnecting.
#[derive(Debug)]
pub struct ChannelFault {
    pub error: Error,
    pub fatal: bool,
}

/// Pub/sub signaling transport.
///
/// `publish` is fire-and-forget: delivery failures are reported through the
/// error handler rather than returned, so senders never block on broker
/// health.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Subscribe to a topic. May be called before `connect`; subscriptions
    /// are replayed on every (re)connect.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn publish(&self, topic: &str, body: String);

    async fn set_error_handler(&self, handler: ChannelErrorHandler);
}

/// Reconnect behavior for the broker client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum reconnect attempts before giving up
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier per attempt
    pub backoff_multiplier: f64,
    /// Randomize delays to avoid thundering herd
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay in milliseconds for the given attempt (0-based)
    pub fn calculate_backoff(&self, attempt: u32) -> u64 {
        let exp = self.backoff_multiplier.powi(attempt as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);

        if self.jitter_enabled {
            // 50%..150% of the base delay
            let jitter = 0.5 + Self::pseudo_random();
            ((base * jitter) as u64).min(self.max_backoff_ms)
        } else {
            base as u64
        }
    }

    /// Whether another attempt is within budget
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    // Clock-derived jitter in [0, 1); avoids pulling in an RNG dependency
    fn pseudo_random() -> f64 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        (nanos % 1000) as f64 / 1000.0
    }
}

/// Frames exchanged with the broker.
///
/// The broker contract is deliberately small: a client subscribes and
/// unsubscribes by topic, sends bodies to a topic, and receives bodies as
/// `message` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum BrokerFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Send { topic: String, body: String },
    Message { topic: String, body: String },
}

/// WebSocket client for a JSON pub/sub broker
pub struct BrokerClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    url: String,
    policy: ReconnectPolicy,
    writer: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    subscriptions: RwLock<HashMap<String, Vec<MessageHandler>>>,
    error_handler: RwLock<Option<ChannelErrorHandler>>,
    closed: AtomicBool,
    // Held across a dial so concurrent callers cannot open two sockets
    dial_gate: Mutex<()>,
    reconnecting: AtomicBool,
}

impl BrokerClient {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                url: url.into(),
                policy,
                writer: RwLock::new(None),
                subscriptions: RwLock::new(HashMap::new()),
                error_handler: RwLock::new(None),
                closed: AtomicBool::new(false),
                dial_gate: Mutex::new(()),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

impl ClientShared {
    async fn dial(self: &Arc<Self>) -> Result<()> {
        let _gate = self.dial_gate.lock().await;

        // Another caller (connect racing a reconnect attempt) won the gate
        // first and the connection is already up.
        if self.writer.read().await.is_some() {
            return Ok(());
        }

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", self.url, e)))?;

        info!("Connected to signaling broker at {}", self.url);

        let (sink, source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.write().await = Some(tx);

        tokio::spawn(sender_task(sink, rx));
        tokio::spawn(receiver_task(Arc::clone(self), source));

        // Re-establish subscriptions on the fresh connection
        let topics: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        for topic in topics {
            self.send_frame(BrokerFrame::Subscribe { topic }).await?;
        }

        Ok(())
    }

    async fn send_frame(&self, frame: BrokerFrame) -> Result<()> {
        let json = serde_json::to_string(&frame).map_err(|e| Error::Serialization(e.to_string()))?;

        let writer = self.writer.read().await;
        match writer.as_ref() {
            Some(tx) => tx
                .send(Message::Text(json))
                .map_err(|_| Error::Connection("broker connection lost".to_string())),
            None => Err(Error::Connection("not connected to broker".to_string())),
        }
    }

    async fn dispatch_frame(&self, text: &str) {
        let frame: BrokerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding unparseable broker frame: {}", e);
                return;
            }
        };

        match frame {
            BrokerFrame::Message { topic, body } => {
                let handlers: Vec<MessageHandler> = {
                    let subs = self.subscriptions.read().await;
                    subs.get(&topic).cloned().unwrap_or_default()
                };
                if handlers.is_empty() {
                    debug!("No subscriber for topic {}", topic);
                }
                for handler in handlers {
                    handler(body.clone());
                }
            }
            other => debug!("Ignoring broker frame: {:?}", other),
        }
    }

    async fn report(&self, error: Error, fatal: bool) {
        let handler = self.error_handler.read().await.clone();
        match handler {
            Some(handler) => handler(ChannelFault { error, fatal }),
            None => warn!("Unreported channel fault (fatal={}): {}", fatal, error),
        }
    }
}

async fn sender_task(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!("Broker send failed, stopping sender: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn receiver_task(shared: Arc<ClientShared>, mut source: WsSource) {
    while let Some(item) = source.next().await {
        match item {
            Ok(Message::Text(text)) => shared.dispatch_frame(&text).await,
            Ok(Message::Close(_)) => {
                debug!("Broker closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.report(Error::WebSocket(e.to_string()), false).await;
                break;
            }
        }
    }

    shared.writer.write().await.take();

    if !shared.closed.load(Ordering::SeqCst) && !shared.reconnecting.swap(true, Ordering::SeqCst) {
        tokio::spawn(reconnect_loop(shared, 0));
    }
}

// Boxed rather than an `async fn`: `dial` spawns the receiver task, which
// spawns this loop, which awaits `dial` again, and rustc cannot name the
// resulting cyclic future type.
fn reconnect_loop(
    shared: Arc<ClientShared>,
    first_attempt: u32,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut attempt = first_attempt;

        loop {
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }

            if !shared.policy.should_retry(attempt) {
                shared
                    .report(
                        Error::Connection(format!(
                            "reconnect budget exhausted after {} attempts",
                            attempt
                        )),
                        true,
                    )
                    .await;
                break;
            }

            let delay = shared.policy.calculate_backoff(attempt);
            debug!("Reconnect attempt {} in {}ms", attempt + 1, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if shared.closed.load(Ordering::SeqCst) {
                break;
            }

            match shared.dial().await {
                Ok(()) => {
                    info!("Reconnected to broker after {} attempts", attempt + 1);
                    break;
                }
                Err(e) => {
                    shared.report(e, false).await;
                    attempt += 1;
                }
            }
        }

        shared.reconnecting.store(false, Ordering::SeqCst);
    })
}

#[async_trait]
impl SignalingChannel for BrokerClient {
    async fn connect(&self) -> Result<()> {
        if self.shared.writer.read().await.is_some() {
            return Ok(());
        }
        self.shared.closed.store(false, Ordering::SeqCst);

        match self.shared.dial().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // First dial failed; keep retrying in the background while
                // the caller learns about the failure.
                if !self.shared.reconnecting.swap(true, Ordering::SeqCst) {
                    tokio::spawn(reconnect_loop(Arc::clone(&self.shared), 1));
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Dropping the writer ends the sender task, which closes the socket
        self.shared.writer.write().await.take();
        self.shared.subscriptions.write().await.clear();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let first_for_topic = {
            let mut subs = self.shared.subscriptions.write().await;
            let handlers = subs.entry(topic.to_string()).or_default();
            handlers.push(handler);
            handlers.len() == 1
        };

        if first_for_topic && self.shared.writer.read().await.is_some() {
            self.shared
                .send_frame(BrokerFrame::Subscribe {
                    topic: topic.to_string(),
                })
                .await?;
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = self.shared.subscriptions.write().await.remove(topic).is_some();

        if removed && self.shared.writer.read().await.is_some() {
            self.shared
                .send_frame(BrokerFrame::Unsubscribe {
                    topic: topic.to_string(),
                })
                .await?;
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, body: String) {
        let frame = BrokerFrame::Send {
            topic: topic.to_string(),
            body,
        };
        if let Err(e) = self.shared.send_frame(frame).await {
            self.shared.report(e, false).await;
        }
    }

    async fn set_error_handler(&self, handler: ChannelErrorHandler) {
        *self.shared.error_handler.write().await = Some(handler);
    }
}
