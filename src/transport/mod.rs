//! Broker connection
//!
//! A [`Transport`] keeps one duplex link to the message broker for the
//! local identity. It supports:
//! - WebSocket links (`tokio-tungstenite`, JSON text frames)
//! - In-memory links to an in-process [`Broker`](crate::broker::Broker)
//!
//! # Design
//!
//! The link is owned by a single driver task. Publishes reach it through a
//! command channel and are acknowledged once written. Inbound `Message`
//! frames are handed to the registered callbacks inline, in arrival order.
//! After an unexpected loss the driver reconnects with exponential backoff
//! and re-subscribes everything that was subscribed before.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::protocol::{destinations, Frame};

pub mod memory;
pub mod websocket;
pub use memory::MemoryConnector;
pub use websocket::WebSocketConnector;

/// How long `disconnect` waits for the driver to close the link
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation needs an established connection
    #[error("Not connected")]
    NotConnected,

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Broker answered with an error frame
    #[error("Rejected by broker: {0}")]
    Rejected(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Observable connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link, not trying
    Disconnected,
    /// Handshake or reconnection in progress
    Connecting,
    /// Handshake done and inbox subscribed
    Connected,
    /// Connect failed or reconnection attempts exhausted
    Error,
}

/// A body received on a subscribed destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Destination the body was published to
    pub destination: String,
    /// Raw body
    pub body: String,
}

/// Callback for inbound deliveries
pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Write half of a link
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame
    async fn send(&mut self, frame: Frame) -> TransportResult<()>;

    /// Close the link
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a link
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame; `None` once the link is closed.
    ///
    /// `Err(InvalidData)` is a single malformed frame, the link stays usable.
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>>;
}

/// An open duplex link
pub struct Link {
    /// Write half
    pub sink: Box<dyn FrameSink>,
    /// Read half
    pub source: Box<dyn FrameSource>,
}

/// Opens links to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh link
    async fn open(&self) -> TransportResult<Link>;
}

/// Transport tuning
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Deadline for handshake plus initial subscriptions
    pub connect_timeout: Duration,
    /// Reconnection schedule
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for TransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect: config.reconnect.clone(),
        }
    }
}

enum Command {
    Send(Frame, oneshot::Sender<TransportResult<()>>),
    Close,
}

struct Session {
    identity: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Session {
    async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Close);
        if tokio::time::timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            warn!(identity = %self.identity, "driver did not stop in time");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    topics: Mutex<BTreeSet<String>>,
    message_handlers: RwLock<Vec<(String, Handler)>>,
    receipt_handlers: RwLock<Vec<(String, Handler)>>,
}

/// Persistent broker connection for one identity
pub struct Transport {
    inner: Arc<Inner>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Transport {
    /// Create a disconnected transport
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state,
                topics: Mutex::new(BTreeSet::new()),
                message_handlers: RwLock::new(Vec::new()),
                receipt_handlers: RwLock::new(Vec::new()),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Transport over WebSocket to `url`
    pub fn websocket(url: impl Into<String>, config: TransportConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector::new(url)), config)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connect as `identity`
    ///
    /// Resolves once the broker has acknowledged the handshake and every
    /// subscription (inbox, receipts, remembered topics), or fails after
    /// `connect_timeout`. A failed attempt leaves the state at `Error` and
    /// is not retried.
    pub async fn connect(&self, identity: &str) -> TransportResult<()> {
        if identity.is_empty() {
            return Err(TransportError::ConnectionFailed("empty identity".into()));
        }

        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.identity == identity && self.state() == ConnectionState::Connected {
                return Ok(());
            }
        }
        if let Some(previous) = session.take() {
            previous.shutdown().await;
        }

        self.inner.set_state(ConnectionState::Connecting);
        let established = match self.inner.establish(identity).await {
            Ok(mut established) => self.inner.go_live(&mut established).await.map(|()| established),
            Err(e) => Err(e),
        };
        match established {
            Ok(Established { link, early, .. }) => {
                let (commands, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(drive(
                    Arc::clone(&self.inner),
                    identity.to_string(),
                    link,
                    rx,
                    early,
                ));
                *session = Some(Session {
                    identity: identity.to_string(),
                    commands,
                    task,
                });
                info!(identity, "connected to broker");
                Ok(())
            }
            Err(e) => {
                warn!(identity, error = %e, "connect failed");
                self.inner.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Close the connection; no reconnection follows
    pub async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            info!(identity = %session.identity, "disconnecting");
            session.shutdown().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Publish `payload` to `destination`
    ///
    /// Resolves once the frame is written to the link; there is no
    /// delivery acknowledgement.
    pub async fn publish(&self, destination: &str, payload: &str) -> TransportResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.submit(Frame::Send {
            destination: destination.to_string(),
            body: payload.to_string(),
        })
        .await
    }

    /// Subscribe to `destination`, now if connected and after every reconnect
    pub async fn subscribe(&self, destination: &str) -> TransportResult<()> {
        // State is read under the topics lock; see `Inner::go_live`
        let live = {
            let mut topics = self.inner.topics.lock();
            topics.insert(destination.to_string()) && self.state() == ConnectionState::Connected
        };
        if live {
            self.submit(Frame::Subscribe {
                destination: destination.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Stop receiving `destination`
    pub async fn unsubscribe(&self, destination: &str) -> TransportResult<()> {
        let live = {
            let mut topics = self.inner.topics.lock();
            topics.remove(destination) && self.state() == ConnectionState::Connected
        };
        if live {
            self.submit(Frame::Unsubscribe {
                destination: destination.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Destinations subscribed on demand
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.lock().iter().cloned().collect()
    }

    /// Register a callback for every non-receipt delivery
    ///
    /// Re-registering `handler_id` replaces the callback in place.
    pub fn on_message<F>(&self, handler_id: impl Into<String>, callback: F)
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        register(&self.inner.message_handlers, handler_id.into(), Arc::new(callback));
    }

    /// Register a callback for deliveries on the identity's receipt queue
    pub fn on_receipt<F>(&self, handler_id: impl Into<String>, callback: F)
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        register(&self.inner.receipt_handlers, handler_id.into(), Arc::new(callback));
    }

    /// Remove a callback by id; true if one was registered
    pub fn remove_handler(&self, handler_id: &str) -> bool {
        let mut removed = false;
        for list in [&self.inner.message_handlers, &self.inner.receipt_handlers] {
            let mut handlers = list.write();
            let before = handlers.len();
            handlers.retain(|(id, _)| id != handler_id);
            removed |= handlers.len() != before;
        }
        removed
    }

    async fn submit(&self, frame: Frame) -> TransportResult<()> {
        let commands = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.commands.clone())
            .ok_or(TransportError::NotConnected)?;

        let (ack, done) = oneshot::channel();
        commands
            .send(Command::Send(frame, ack))
            .map_err(|_| TransportError::NotConnected)?;
        done.await.map_err(|_| TransportError::Disconnected)?
    }
}

fn register(list: &RwLock<Vec<(String, Handler)>>, id: String, handler: Handler) {
    let mut handlers = list.write();
    match handlers.iter_mut().find(|(existing, _)| *existing == id) {
        Some(slot) => slot.1 = handler,
        None => handlers.push((id, handler)),
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "transport state");
        }
    }

    fn dispatch(&self, identity: &str, delivery: &Delivery) {
        let list = if delivery.destination == destinations::receipts(identity) {
            &self.receipt_handlers
        } else {
            &self.message_handlers
        };
        // Snapshot so callbacks may (un)register handlers
        let handlers: Vec<Handler> = list.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(delivery);
        }
    }

    async fn establish(&self, identity: &str) -> TransportResult<Established> {
        tokio::time::timeout(self.config.connect_timeout, self.handshake(identity))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn handshake(&self, identity: &str) -> TransportResult<Established> {
        let mut link = self.connector.open().await?;
        link.sink
            .send(Frame::Connect {
                identity: identity.to_string(),
            })
            .await?;

        loop {
            match next_frame(&mut link).await? {
                Frame::Connected { .. } => break,
                Frame::Error { message } => return Err(TransportError::Rejected(message)),
                Frame::Ping => link.sink.send(Frame::Pong).await?,
                other => debug!(frame = ?other, "ignored before handshake"),
            }
        }

        let topics = self.topics.lock().clone();
        let mut pending: BTreeSet<String> = [destinations::inbox(identity), destinations::receipts(identity)]
            .into_iter()
            .chain(topics.iter().cloned())
            .collect();
        for destination in &pending {
            link.sink
                .send(Frame::Subscribe {
                    destination: destination.clone(),
                })
                .await?;
        }

        // Deliveries may arrive before the last acknowledgement
        let mut early = Vec::new();
        while !pending.is_empty() {
            match next_frame(&mut link).await? {
                Frame::Subscribed { destination } => {
                    pending.remove(&destination);
                }
                Frame::Message { destination, body } => early.push(Delivery { destination, body }),
                Frame::Error { message } => return Err(TransportError::Rejected(message)),
                Frame::Ping => link.sink.send(Frame::Pong).await?,
                other => debug!(frame = ?other, "ignored during subscribe"),
            }
        }
        Ok(Established { link, early, topics })
    }

    /// Flip to `Connected` and bring the link's topics in line with
    /// `subscribe`/`unsubscribe` calls made during the handshake.
    ///
    /// The flip and the comparison happen under the topics lock, the same
    /// lock those calls hold while reading the state: a call either lands
    /// before the flip and shows up in the difference, or after it and
    /// sends its own frame.
    async fn go_live(&self, established: &mut Established) -> TransportResult<()> {
        let frames: Vec<Frame> = {
            let current = self.topics.lock();
            self.set_state(ConnectionState::Connected);
            let added = current
                .difference(&established.topics)
                .map(|destination| Frame::Subscribe {
                    destination: destination.clone(),
                });
            let removed = established
                .topics
                .difference(&current)
                .map(|destination| Frame::Unsubscribe {
                    destination: destination.clone(),
                });
            added.chain(removed).collect()
        };

        if !frames.is_empty() {
            debug!(changes = frames.len(), "topics changed during handshake");
        }
        for frame in frames {
            if let Err(e) = established.link.sink.send(frame).await {
                self.set_state(ConnectionState::Connecting);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// A link that finished its handshake
struct Established {
    link: Link,
    /// Deliveries that arrived before the last acknowledgement
    early: Vec<Delivery>,
    /// Topics the link is subscribed to
    topics: BTreeSet<String>,
}

async fn next_frame(link: &mut Link) -> TransportResult<Frame> {
    loop {
        match link.source.next_frame().await {
            Some(Ok(frame)) => return Ok(frame),
            Some(Err(TransportError::InvalidData(reason))) => {
                warn!(%reason, "dropping malformed frame");
            }
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::Disconnected),
        }
    }
}

enum Exit {
    Closed,
    Lost(String),
}

async fn drive(
    inner: Arc<Inner>,
    identity: String,
    mut link: Link,
    mut commands: mpsc::UnboundedReceiver<Command>,
    early: Vec<Delivery>,
) {
    let mut early = early;
    loop {
        for delivery in early.drain(..) {
            inner.dispatch(&identity, &delivery);
        }

        match pump(&inner, &identity, &mut link, &mut commands).await {
            Exit::Closed => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            Exit::Lost(reason) => {
                warn!(identity = %identity, %reason, "broker connection lost");
                drop(link);
                match reconnect(&inner, &identity, &mut commands).await {
                    Some(restored) => {
                        link = restored.link;
                        early = restored.early;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    identity: &str,
    link: &mut Link,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Exit {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame, ack)) => {
                    let result = link.sink.send(frame).await;
                    let failure = result.as_ref().err().map(ToString::to_string);
                    let _ = ack.send(result);
                    if let Some(reason) = failure {
                        return Exit::Lost(reason);
                    }
                }
                Some(Command::Close) | None => {
                    let _ = link.sink.close().await;
                    return Exit::Closed;
                }
            },
            frame = link.source.next_frame() => match frame {
                Some(Ok(Frame::Message { destination, body })) => {
                    inner.dispatch(identity, &Delivery { destination, body });
                }
                Some(Ok(Frame::Ping)) => {
                    if let Err(e) = link.sink.send(Frame::Pong).await {
                        return Exit::Lost(e.to_string());
                    }
                }
                Some(Ok(Frame::Error { message })) => warn!(identity, %message, "broker error"),
                Some(Ok(other)) => debug!(frame = ?other, "ignored"),
                Some(Err(TransportError::InvalidData(reason))) => {
                    warn!(identity, %reason, "dropping malformed frame");
                }
                Some(Err(e)) => return Exit::Lost(e.to_string()),
                None => return Exit::Lost("closed by broker".into()),
            },
        }
    }
}

async fn reconnect(
    inner: &Inner,
    identity: &str,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<Established> {
    let policy = &inner.config.reconnect;
    inner.set_state(ConnectionState::Connecting);

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay(attempt);
        debug!(identity, attempt, ?delay, "waiting to reconnect");
        if !idle(commands, delay).await {
            inner.set_state(ConnectionState::Disconnected);
            return None;
        }

        let restored = match inner.establish(identity).await {
            Ok(mut restored) => inner.go_live(&mut restored).await.map(|()| restored),
            Err(e) => Err(e),
        };
        match restored {
            Ok(restored) => {
                info!(identity, attempt, "reconnected to broker");
                return Some(restored);
            }
            Err(e) => warn!(identity, attempt, max = policy.max_attempts, error = %e, "reconnect failed"),
        }
    }

    warn!(identity, "giving up on broker connection");
    inner.set_state(ConnectionState::Error);
    None
}

/// Sleep for `delay`, refusing publishes meanwhile; false if asked to close
async fn idle(commands: &mut mpsc::UnboundedReceiver<Command>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Send(_, ack)) => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                }
                Some(Command::Close) | None => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::protocol::{ChatRecord, ReadReceipt};
    use chrono::Utc;

    fn quick_config(max_attempts: u32) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy {
                max_attempts,
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn memory_transport(broker: &Arc<Broker>, max_attempts: u32) -> Transport {
        Transport::new(
            Arc::new(MemoryConnector::new(Arc::clone(broker))),
            quick_config(max_attempts),
        )
    }

    async fn wait_for_state(transport: &Transport, target: ConnectionState) {
        let mut rx = transport.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != target {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state never reached {target:?}"));
    }

    fn chat(sender: &str, receiver: &str, content: &str) -> String {
        ChatRecord {
            id: None,
            client_id: None,
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            content: content.into(),
            sender_content: None,
            created_at: Utc::now(),
            status: None,
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_subscribes_inbox_and_receipts() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 0);

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        transport.connect("alice").await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(broker.subscriber_count(&destinations::inbox("alice")), 1);
        assert_eq!(broker.subscriber_count(&destinations::receipts("alice")), 1);

        // Same identity again is a no-op
        transport.connect("alice").await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 0);

        assert_eq!(
            transport.publish(destinations::CHAT_SEND, "{}").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let broker = Arc::new(Broker::new());
        let alice = memory_transport(&broker, 0);
        let bob = memory_transport(&broker, 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bob.on_message(name, move |_| seen.lock().push(name));
        }
        // Replacing keeps the original slot
        let replaced = Arc::clone(&seen);
        bob.on_message("second", move |_| replaced.lock().push("second'"));
        assert!(bob.remove_handler("third"));
        assert!(!bob.remove_handler("missing"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_message("zz-done", move |d: &Delivery| {
            let _ = tx.send(d.clone());
        });

        alice.connect("alice").await.unwrap();
        bob.connect("bob").await.unwrap();
        alice
            .publish(destinations::CHAT_SEND, &chat("alice", "bob", "hi"))
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.destination, destinations::inbox("bob"));
        assert_eq!(*seen.lock(), vec!["first", "second'"]);
    }

    #[tokio::test]
    async fn test_receipts_reach_receipt_handlers_only() {
        let broker = Arc::new(Broker::new());
        let alice = memory_transport(&broker, 0);
        let bob = memory_transport(&broker, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let messages = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&messages);
        alice.on_message("messages", move |_| *counter.lock() += 1);
        alice.on_receipt("receipts", move |d: &Delivery| {
            let _ = tx.send(ReadReceipt::parse(&d.body).unwrap());
        });

        alice.connect("alice").await.unwrap();
        bob.connect("bob").await.unwrap();

        let receipt = ReadReceipt {
            message_id: "m-1".into(),
            reader_id: "bob".into(),
            sender_id: "alice".into(),
            read_at: Utc::now(),
        };
        bob.publish(destinations::CHAT_READ, &receipt.to_json().unwrap())
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message_id, "m-1");
        assert_eq!(*messages.lock(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_restores_topics() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 3);
        let topic = destinations::group_topic("g1");

        transport.subscribe(&topic).await.unwrap();
        transport.connect("alice").await.unwrap();
        assert_eq!(broker.subscriber_count(&topic), 1);

        let mut states = transport.watch_state();
        states.borrow_and_update();
        broker.kick("alice");
        states.changed().await.unwrap();

        wait_for_state(&transport, ConnectionState::Connected).await;
        assert_eq!(broker.subscriber_count(&topic), 1);
        assert_eq!(broker.subscriber_count(&destinations::inbox("alice")), 1);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_ends_in_error() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 2);
        transport.connect("alice").await.unwrap();

        broker.set_offline(true);
        wait_for_state(&transport, ConnectionState::Error).await;

        assert_eq!(
            transport.publish(destinations::CHAT_SEND, "{}").await,
            Err(TransportError::NotConnected)
        );

        // An explicit connect works again once the broker is back
        broker.set_offline(false);
        transport.connect("alice").await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_reconnect() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 5);
        transport.connect("alice").await.unwrap();

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_topic() {
        let broker = Arc::new(Broker::new());
        let transport = memory_transport(&broker, 0);
        let topic = destinations::group_topic("g1");
        transport.connect("alice").await.unwrap();

        transport.subscribe(&topic).await.unwrap();
        // The broker processes frames synchronously on write
        assert_eq!(broker.subscriber_count(&topic), 1);

        transport.unsubscribe(&topic).await.unwrap();
        assert_eq!(broker.subscriber_count(&topic), 0);
        assert!(transport.topics().is_empty());
    }

    /// Memory links that hold back subscription acks until released
    struct HeldAcks {
        inner: MemoryConnector,
        subscribing: Arc<tokio::sync::Notify>,
        release: watch::Receiver<bool>,
    }

    struct NotifyingSink {
        inner: Box<dyn FrameSink>,
        subscribing: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl FrameSink for NotifyingSink {
        async fn send(&mut self, frame: Frame) -> TransportResult<()> {
            if matches!(frame, Frame::Subscribe { .. }) {
                self.subscribing.notify_one();
            }
            self.inner.send(frame).await
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.inner.close().await
        }
    }

    struct HeldSource {
        inner: Box<dyn FrameSource>,
        release: watch::Receiver<bool>,
    }

    #[async_trait]
    impl FrameSource for HeldSource {
        async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
            let frame = self.inner.next_frame().await;
            if matches!(frame, Some(Ok(Frame::Subscribed { .. }))) {
                let _ = self.release.wait_for(|open| *open).await;
            }
            frame
        }
    }

    #[async_trait]
    impl Connector for HeldAcks {
        async fn open(&self) -> TransportResult<Link> {
            let link = self.inner.open().await?;
            Ok(Link {
                sink: Box::new(NotifyingSink {
                    inner: link.sink,
                    subscribing: Arc::clone(&self.subscribing),
                }),
                source: Box::new(HeldSource {
                    inner: link.source,
                    release: self.release.clone(),
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_topic_changes_during_handshake_are_applied() {
        let broker = Arc::new(Broker::new());
        let (release, held) = watch::channel(false);
        let subscribing = Arc::new(tokio::sync::Notify::new());
        let transport = Arc::new(Transport::new(
            Arc::new(HeldAcks {
                inner: MemoryConnector::new(Arc::clone(&broker)),
                subscribing: Arc::clone(&subscribing),
                release: held,
            }),
            quick_config(0),
        ));
        let kept = destinations::group_topic("kept");
        let dropped = destinations::group_topic("dropped");
        transport.subscribe(&dropped).await.unwrap();

        let connecting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect("alice").await })
        };

        // The handshake has taken its topic snapshot once it subscribes
        subscribing.notified().await;
        assert_eq!(transport.state(), ConnectionState::Connecting);
        transport.subscribe(&kept).await.unwrap();
        transport.unsubscribe(&dropped).await.unwrap();

        release.send(true).unwrap();
        connecting.await.unwrap().unwrap();

        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(broker.subscriber_count(&kept), 1);
        assert_eq!(broker.subscriber_count(&dropped), 0);
        assert_eq!(transport.topics(), vec![kept]);
    }

    struct Stalled;

    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _frame: Frame) -> TransportResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct StalledSource;

    #[async_trait]
    impl FrameSource for StalledSource {
        async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl Connector for Stalled {
        async fn open(&self) -> TransportResult<Link> {
            Ok(Link {
                sink: Box::new(StalledSink),
                source: Box::new(StalledSource),
            })
        }
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let transport = Transport::new(
            Arc::new(Stalled),
            TransportConfig {
                connect_timeout: Duration::from_millis(50),
                reconnect: ReconnectPolicy::disabled(),
            },
        );

        assert_eq!(transport.connect("alice").await, Err(TransportError::Timeout));
        assert_eq!(transport.state(), ConnectionState::Error);
    }
}
