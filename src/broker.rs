//! In-process message broker
//!
//! Destination pub/sub on top of [`protocol::route`](crate::protocol::route).
//! Each connection gets an outbox of frames; the memory transport reads it
//! directly and the relay binary forwards it over a WebSocket.
//!
//! A connection may only subscribe to its own `/user/{id}/...`
//! destinations and to group topics.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{destinations, route, Frame};

/// Identifier of a connection inside one broker
pub type ConnectionId = u64;

/// Broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker refuses new connections
    #[error("Broker is offline")]
    Offline,

    /// The connection is not registered (kicked or dropped)
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

struct Connection {
    identity: Option<String>,
    outbox: mpsc::UnboundedSender<Frame>,
    subscriptions: HashSet<String>,
}

impl Connection {
    fn reply(&self, frame: Frame) {
        let _ = self.outbox.send(frame);
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: ConnectionId,
    offline: bool,
    connections: HashMap<ConnectionId, Connection>,
    subscribers: HashMap<String, BTreeSet<ConnectionId>>,
}

impl BrokerState {
    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        for destination in &connection.subscriptions {
            if let Some(set) = self.subscribers.get_mut(destination) {
                set.remove(&id);
                if set.is_empty() {
                    self.subscribers.remove(destination);
                }
            }
        }
        Some(connection)
    }

    fn deliver(&self, destination: &str, body: &str) -> usize {
        let Some(targets) = self.subscribers.get(destination) else {
            debug!(destination, "no subscribers");
            return 0;
        };
        let mut delivered = 0;
        for id in targets {
            if let Some(connection) = self.connections.get(id) {
                let frame = Frame::Message {
                    destination: destination.to_string(),
                    body: body.to_string(),
                };
                if connection.outbox.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// In-process broker shared by every connection
#[derive(Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its outbox
    pub fn register(&self) -> Result<(ConnectionId, mpsc::UnboundedReceiver<Frame>), BrokerError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(BrokerError::Offline);
        }
        state.next_id += 1;
        let id = state.next_id;
        let (outbox, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Connection {
                identity: None,
                outbox,
                subscriptions: HashSet::new(),
            },
        );
        debug!(connection = id, "registered");
        Ok((id, rx))
    }

    /// Process one frame from connection `id`
    pub fn handle(&self, id: ConnectionId, frame: Frame) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let identity = {
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(BrokerError::UnknownConnection(id))?;

            match (&frame, connection.identity.clone()) {
                (Frame::Connect { identity }, None) => {
                    if identity.is_empty() {
                        connection.reply(Frame::Error {
                            message: "Empty identity".into(),
                        });
                        return Ok(());
                    }
                    connection.identity = Some(identity.clone());
                    connection.reply(Frame::Connected {
                        identity: identity.clone(),
                    });
                    info!(connection = id, identity = %identity, "connected");
                    return Ok(());
                }
                (Frame::Connect { .. }, Some(_)) => {
                    connection.reply(Frame::Error {
                        message: "Already connected".into(),
                    });
                    return Ok(());
                }
                (Frame::Ping, _) => {
                    connection.reply(Frame::Pong);
                    return Ok(());
                }
                (_, None) => {
                    connection.reply(Frame::Error {
                        message: "Not connected".into(),
                    });
                    return Ok(());
                }
                (_, Some(identity)) => identity,
            }
        };

        match frame {
            Frame::Subscribe { destination } => {
                if !may_subscribe(&identity, &destination) {
                    warn!(connection = id, identity = %identity, destination = %destination, "subscription refused");
                    if let Some(connection) = state.connections.get(&id) {
                        connection.reply(Frame::Error {
                            message: format!("Cannot subscribe to {destination}"),
                        });
                    }
                    return Ok(());
                }
                if let Some(connection) = state.connections.get_mut(&id) {
                    connection.subscriptions.insert(destination.clone());
                    connection.reply(Frame::Subscribed {
                        destination: destination.clone(),
                    });
                }
                state.subscribers.entry(destination).or_default().insert(id);
            }
            Frame::Unsubscribe { destination } => {
                if let Some(connection) = state.connections.get_mut(&id) {
                    connection.subscriptions.remove(&destination);
                }
                if let Some(set) = state.subscribers.get_mut(&destination) {
                    set.remove(&id);
                    if set.is_empty() {
                        state.subscribers.remove(&destination);
                    }
                }
            }
            Frame::Send { destination, body } => match route(&identity, &destination, &body) {
                Ok(deliveries) => {
                    for (target, body) in deliveries {
                        let count = state.deliver(&target, &body);
                        debug!(from = %identity, destination = %target, count, "delivered");
                    }
                }
                Err(e) => {
                    warn!(connection = id, identity = %identity, error = %e, "publish rejected");
                    if let Some(connection) = state.connections.get(&id) {
                        connection.reply(Frame::Error { message: e.to_string() });
                    }
                }
            },
            Frame::Pong => {}
            other => {
                warn!(connection = id, frame = ?other, "unexpected frame from client");
            }
        }
        Ok(())
    }

    /// Forget a connection and its subscriptions
    pub fn drop_connection(&self, id: ConnectionId) {
        if let Some(connection) = self.state.lock().detach(id) {
            debug!(connection = id, identity = ?connection.identity, "dropped");
        }
    }

    /// Forcibly close every connection of `identity`; returns how many
    pub fn kick(&self, identity: &str) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, c)| c.identity.as_deref() == Some(identity))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.detach(*id);
        }
        if !ids.is_empty() {
            info!(identity, count = ids.len(), "kicked");
        }
        ids.len()
    }

    /// Take the broker offline (dropping every connection) or back online
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            for id in ids {
                state.detach(id);
            }
            info!("broker offline");
        } else {
            info!("broker online");
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of connections subscribed to `destination`
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(destination)
            .map_or(0, BTreeSet::len)
    }
}

fn may_subscribe(identity: &str, destination: &str) -> bool {
    match destinations::owner(destination) {
        Some(owner) => owner == identity,
        None => destinations::group_of_topic(destination).is_some(),
    }
}
