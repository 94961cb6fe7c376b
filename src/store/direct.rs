//! Encrypted one-to-one conversations
//!
//! Outbound text is encrypted twice: once for the peer and once for the
//! local identity, so the broker's echo and the history service both carry
//! a copy the sender can read. Inbound records are decrypted one by one; a
//! record that cannot be decrypted becomes the placeholder text and never
//! stops the records after it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conversation::{Applied, Conversation};
use super::refresh::RefreshHandle;
use super::{InFlight, Message, MessageStatus, SendError, StoreEvent, StoreOptions};
use crate::api::{ApiResult, HistoryService, KeyDirectory};
use crate::crypto::{CryptoEngine, Decrypted, EncryptedEnvelope, KeyPair, PublicKey};
use crate::keystore::KeyStore;
use crate::protocol::{destinations, ChatRecord, ReadReceipt};
use crate::transport::{Delivery, Transport, TransportError};

/// Per-peer conversations of the local user
pub struct MessageStore {
    own_id: String,
    keys: Arc<KeyStore>,
    engine: CryptoEngine,
    transport: Arc<Transport>,
    directory: Arc<dyn KeyDirectory>,
    history: Arc<dyn HistoryService>,
    options: StoreOptions,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
    index: RwLock<HashMap<String, String>>,
    selected: RwLock<Option<String>>,
    loading: InFlight,
    refresh: Mutex<Option<RefreshHandle>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessageStore {
    /// Create a store for `own_id`
    pub fn new(
        own_id: &str,
        keys: Arc<KeyStore>,
        transport: Arc<Transport>,
        directory: Arc<dyn KeyDirectory>,
        history: Arc<dyn HistoryService>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Arc::new(Self {
            own_id: own_id.to_string(),
            keys,
            engine: CryptoEngine::new(),
            transport,
            directory,
            history,
            options,
            conversations: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            selected: RwLock::new(None),
            loading: InFlight::default(),
            refresh: Mutex::new(None),
            events,
        })
    }

    /// Local user id
    pub fn own_id(&self) -> &str {
        &self.own_id
    }

    /// Receive store change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the conversation with `peer`
    pub fn messages_for_peer(&self, peer: &str) -> Vec<Message> {
        self.conversation(peer)
            .map(|c| c.messages().to_vec())
            .unwrap_or_default()
    }

    /// Shared snapshot of the conversation with `peer`
    pub fn conversation(&self, peer: &str) -> Option<Arc<Conversation>> {
        self.conversations.read().get(peer).cloned()
    }

    /// Peers with at least one message
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.conversations.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Status of a message by id
    pub fn status(&self, message_id: &str) -> Option<MessageStatus> {
        let peer = self.index.read().get(message_id).cloned()?;
        self.conversation(&peer)?.get(message_id).map(|m| m.status)
    }

    /// True while a history fetch for `peer` is in flight
    pub fn is_loading_history(&self, peer: &str) -> bool {
        self.loading.contains(peer)
    }

    /// Currently selected peer
    pub fn selected_peer(&self) -> Option<String> {
        self.selected.read().clone()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn mutate<R>(&self, peer: &str, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut conversations = self.conversations.write();
        let conversation = conversations.entry(peer.to_string()).or_default();
        f(Arc::make_mut(conversation))
    }

    fn remember(&self, message_id: &str, peer: &str) {
        self.index
            .write()
            .insert(message_id.to_string(), peer.to_string());
    }

    /// Public key of `peer` from the contact cache, else from the directory
    pub async fn resolve_key(&self, peer: &str) -> Option<PublicKey> {
        if let Ok(key) = self.keys.get_public_key(peer) {
            return Some(key);
        }
        match self.directory.fetch_public_key(peer).await {
            Ok(Some(key)) => {
                if let Err(e) = self.keys.cache_public_key(peer, key.clone()) {
                    warn!(peer, error = %e, "could not cache public key");
                }
                Some(key)
            }
            Ok(None) => {
                debug!(peer, "peer has no published key");
                None
            }
            Err(e) => {
                warn!(peer, error = %e, "key lookup failed");
                None
            }
        }
    }

    /// Send `text` to `peer`
    ///
    /// The message is appended immediately as a temporary `Sent` message and
    /// its local id returned. On error it stays in the conversation flagged
    /// as failed.
    pub async fn send(&self, peer: &str, text: &str) -> Result<String, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::Empty);
        }
        if self.keys.identity().is_none() {
            return Err(SendError::NoIdentity);
        }

        let message = Message::temporary(Uuid::new_v4().to_string(), &self.own_id, peer, text, Utc::now());
        let local_id = message.id.clone();
        self.mutate(peer, |c| c.push_temporary(message));
        self.remember(&local_id, peer);
        self.emit(StoreEvent::MessageAdded {
            conversation: peer.to_string(),
            message_id: local_id.clone(),
        });

        self.publish_temporary(peer, &local_id).await?;
        Ok(local_id)
    }

    /// Retry a failed temporary message, keeping its correlation id
    pub async fn resend(&self, peer: &str, local_id: &str) -> Result<(), SendError> {
        let retried = self.mutate(peer, |c| match c.get(local_id) {
            None => Err(SendError::UnknownMessage(local_id.to_string())),
            Some(_) => c
                .clear_failed(local_id)
                .map(|_| ())
                .ok_or_else(|| SendError::NotFailed(local_id.to_string())),
        });
        retried?;
        self.publish_temporary(peer, local_id).await
    }

    async fn publish_temporary(&self, peer: &str, local_id: &str) -> Result<(), SendError> {
        let Some(message) = self.conversation(peer).and_then(|c| c.get(local_id).cloned()) else {
            return Err(SendError::UnknownMessage(local_id.to_string()));
        };
        let Some(identity) = self.keys.identity() else {
            self.fail(peer, local_id);
            return Err(SendError::NoIdentity);
        };

        let Some(peer_key) = self.resolve_key(peer).await else {
            self.fail(peer, local_id);
            return Err(SendError::MissingRecipientKey {
                peer: peer.to_string(),
                local_id: local_id.to_string(),
            });
        };

        let sealed = self
            .seal(&message.plaintext, &peer_key)
            .and_then(|content| Ok((content, self.seal(&message.plaintext, identity.public_key())?)));
        let (content, sender_content) = match sealed {
            Ok(pair) => pair,
            Err(source) => {
                self.fail(peer, local_id);
                return Err(SendError::Crypto {
                    local_id: local_id.to_string(),
                    source,
                });
            }
        };

        let record = ChatRecord {
            id: None,
            client_id: message.client_id.clone(),
            sender_id: self.own_id.clone(),
            receiver_id: peer.to_string(),
            content,
            sender_content: Some(sender_content),
            created_at: message.created_at,
            status: None,
        };
        let published = match record.to_json() {
            Ok(body) => self.transport.publish(destinations::CHAT_SEND, &body).await,
            Err(e) => Err(TransportError::InvalidData(e.to_string())),
        };

        if let Err(source) = published {
            warn!(peer, local_id, error = %source, "publish failed");
            self.fail(peer, local_id);
            return Err(SendError::Transport {
                local_id: local_id.to_string(),
                source,
            });
        }
        debug!(peer, local_id, "published");
        Ok(())
    }

    fn seal(&self, plaintext: &str, recipient: &PublicKey) -> crate::crypto::CryptoResult<String> {
        self.engine.encrypt(plaintext, recipient)?.to_json()
    }

    fn fail(&self, peer: &str, local_id: &str) {
        if self.mutate(peer, |c| c.mark_failed(local_id)) {
            self.emit(StoreEvent::SendFailed {
                conversation: peer.to_string(),
                message_id: local_id.to_string(),
            });
        }
    }

    fn decode(&self, record: &ChatRecord, id: &str, identity: Option<&KeyPair>, status: MessageStatus) -> Message {
        let raw = record.readable_content(&self.own_id);
        let decrypted = if CryptoEngine::is_envelope(raw) {
            match (EncryptedEnvelope::from_json(raw), identity) {
                (Ok(envelope), Some(pair)) => self.engine.decrypt(&envelope, pair.private_key()),
                _ => Decrypted::Undecryptable,
            }
        } else {
            Decrypted::Plaintext(raw.to_string())
        };

        if decrypted.is_undecryptable() {
            debug!(message_id = id, sender = %record.sender_id, "undecryptable message");
        }
        let undecryptable = decrypted.is_undecryptable();
        Message::confirmed(
            id.to_string(),
            record.client_id.clone(),
            &record.sender_id,
            &record.receiver_id,
            decrypted.into_text(),
            record.created_at,
            status,
            undecryptable,
        )
    }

    /// Merge a record pushed by the broker
    pub fn on_inbound(&self, record: ChatRecord) {
        let id = match record.require_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(error = %e, "dropping inbound record");
                return;
            }
        };
        if record.sender_id != self.own_id && record.receiver_id != self.own_id {
            warn!(message_id = %id, "dropping record addressed to someone else");
            return;
        }

        let peer = record.peer_of(&self.own_id).to_string();
        let status = record
            .status
            .map_or(MessageStatus::Delivered, |s| s.max(MessageStatus::Delivered));
        let identity = self.keys.identity();
        let message = self.decode(&record, &id, identity.as_deref(), status);

        let applied = self.mutate(&peer, |c| c.apply_confirmed(message));
        self.remember(&id, &peer);
        self.announce(&peer, &id, applied);
    }

    fn announce(&self, peer: &str, message_id: &str, applied: Applied) {
        let conversation = peer.to_string();
        let message_id = message_id.to_string();
        match applied {
            Applied::Inserted => self.emit(StoreEvent::MessageAdded {
                conversation,
                message_id,
            }),
            Applied::Reconciled { temp_id } => {
                self.index.write().remove(&temp_id);
                self.emit(StoreEvent::MessageConfirmed {
                    conversation,
                    temp_id,
                    message_id,
                })
            }
            Applied::Promoted(status) => self.emit(StoreEvent::StatusChanged {
                conversation,
                message_id,
                status,
            }),
            Applied::Unchanged => {}
        }
    }

    /// Apply a read receipt for one of our messages
    pub fn on_receipt(&self, receipt: ReadReceipt) {
        let peer = match self.index.read().get(&receipt.message_id) {
            Some(peer) => peer.clone(),
            None => {
                debug!(message_id = %receipt.message_id, "receipt for unknown message");
                return;
            }
        };
        if self.mutate(&peer, |c| c.promote(&receipt.message_id, MessageStatus::Read)) {
            self.emit(StoreEvent::StatusChanged {
                conversation: peer,
                message_id: receipt.message_id,
                status: MessageStatus::Read,
            });
        }
    }

    /// Transport callback for inbox deliveries
    pub fn handle_delivery(self: &Arc<Self>, delivery: &Delivery) {
        if delivery.destination != destinations::inbox(&self.own_id) {
            return;
        }
        let record = match ChatRecord::parse(&delivery.body) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "dropping malformed chat record");
                return;
            }
        };

        let peer = record.peer_of(&self.own_id).to_string();
        let from_peer = record.sender_id != self.own_id;
        self.on_inbound(record);

        // Messages arriving in the open conversation are read right away
        if from_peer && self.selected_peer().as_deref() == Some(peer.as_str()) {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                store.mark_conversation_read(&peer).await;
            });
        }
    }

    /// Transport callback for receipt deliveries
    pub fn handle_receipt(&self, delivery: &Delivery) {
        match ReadReceipt::parse(&delivery.body) {
            Ok(receipt) => self.on_receipt(receipt),
            Err(e) => warn!(error = %e, "dropping malformed receipt"),
        }
    }

    /// Fetch and merge the stored conversation with `peer`
    ///
    /// Returns how many messages changed. A result that arrives after the
    /// selection moved to another peer is discarded.
    pub async fn load_history(&self, peer: &str) -> ApiResult<usize> {
        let selected_before = self.selected_peer();
        if self.loading.start(peer) {
            self.emit(StoreEvent::LoadingChanged {
                conversation: peer.to_string(),
                loading: true,
            });
        }

        let fetched = self.history.direct_history(&self.own_id, peer).await;

        if self.loading.finish(peer) {
            self.emit(StoreEvent::LoadingChanged {
                conversation: peer.to_string(),
                loading: false,
            });
        }
        let records = fetched?;

        let selected_now = self.selected_peer();
        if selected_now != selected_before && selected_now.as_deref() != Some(peer) {
            debug!(peer, "discarding history for deselected peer");
            return Ok(0);
        }

        let identity = self.keys.identity();
        let mut messages: Vec<Message> = records
            .iter()
            .filter(|r| r.peer_of(&self.own_id) == peer)
            .filter_map(|r| match r.require_id() {
                Ok(id) => {
                    let status = r.status.unwrap_or(MessageStatus::Delivered);
                    Some(self.decode(r, id, identity.as_deref(), status))
                }
                Err(e) => {
                    warn!(peer, sender = %r.sender_id, error = %e, "dropping history record");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let changed = self.mutate(peer, |c| c.merge_history(messages));
        {
            let mut index = self.index.write();
            for id in ids {
                index.insert(id, peer.to_string());
            }
        }

        info!(peer, fetched = records.len(), changed, "history merged");
        self.emit(StoreEvent::HistoryMerged {
            conversation: peer.to_string(),
            changed,
        });
        Ok(changed)
    }

    /// Mark every unread message from `peer` as read
    ///
    /// Statuses change locally first; one receipt per message is then
    /// published. Returns the number of messages marked.
    pub async fn mark_conversation_read(&self, peer: &str) -> usize {
        let own = self.own_id.clone();
        let marked: Vec<String> = self.mutate(peer, |c| {
            let ids: Vec<String> = c.unread_inbound(&own).map(|m| m.id.clone()).collect();
            for id in &ids {
                c.promote(id, MessageStatus::Read);
            }
            ids
        });

        for id in &marked {
            self.emit(StoreEvent::StatusChanged {
                conversation: peer.to_string(),
                message_id: id.clone(),
                status: MessageStatus::Read,
            });
        }

        for id in &marked {
            let receipt = ReadReceipt {
                message_id: id.clone(),
                reader_id: self.own_id.clone(),
                sender_id: peer.to_string(),
                read_at: Utc::now(),
            };
            let published = match receipt.to_json() {
                Ok(body) => self.transport.publish(destinations::CHAT_READ, &body).await,
                Err(e) => Err(TransportError::InvalidData(e.to_string())),
            };
            if let Err(e) = published {
                warn!(peer, message_id = %id, error = %e, "read receipt not sent");
            }
        }
        marked.len()
    }

    /// Open the conversation with `peer`
    ///
    /// Resolves the peer's key, loads history, marks it read and keeps
    /// refreshing it periodically until [`deselect`](Self::deselect).
    pub async fn select_peer(self: &Arc<Self>, peer: &str) -> ApiResult<()> {
        *self.selected.write() = Some(peer.to_string());
        self.emit(StoreEvent::SelectionChanged {
            conversation: Some(peer.to_string()),
        });

        let weak = Arc::downgrade(self);
        let target = peer.to_string();
        let handle = RefreshHandle::spawn(self.options.status_refresh, move || {
            refresh_tick(weak.clone(), target.clone())
        });
        *self.refresh.lock() = Some(handle);

        if self.resolve_key(peer).await.is_none() {
            debug!(peer, "no key yet; sending will fail until one is published");
        }
        let loaded = self.load_history(peer).await;
        if let Err(e) = &loaded {
            warn!(peer, error = %e, "history load failed");
        }
        self.mark_conversation_read(peer).await;
        loaded.map(|_| ())
    }

    /// Close the selected conversation
    pub fn deselect(&self) {
        if let Some(handle) = self.refresh.lock().take() {
            handle.cancel();
        }
        if self.selected.write().take().is_some() {
            self.emit(StoreEvent::SelectionChanged { conversation: None });
        }
    }

    /// Deselect and drop every conversation held in memory
    pub fn clear(&self) {
        self.deselect();
        self.conversations.write().clear();
        self.index.write().clear();
        self.emit(StoreEvent::Cleared);
    }
}

async fn refresh_tick(store: Weak<MessageStore>, peer: String) -> bool {
    let Some(store) = store.upgrade() else {
        return false;
    };
    if store.selected_peer().as_deref() != Some(peer.as_str()) {
        return false;
    }
    if let Err(e) = store.load_history(&peer).await {
        debug!(peer = %peer, error = %e, "status refresh failed");
    }
    store.mark_conversation_read(&peer).await;
    true
}
