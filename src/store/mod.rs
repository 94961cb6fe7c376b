//! Local message stores
//!
//! - `conversation`: ordered per-peer message list and reconciliation
//! - `direct`: encrypted one-to-one conversations
//! - `group`: plaintext group conversations and rosters
//! - `refresh`: periodic background refresh tasks

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ClientConfig;
use crate::crypto::CryptoError;
use crate::transport::TransportError;

pub mod conversation;
pub mod direct;
pub mod group;
pub mod refresh;

pub use conversation::{Applied, Conversation};
pub use direct::MessageStore;
pub use group::GroupMessageStore;
pub use refresh::RefreshHandle;

/// Prefix of locally generated ids for messages not yet confirmed
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Store tuning
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Period of the selected conversation's refresh
    pub status_refresh: Duration,
    /// Period of the selected group's roster refresh
    pub roster_refresh: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for StoreOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            event_capacity: config.event_capacity,
            status_refresh: config.status_refresh(),
            roster_refresh: config.roster_refresh(),
        }
    }
}

/// Delivery status; only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Published by the sender
    #[serde(rename = "SENT", alias = "sent", alias = "Sent")]
    Sent,
    /// Reached the recipient
    #[serde(rename = "DELIVERED", alias = "delivered", alias = "Delivered")]
    Delivered,
    /// Read by the recipient
    #[serde(rename = "READ", alias = "read", alias = "Read")]
    Read,
}

/// A message as shown to the local user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a `tmp-` id while unconfirmed
    pub id: String,
    /// Correlation id shared by a temporary message and its echo
    pub client_id: Option<String>,
    /// Author
    pub sender_id: String,
    /// Peer id for direct messages, group id for group messages
    pub receiver_id: String,
    /// Decrypted text, or the undecryptable placeholder
    pub plaintext: String,
    /// Creation time at the sender
    pub created_at: DateTime<Utc>,
    /// Delivery status
    pub status: MessageStatus,
    /// Not yet confirmed by the broker
    pub is_temporary: bool,
    /// Publishing this temporary message failed
    pub send_failed: bool,
    /// The content could not be decrypted
    pub undecryptable: bool,
    pub(crate) seq: u64,
}

impl Message {
    /// A locally created message awaiting confirmation
    pub fn temporary(
        client_id: String,
        sender_id: &str,
        receiver_id: &str,
        plaintext: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{TEMP_ID_PREFIX}{client_id}"),
            client_id: Some(client_id),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            plaintext: plaintext.to_string(),
            created_at,
            status: MessageStatus::Sent,
            is_temporary: true,
            send_failed: false,
            undecryptable: false,
            seq: 0,
        }
    }

    /// A message confirmed by the broker or the history service
    #[allow(clippy::too_many_arguments)]
    pub fn confirmed(
        id: String,
        client_id: Option<String>,
        sender_id: &str,
        receiver_id: &str,
        plaintext: String,
        created_at: DateTime<Utc>,
        status: MessageStatus,
        undecryptable: bool,
    ) -> Self {
        Self {
            id,
            client_id,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            plaintext,
            created_at,
            status,
            is_temporary: false,
            send_failed: false,
            undecryptable,
            seq: 0,
        }
    }
}

/// Store change notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A message was appended or inserted
    MessageAdded {
        /// Peer or group id
        conversation: String,
        /// Id of the new message
        message_id: String,
    },
    /// A temporary message was replaced by its confirmed copy
    MessageConfirmed {
        /// Peer or group id
        conversation: String,
        /// The `tmp-` id that disappeared
        temp_id: String,
        /// The confirmed id
        message_id: String,
    },
    /// A message's status moved forward
    StatusChanged {
        /// Peer or group id
        conversation: String,
        /// Message id
        message_id: String,
        /// New status
        status: MessageStatus,
    },
    /// A temporary message could not be published
    SendFailed {
        /// Peer or group id
        conversation: String,
        /// The `tmp-` id
        message_id: String,
    },
    /// History loading started or finished
    LoadingChanged {
        /// Peer or group id
        conversation: String,
        /// Whether a fetch is in flight
        loading: bool,
    },
    /// History was merged
    HistoryMerged {
        /// Peer or group id
        conversation: String,
        /// Messages inserted or promoted
        changed: usize,
    },
    /// Selected conversation changed
    SelectionChanged {
        /// New selection
        conversation: Option<String>,
    },
    /// A group's member list was refreshed
    RosterUpdated {
        /// Group id
        group: String,
        /// Number of members
        members: usize,
    },
    /// Every conversation was dropped from memory
    Cleared,
}

/// Errors returned synchronously by `send` and `resend`
///
/// The message stays in the conversation, flagged as failed, so it can be
/// retried with `resend`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Nothing to send
    #[error("Message is empty")]
    Empty,

    /// The local identity has not been created
    #[error("No local identity")]
    NoIdentity,

    /// The recipient has no published public key
    #[error("No public key for {peer}")]
    MissingRecipientKey {
        /// Recipient
        peer: String,
        /// Id of the failed local message
        local_id: String,
    },

    /// Encryption failed
    #[error("Encryption failed: {source}")]
    Crypto {
        /// Id of the failed local message
        local_id: String,
        /// Underlying error
        #[source]
        source: CryptoError,
    },

    /// The broker connection refused the publish
    #[error("Could not publish: {source}")]
    Transport {
        /// Id of the failed local message
        local_id: String,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// No such message in the conversation
    #[error("Unknown message {0}")]
    UnknownMessage(String),

    /// Only failed temporary messages can be resent
    #[error("Message {0} is not a failed send")]
    NotFailed(String),
}

impl SendError {
    /// Id of the local message the error refers to, if any
    pub fn local_id(&self) -> Option<&str> {
        match self {
            SendError::MissingRecipientKey { local_id, .. }
            | SendError::Crypto { local_id, .. }
            | SendError::Transport { local_id, .. } => Some(local_id),
            SendError::UnknownMessage(id) | SendError::NotFailed(id) => Some(id),
            SendError::Empty | SendError::NoIdentity => None,
        }
    }
}

/// History loads in flight, counted per conversation
///
/// Overlapping loads of one conversation keep it loading until the last
/// of them finishes.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlight {
    /// Count a load of `key` as started; true if it is the only one
    pub(crate) fn start(&self, key: &str) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count a load of `key` as finished; true if none is left
    pub(crate) fn finish(&self, key: &str) -> bool {
        let mut counts = self.counts.lock();
        match counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.counts.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_loads_stay_in_flight() {
        let loads = InFlight::default();
        assert!(loads.start("bob"));
        assert!(!loads.start("bob"));
        assert!(loads.start("carol"));

        assert!(!loads.finish("bob"));
        assert!(loads.contains("bob"));
        assert!(loads.finish("bob"));
        assert!(!loads.contains("bob"));
        assert!(loads.contains("carol"));

        // Unbalanced finish is ignored
        assert!(!loads.finish("bob"));
        assert!(!loads.contains("bob"));
    }

    #[test]
    fn test_status_order() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
        assert_eq!(MessageStatus::Sent.max(MessageStatus::Read), MessageStatus::Read);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&MessageStatus::Delivered).unwrap(), "\"DELIVERED\"");
        assert_eq!(
            serde_json::from_str::<MessageStatus>("\"read\"").unwrap(),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_temporary_ids() {
        let message = Message::temporary("abc".into(), "alice", "bob", "hi", Utc::now());
        assert_eq!(message.id, "tmp-abc");
        assert!(message.is_temporary);
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_send_error_local_id() {
        let err = SendError::Transport {
            local_id: "tmp-1".into(),
            source: TransportError::NotConnected,
        };
        assert_eq!(err.local_id(), Some("tmp-1"));
        assert_eq!(SendError::Empty.local_id(), None);
    }
}
