//! Wire protocol between clients and the message broker
//!
//! Frames are JSON objects tagged `{"type": ..., "data": ...}`. Message
//! bodies are themselves JSON records ([`ChatRecord`], [`ReadReceipt`],
//! [`GroupRecord`]). Every payload arriving from the broker or the history
//! service goes through the `parse` functions here exactly once; the rest
//! of the crate only sees the canonical shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::MessageStatus;

mod timestamp;

/// Destination names
pub mod destinations {
    /// Publish a direct chat record
    pub const CHAT_SEND: &str = "/app/chat.send";
    /// Publish a read receipt
    pub const CHAT_READ: &str = "/app/chat.read";
    /// Publish a group record
    pub const GROUP_SEND: &str = "/app/group.send";

    const GROUP_TOPIC_PREFIX: &str = "/topic/group.";

    /// Private inbox of `user`
    pub fn inbox(user: &str) -> String {
        format!("/user/{user}/queue/messages")
    }

    /// Read receipts addressed to `user`
    pub fn receipts(user: &str) -> String {
        format!("/user/{user}/queue/receipts")
    }

    /// Topic carrying a group's messages
    pub fn group_topic(group: &str) -> String {
        format!("{GROUP_TOPIC_PREFIX}{group}")
    }

    /// Group id of a group topic destination
    pub fn group_of_topic(destination: &str) -> Option<&str> {
        destination
            .strip_prefix(GROUP_TOPIC_PREFIX)
            .filter(|group| !group.is_empty())
    }

    /// Owner of a `/user/{id}/...` destination
    pub fn owner(destination: &str) -> Option<&str> {
        destination
            .strip_prefix("/user/")
            .and_then(|rest| rest.split('/').next())
            .filter(|user| !user.is_empty())
    }
}

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload did not match any recognised shape
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A required field was empty or absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Publish to a destination nobody handles
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// Identity not allowed to use this destination or record
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Frames exchanged with the broker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum Frame {
    /// Announce the connecting identity
    Connect { identity: String },
    /// Handshake accepted
    Connected { identity: String },
    /// Start receiving a destination
    Subscribe { destination: String },
    /// Subscription is active
    Subscribed { destination: String },
    /// Stop receiving a destination
    Unsubscribe { destination: String },
    /// Publish a body to a destination
    Send { destination: String, body: String },
    /// Body delivered from a subscribed destination
    Message { destination: String, body: String },
    /// Broker-side failure
    Error { message: String },
    /// Keepalive
    Ping,
    /// Keepalive response
    Pong,
}

impl Frame {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(raw: &str) -> ProtocolResult<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// A direct message as carried by the broker and the history service
///
/// `content` is an [`EncryptedEnvelope`](crate::crypto::EncryptedEnvelope)
/// JSON for the receiver, or legacy plain text. `sender_content` is the
/// sender's own encrypted copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Server-assigned id; absent on outbound records
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "messageId")]
    pub id: Option<String>,
    /// Client-generated correlation id
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "tempId")]
    pub client_id: Option<String>,
    /// Author
    #[serde(alias = "sender", alias = "from")]
    pub sender_id: String,
    /// Addressee
    #[serde(alias = "receiver", alias = "recipientId", alias = "to")]
    pub receiver_id: String,
    /// Payload readable by the receiver
    #[serde(alias = "message", alias = "encryptedContent")]
    pub content: String,
    /// Payload readable by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_content: Option<String>,
    /// Creation time at the sender
    #[serde(alias = "timestamp", alias = "sentAt", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Status known to the server, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl ChatRecord {
    /// Parse and validate a record body
    pub fn parse(body: &str) -> ProtocolResult<Self> {
        let record: ChatRecord =
            serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Normalize an already-decoded JSON value
    pub fn from_value(value: serde_json::Value) -> ProtocolResult<Self> {
        let record: ChatRecord =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> ProtocolResult<()> {
        if self.sender_id.is_empty() {
            return Err(ProtocolError::MissingField("senderId"));
        }
        if self.receiver_id.is_empty() {
            return Err(ProtocolError::MissingField("receiverId"));
        }
        Ok(())
    }

    /// The server-assigned id, required on anything received
    pub fn require_id(&self) -> ProtocolResult<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingField("id"))
    }

    /// The content `own` is able to decrypt
    pub fn readable_content(&self, own: &str) -> &str {
        match &self.sender_content {
            Some(copy) if self.sender_id == own => copy,
            _ => &self.content,
        }
    }

    /// The other party of the conversation, seen from `own`
    pub fn peer_of(&self, own: &str) -> &str {
        if self.sender_id == own {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Serialize for publishing
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Notification that `reader_id` has read message `message_id`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// Id of the message that was read
    pub message_id: String,
    /// Who read it
    pub reader_id: String,
    /// Original sender, to whom the receipt is routed
    pub sender_id: String,
    /// When it was read
    #[serde(with = "timestamp")]
    pub read_at: DateTime<Utc>,
}

impl ReadReceipt {
    /// Parse and validate a receipt body
    pub fn parse(body: &str) -> ProtocolResult<Self> {
        let receipt: ReadReceipt =
            serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if receipt.message_id.is_empty() {
            return Err(ProtocolError::MissingField("messageId"));
        }
        if receipt.sender_id.is_empty() {
            return Err(ProtocolError::MissingField("senderId"));
        }
        Ok(receipt)
    }

    /// Serialize for publishing
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// A group message; group traffic is not end-to-end encrypted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    /// Server-assigned id; absent on outbound records
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "messageId")]
    pub id: Option<String>,
    /// Client-generated correlation id
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "tempId")]
    pub client_id: Option<String>,
    /// Group the message belongs to
    #[serde(alias = "roomId")]
    pub group_id: String,
    /// Author
    #[serde(alias = "sender", alias = "from")]
    pub sender_id: String,
    /// Message text
    #[serde(alias = "message")]
    pub content: String,
    /// Creation time at the sender
    #[serde(alias = "timestamp", alias = "sentAt", with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl GroupRecord {
    /// Parse and validate a group record body
    pub fn parse(body: &str) -> ProtocolResult<Self> {
        Self::from_value(
            serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
        )
    }

    /// Normalize an already-decoded JSON value
    pub fn from_value(value: serde_json::Value) -> ProtocolResult<Self> {
        let record: GroupRecord =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if record.group_id.is_empty() {
            return Err(ProtocolError::MissingField("groupId"));
        }
        if record.sender_id.is_empty() {
            return Err(ProtocolError::MissingField("senderId"));
        }
        Ok(record)
    }

    /// The server-assigned id, required on anything received
    pub fn require_id(&self) -> ProtocolResult<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingField("id"))
    }

    /// Serialize for publishing
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Broker-side fan-out of a published body
///
/// Returns `(destination, body)` deliveries. Direct records get a fresh
/// server id and go to the receiver's inbox plus (as the sender's own copy)
/// the sender's inbox; receipts go to the original sender; group records go
/// to the group topic.
pub fn route(identity: &str, destination: &str, body: &str) -> ProtocolResult<Vec<(String, String)>> {
    match destination {
        destinations::CHAT_SEND => {
            let mut record = ChatRecord::parse(body)?;
            if record.sender_id != identity {
                return Err(ProtocolError::Forbidden(format!(
                    "{identity} cannot send as {}",
                    record.sender_id
                )));
            }
            record.id = Some(Uuid::new_v4().to_string());
            record.status = None;

            let mut to_sender = record.clone();
            if let Some(copy) = to_sender.sender_content.take() {
                to_sender.content = copy;
            }
            let mut deliveries = vec![(destinations::inbox(&record.sender_id), to_sender.to_json()?)];

            if record.receiver_id != record.sender_id {
                let mut to_receiver = record;
                to_receiver.sender_content = None;
                deliveries.push((destinations::inbox(&to_receiver.receiver_id), to_receiver.to_json()?));
            }
            Ok(deliveries)
        }
        destinations::CHAT_READ => {
            let receipt = ReadReceipt::parse(body)?;
            if receipt.reader_id != identity {
                return Err(ProtocolError::Forbidden(format!(
                    "{identity} cannot acknowledge as {}",
                    receipt.reader_id
                )));
            }
            Ok(vec![(destinations::receipts(&receipt.sender_id), receipt.to_json()?)])
        }
        destinations::GROUP_SEND => {
            let mut record = GroupRecord::parse(body)?;
            if record.sender_id != identity {
                return Err(ProtocolError::Forbidden(format!(
                    "{identity} cannot send as {}",
                    record.sender_id
                )));
            }
            record.id = Some(Uuid::new_v4().to_string());
            Ok(vec![(destinations::group_topic(&record.group_id), record.to_json()?)])
        }
        other => Err(ProtocolError::UnknownDestination(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(sender: &str, receiver: &str) -> ChatRecord {
        ChatRecord {
            id: None,
            client_id: Some("c-1".to_string()),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: "for-receiver".to_string(),
            sender_content: Some("for-sender".to_string()),
            created_at: Utc::now(),
            status: None,
        }
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::Send {
            destination: destinations::CHAT_SEND.to_string(),
            body: "{}".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "Send");
        assert_eq!(json["data"]["destination"], destinations::CHAT_SEND);
        assert_eq!(Frame::from_json(&frame.to_json().unwrap()).unwrap(), frame);
        assert_eq!(Frame::from_json(r#"{"type":"Ping"}"#).unwrap(), Frame::Ping);
    }

    #[test]
    fn test_unknown_frame_is_malformed() {
        assert!(matches!(
            Frame::from_json(r#"{"type":"Explode"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(Frame::from_json("not json").is_err());
    }

    #[test]
    fn test_destination_helpers() {
        assert_eq!(destinations::inbox("bob"), "/user/bob/queue/messages");
        assert_eq!(destinations::owner("/user/bob/queue/receipts"), Some("bob"));
        assert_eq!(destinations::owner("/topic/group.g1"), None);
        assert_eq!(destinations::group_of_topic(&destinations::group_topic("g1")), Some("g1"));
        assert_eq!(destinations::group_of_topic("/topic/group."), None);
    }

    #[test]
    fn test_chat_record_legacy_field_names() {
        let body = r#"{
            "messageId": "m-7",
            "sender": "alice",
            "recipientId": "bob",
            "message": "hello",
            "timestamp": 1700000000000
        }"#;
        let record = ChatRecord::parse(body).unwrap();

        assert_eq!(record.require_id().unwrap(), "m-7");
        assert_eq!(record.sender_id, "alice");
        assert_eq!(record.receiver_id, "bob");
        assert_eq!(record.content, "hello");
        assert_eq!(record.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_chat_record_rejects_unrecognised_shapes() {
        assert!(ChatRecord::parse("{}").is_err());
        assert!(ChatRecord::parse("plain text").is_err());
        assert_eq!(
            ChatRecord::parse(r#"{"senderId":"","receiverId":"b","content":"x","createdAt":"2024-01-01T00:00:00Z"}"#),
            Err(ProtocolError::MissingField("senderId"))
        );
        let no_id = outbound("alice", "bob");
        assert_eq!(no_id.require_id(), Err(ProtocolError::MissingField("id")));
    }

    #[test]
    fn test_readable_content_and_peer() {
        let record = outbound("alice", "bob");
        assert_eq!(record.readable_content("alice"), "for-sender");
        assert_eq!(record.readable_content("bob"), "for-receiver");
        assert_eq!(record.peer_of("alice"), "bob");
        assert_eq!(record.peer_of("bob"), "alice");
    }

    #[test]
    fn test_route_chat_fans_out_with_shared_id() {
        let body = outbound("alice", "bob").to_json().unwrap();
        let deliveries = route("alice", destinations::CHAT_SEND, &body).unwrap();
        assert_eq!(deliveries.len(), 2);

        let (to_alice_dest, to_alice) = &deliveries[0];
        let (to_bob_dest, to_bob) = &deliveries[1];
        assert_eq!(to_alice_dest, &destinations::inbox("alice"));
        assert_eq!(to_bob_dest, &destinations::inbox("bob"));

        let to_alice = ChatRecord::parse(to_alice).unwrap();
        let to_bob = ChatRecord::parse(to_bob).unwrap();
        assert_eq!(to_alice.content, "for-sender");
        assert_eq!(to_bob.content, "for-receiver");
        assert!(to_bob.sender_content.is_none());
        assert_eq!(to_alice.id, to_bob.id);
        assert!(to_alice.id.is_some());
        assert_eq!(to_bob.client_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_route_note_to_self_delivers_once() {
        let body = outbound("alice", "alice").to_json().unwrap();
        assert_eq!(route("alice", destinations::CHAT_SEND, &body).unwrap().len(), 1);
    }

    #[test]
    fn test_route_rejects_spoofed_sender() {
        let body = outbound("alice", "bob").to_json().unwrap();
        assert!(matches!(
            route("mallory", destinations::CHAT_SEND, &body),
            Err(ProtocolError::Forbidden(_))
        ));
    }

    #[test]
    fn test_route_receipt_to_original_sender() {
        let receipt = ReadReceipt {
            message_id: "m-1".to_string(),
            reader_id: "bob".to_string(),
            sender_id: "alice".to_string(),
            read_at: Utc::now(),
        };
        let deliveries = route("bob", destinations::CHAT_READ, &receipt.to_json().unwrap()).unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, destinations::receipts("alice"));
        assert_eq!(ReadReceipt::parse(&deliveries[0].1).unwrap(), receipt);

        assert!(route("alice", destinations::CHAT_READ, &receipt.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_route_group_to_topic() {
        let record = GroupRecord {
            id: None,
            client_id: None,
            group_id: "g1".to_string(),
            sender_id: "alice".to_string(),
            content: "hello group".to_string(),
            created_at: Utc::now(),
        };
        let deliveries = route("alice", destinations::GROUP_SEND, &record.to_json().unwrap()).unwrap();

        assert_eq!(deliveries[0].0, destinations::group_topic("g1"));
        assert!(GroupRecord::parse(&deliveries[0].1).unwrap().require_id().is_ok());
    }

    #[test]
    fn test_route_unknown_destination() {
        assert_eq!(
            route("alice", "/app/nowhere", "{}"),
            Err(ProtocolError::UnknownDestination("/app/nowhere".to_string()))
        );
    }
}
