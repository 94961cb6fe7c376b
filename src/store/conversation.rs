//! Ordered message list for one peer or group
//!
//! Messages are kept sorted by `created_at`, ties broken by insertion
//! order. Inserting never moves messages already in the list relative to
//! each other.
//!
//! Reconciliation of a confirmed message, in order:
//! 1. a message with the same id exists: only its status may move forward
//! 2. a temporary message with the same correlation id: replaced
//! 3. no correlation id on the confirmed copy: the oldest non-failed
//!    temporary with the same sender and text is replaced
//! 4. otherwise the message is inserted

use super::{Message, MessageStatus};

/// Outcome of [`Conversation::apply_confirmed`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// New message inserted
    Inserted,
    /// A temporary message was replaced
    Reconciled {
        /// The replaced `tmp-` id
        temp_id: String,
    },
    /// Existing message's status moved forward
    Promoted(MessageStatus),
    /// Already known, nothing changed
    Unchanged,
}

/// Sorted, duplicate-free message sequence
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    next_seq: u64,
}

impl Conversation {
    /// Empty conversation
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in display order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if there are no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message by id
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, mut message: Message, seq: Option<u64>) {
        message.seq = seq.unwrap_or_else(|| {
            self.next_seq += 1;
            self.next_seq
        });
        let key = (message.created_at, message.seq);
        let at = self.messages.partition_point(|m| (m.created_at, m.seq) <= key);
        self.messages.insert(at, message);
    }

    /// Add a locally created temporary message
    pub fn push_temporary(&mut self, message: Message) {
        debug_assert!(message.is_temporary);
        self.insert_sorted(message, None);
    }

    /// Flag a temporary message as failed; false if no such temporary
    pub fn mark_failed(&mut self, id: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id && m.is_temporary) {
            Some(message) => {
                message.send_failed = true;
                true
            }
            None => false,
        }
    }

    /// Clear the failed flag before a retry; returns the message if it was
    /// a failed temporary
    pub fn clear_failed(&mut self, id: &str) -> Option<&Message> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.is_temporary && m.send_failed)?;
        message.send_failed = false;
        Some(message)
    }

    /// Move a message's status forward; returns true if it changed
    pub fn promote(&mut self, id: &str, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if status > message.status => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    /// Merge a confirmed message
    pub fn apply_confirmed(&mut self, message: Message) -> Applied {
        if let Some(at) = self.position(&message.id) {
            let existing = &mut self.messages[at];
            if message.status > existing.status {
                existing.status = message.status;
                return Applied::Promoted(message.status);
            }
            return Applied::Unchanged;
        }

        match self.find_temporary(&message) {
            Some((at, by_correlation)) => {
                let temp = self.messages.remove(at);
                let mut confirmed = message;
                confirmed.status = confirmed.status.max(temp.status);
                if by_correlation && confirmed.undecryptable {
                    confirmed.plaintext = temp.plaintext;
                    confirmed.undecryptable = false;
                }
                let temp_id = temp.id;
                self.insert_sorted(confirmed, Some(temp.seq));
                Applied::Reconciled { temp_id }
            }
            None => {
                self.insert_sorted(message, None);
                Applied::Inserted
            }
        }
    }

    fn find_temporary(&self, confirmed: &Message) -> Option<(usize, bool)> {
        if let Some(client_id) = &confirmed.client_id {
            return self
                .messages
                .iter()
                .position(|m| m.is_temporary && m.client_id.as_ref() == Some(client_id))
                .map(|at| (at, true));
        }
        self.messages
            .iter()
            .position(|m| {
                m.is_temporary
                    && !m.send_failed
                    && m.sender_id == confirmed.sender_id
                    && m.plaintext == confirmed.plaintext
            })
            .map(|at| (at, false))
    }

    /// Merge fetched messages; returns how many were inserted, reconciled
    /// or promoted
    pub fn merge_history(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages
            .into_iter()
            .map(|message| self.apply_confirmed(message))
            .filter(|applied| *applied != Applied::Unchanged)
            .count()
    }

    /// Confirmed messages from others not yet read, oldest first
    pub fn unread_inbound<'a>(&'a self, own: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .iter()
            .filter(move |m| !m.is_temporary && m.sender_id != own && m.status < MessageStatus::Read)
    }

    /// Temporary messages still awaiting confirmation
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_temporary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap()
    }

    fn confirmed(id: &str, client_id: Option<&str>, sender: &str, text: &str, when: DateTime<Utc>) -> Message {
        Message::confirmed(
            id.into(),
            client_id.map(str::to_string),
            sender,
            "peer",
            text.into(),
            when,
            MessageStatus::Delivered,
            false,
        )
    }

    fn ids(conversation: &Conversation) -> Vec<&str> {
        conversation.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_sorted_with_stable_ties() {
        let mut c = Conversation::new();
        c.apply_confirmed(confirmed("b", None, "x", "1", at(10)));
        c.apply_confirmed(confirmed("a", None, "x", "2", at(5)));
        c.apply_confirmed(confirmed("c", None, "x", "3", at(10)));

        assert_eq!(ids(&c), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reconcile_by_correlation_id() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("c1".into(), "me", "peer", "hello", at(1)));

        let applied = c.apply_confirmed(confirmed("m1", Some("c1"), "me", "hello", at(1)));
        assert_eq!(applied, Applied::Reconciled { temp_id: "tmp-c1".into() });
        assert_eq!(ids(&c), vec!["m1"]);
        assert!(!c.messages()[0].is_temporary);
    }

    #[test]
    fn test_undecryptable_echo_keeps_local_text() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("c1".into(), "me", "peer", "secret", at(1)));

        let mut echo = confirmed("m1", Some("c1"), "me", "[Unable to decrypt message]", at(1));
        echo.undecryptable = true;
        c.apply_confirmed(echo);

        assert_eq!(c.messages()[0].plaintext, "secret");
        assert!(!c.messages()[0].undecryptable);
    }

    #[test]
    fn test_legacy_heuristic_skips_failed_and_takes_oldest() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("failed".into(), "me", "peer", "hi", at(1)));
        c.mark_failed("tmp-failed");
        c.push_temporary(Message::temporary("old".into(), "me", "peer", "hi", at(2)));
        c.push_temporary(Message::temporary("new".into(), "me", "peer", "hi", at(3)));

        let applied = c.apply_confirmed(confirmed("m1", None, "me", "hi", at(2)));

        assert_eq!(applied, Applied::Reconciled { temp_id: "tmp-old".into() });
        assert_eq!(ids(&c), vec!["tmp-failed", "m1", "tmp-new"]);
    }

    #[test]
    fn test_correlation_id_never_falls_back_to_heuristic() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("c1".into(), "me", "peer", "hi", at(1)));

        let applied = c.apply_confirmed(confirmed("m1", Some("other"), "me", "hi", at(1)));
        assert_eq!(applied, Applied::Inserted);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("c1".into(), "me", "peer", "hello", at(1)));
        let echo = confirmed("m1", Some("c1"), "me", "hello", at(1));

        c.apply_confirmed(echo.clone());
        let snapshot = c.messages().to_vec();
        assert_eq!(c.apply_confirmed(echo.clone()), Applied::Unchanged);
        assert_eq!(c.merge_history(vec![echo]), 0);

        assert_eq!(c.messages(), snapshot.as_slice());
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let mut c = Conversation::new();
        c.apply_confirmed(confirmed("m1", None, "peer", "hi", at(1)));

        assert!(c.promote("m1", MessageStatus::Read));
        assert!(!c.promote("m1", MessageStatus::Delivered));
        assert!(!c.promote("m1", MessageStatus::Read));

        let mut stale = confirmed("m1", None, "peer", "hi", at(1));
        stale.status = MessageStatus::Sent;
        assert_eq!(c.apply_confirmed(stale), Applied::Unchanged);
        assert_eq!(c.get("m1").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_reconciled_status_keeps_maximum() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("c1".into(), "me", "peer", "hello", at(1)));
        c.promote("tmp-c1", MessageStatus::Read);

        c.apply_confirmed(confirmed("m1", Some("c1"), "me", "hello", at(1)));
        assert_eq!(c.get("m1").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_merge_history_preserves_displayed_order() {
        let mut c = Conversation::new();
        c.apply_confirmed(confirmed("live-1", None, "peer", "a", at(10)));
        c.push_temporary(Message::temporary("t".into(), "me", "peer", "b", at(20)));

        let history = vec![
            confirmed("old-1", None, "peer", "x", at(1)),
            confirmed("live-1", None, "peer", "a", at(10)),
            confirmed("mid", None, "me", "y", at(15)),
        ];
        assert_eq!(c.merge_history(history), 2);

        assert_eq!(ids(&c), vec!["old-1", "live-1", "mid", "tmp-t"]);
        let times: Vec<_> = c.messages().iter().map(|m| m.created_at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_unread_inbound_and_pending() {
        let mut c = Conversation::new();
        c.apply_confirmed(confirmed("in-1", None, "peer", "a", at(1)));
        c.apply_confirmed(confirmed("out-1", None, "me", "b", at(2)));
        c.apply_confirmed(confirmed("in-2", None, "peer", "c", at(3)));
        c.promote("in-2", MessageStatus::Read);
        c.push_temporary(Message::temporary("t".into(), "me", "peer", "d", at(4)));

        let unread: Vec<_> = c.unread_inbound("me").map(|m| m.id.as_str()).collect();
        assert_eq!(unread, vec!["in-1"]);
        assert_eq!(c.pending().count(), 1);
    }

    #[test]
    fn test_failed_flag_round_trip() {
        let mut c = Conversation::new();
        c.push_temporary(Message::temporary("t".into(), "me", "peer", "d", at(4) + Duration::seconds(1)));

        assert!(c.clear_failed("tmp-t").is_none());
        assert!(c.mark_failed("tmp-t"));
        assert!(c.clear_failed("tmp-t").is_some());
        assert!(!c.get("tmp-t").unwrap().send_failed);
        assert!(!c.mark_failed("missing"));
    }
}
