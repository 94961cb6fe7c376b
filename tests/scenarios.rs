//! End-to-end chat scenarios over the in-process broker

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use whisperline::api::MemoryDirectory;
use whisperline::broker::Broker;
use whisperline::crypto::{CryptoEngine, UNDECRYPTABLE_PLACEHOLDER};
use whisperline::protocol::{destinations, ChatRecord};
use whisperline::transport::{Delivery, MemoryConnector, TransportConfig};
use whisperline::{
    ChatClient, ClientConfig, ConnectionState, MessageStatus, SendError, Services, Transport, TransportError,
};

struct Network {
    dir: TempDir,
    broker: Arc<Broker>,
    directory: Arc<MemoryDirectory>,
}

impl Network {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            broker: Arc::new(Broker::new()),
            directory: Arc::new(MemoryDirectory::new()),
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            data_dir: self.dir.path().to_path_buf(),
            ..ClientConfig::default()
        }
    }

    fn client(&self, user: &str) -> ChatClient {
        ChatClient::with_parts(
            user,
            &self.config(),
            Arc::new(MemoryConnector::new(Arc::clone(&self.broker))),
            Services::shared(Arc::clone(&self.directory)),
        )
        .unwrap()
    }

    async fn raw_transport(&self, identity: &str) -> Transport {
        let transport = Transport::new(
            Arc::new(MemoryConnector::new(Arc::clone(&self.broker))),
            TransportConfig::default(),
        );
        transport.connect(identity).await.unwrap();
        transport
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn plain_record(id: &str, sender: &str, receiver: &str, text: &str, minutes_ago: i64) -> ChatRecord {
    ChatRecord {
        id: Some(id.into()),
        client_id: None,
        sender_id: sender.into(),
        receiver_id: receiver.into(),
        content: text.into(),
        sender_content: None,
        created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        status: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn send_while_disconnected_fails_then_resends() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    bob.connect().await.unwrap();
    alice.initialize().await.unwrap();

    let err = alice.messages().send("bob", "are you there?").await.unwrap_err();
    assert!(matches!(err, SendError::Transport { source: TransportError::NotConnected, .. }));
    let local_id = err.local_id().unwrap().to_string();

    let pending = alice.messages().messages_for_peer("bob");
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_temporary);
    assert!(pending[0].send_failed);
    assert!(bob.messages().messages_for_peer("alice").is_empty());

    alice.connect().await.unwrap();
    // Coming back online does not send on its own
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.messages().messages_for_peer("alice").is_empty());
    assert!(alice.messages().messages_for_peer("bob")[0].send_failed);

    alice.messages().resend("bob", &local_id).await.unwrap();

    eventually("bob to receive", || bob.messages().messages_for_peer("alice").len() == 1).await;
    assert_eq!(bob.messages().messages_for_peer("alice")[0].plaintext, "are you there?");

    eventually("alice's echo", || {
        let messages = alice.messages().messages_for_peer("bob");
        messages.len() == 1 && !messages[0].is_temporary
    })
    .await;
    let confirmed = &alice.messages().messages_for_peer("bob")[0];
    assert_eq!(confirmed.plaintext, "are you there?");
    assert_eq!(confirmed.status, MessageStatus::Delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_send_survives_reconnect_until_resent() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    assert_eq!(net.broker.kick("alice"), 1);
    eventually("alice to notice the drop", || alice.state() != ConnectionState::Connected).await;

    let err = alice.messages().send("bob", "lost in transit").await.unwrap_err();
    assert!(matches!(err, SendError::Transport { source: TransportError::NotConnected, .. }));
    let local_id = err.local_id().unwrap().to_string();

    eventually("alice to reconnect", || alice.state() == ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.messages().messages_for_peer("alice").is_empty());
    let pending = alice.messages().messages_for_peer("bob");
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_temporary);
    assert!(pending[0].send_failed);

    alice.messages().resend("bob", &local_id).await.unwrap();
    eventually("bob to receive", || bob.messages().messages_for_peer("alice").len() == 1).await;
    assert_eq!(bob.messages().messages_for_peer("alice")[0].plaintext, "lost in transit");
    eventually("alice's echo", || {
        let messages = alice.messages().messages_for_peer("bob");
        messages.len() == 1 && !messages[0].is_temporary && !messages[0].send_failed
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_key_then_second_send_is_a_distinct_message() {
    let net = Network::new();
    let alice = net.client("alice");
    alice.connect().await.unwrap();

    let err = alice.messages().send("carol", "first").await.unwrap_err();
    assert!(matches!(err, SendError::MissingRecipientKey { ref peer, .. } if peer == "carol"));
    let first_id = err.local_id().unwrap().to_string();

    let carol = net.client("carol");
    carol.connect().await.unwrap();

    let second_id = alice.messages().send("carol", "second").await.unwrap();
    assert_ne!(first_id, second_id);

    eventually("carol to receive", || carol.messages().messages_for_peer("alice").len() == 1).await;
    assert_eq!(carol.messages().messages_for_peer("alice")[0].plaintext, "second");

    eventually("alice's echo", || {
        alice
            .messages()
            .messages_for_peer("carol")
            .iter()
            .any(|m| !m.is_temporary && m.plaintext == "second")
    })
    .await;
    let mine = alice.messages().messages_for_peer("carol");
    assert_eq!(mine.len(), 2);
    let failed = mine.iter().find(|m| m.id == first_id).unwrap();
    assert!(failed.send_failed);
    assert_eq!(failed.plaintext, "first");
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_key_shows_placeholder_and_next_message_decrypts() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    let alice_key = alice.initialize().await.unwrap();
    bob.connect().await.unwrap();
    let bob_key = bob.keys().identity().unwrap();
    let mallory = net.raw_transport("mallory").await;

    let engine = CryptoEngine::new();
    let mut wrong = plain_record("ignored", "mallory", "bob", "", 0);
    wrong.id = None;
    wrong.content = engine
        .encrypt("for someone else", alice_key.public_key())
        .unwrap()
        .to_json()
        .unwrap();
    let mut right = wrong.clone();
    right.content = engine
        .encrypt("for bob", bob_key.public_key())
        .unwrap()
        .to_json()
        .unwrap();
    right.created_at = wrong.created_at + ChronoDuration::seconds(1);

    mallory
        .publish(destinations::CHAT_SEND, &wrong.to_json().unwrap())
        .await
        .unwrap();
    mallory
        .publish(destinations::CHAT_SEND, &right.to_json().unwrap())
        .await
        .unwrap();

    eventually("both records", || bob.messages().messages_for_peer("mallory").len() == 2).await;
    let messages = bob.messages().messages_for_peer("mallory");
    assert_eq!(messages[0].plaintext, UNDECRYPTABLE_PLACEHOLDER);
    assert!(messages[0].undecryptable);
    assert_eq!(messages[1].plaintext, "for bob");
    assert!(!messages[1].undecryptable);
}

#[tokio::test(flavor = "multi_thread")]
async fn three_unread_produce_three_receipts() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    let receipts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&receipts);
    alice.transport().on_receipt("count", move |_: &Delivery| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for text in ["one", "two", "three"] {
        alice.messages().send("bob", text).await.unwrap();
    }
    eventually("bob's inbox", || bob.messages().messages_for_peer("alice").len() == 3).await;

    assert_eq!(bob.messages().mark_conversation_read("alice").await, 3);
    // Local statuses flip before any receipt is acknowledged
    assert!(bob
        .messages()
        .messages_for_peer("alice")
        .iter()
        .all(|m| m.status == MessageStatus::Read));

    eventually("three receipts", || receipts.load(Ordering::SeqCst) == 3).await;
    eventually("alice sees read", || {
        let messages = alice.messages().messages_for_peer("bob");
        messages.len() == 3 && messages.iter().all(|m| m.status == MessageStatus::Read)
    })
    .await;

    assert_eq!(bob.messages().mark_conversation_read("alice").await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_echo_is_idempotent() {
    let net = Network::new();
    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    let echoes = Arc::new(parking_lot::Mutex::new(Vec::<Delivery>::new()));
    let sink = Arc::clone(&echoes);
    alice.transport().on_message("capture", move |delivery: &Delivery| {
        sink.lock().push(delivery.clone());
    });

    alice.messages().send("bob", "only once").await.unwrap();
    eventually("the echo", || !echoes.lock().is_empty()).await;
    eventually("reconciliation", || !alice.messages().messages_for_peer("bob")[0].is_temporary).await;

    let echo = echoes.lock()[0].clone();
    alice.messages().handle_delivery(&echo);
    alice.messages().handle_delivery(&echo);

    let messages = alice.messages().messages_for_peer("bob");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "only once");
}

#[tokio::test(flavor = "multi_thread")]
async fn history_merge_keeps_chronological_order() {
    let net = Network::new();
    let bob = net.client("bob");
    bob.initialize().await.unwrap();

    bob.messages().on_inbound(plain_record("m-2", "alice", "bob", "middle", 2));
    net.directory.record_direct(plain_record("m-3", "bob", "alice", "latest", 1));
    net.directory.record_direct(plain_record("m-1", "alice", "bob", "earliest", 3));
    net.directory.record_direct(plain_record("m-2", "alice", "bob", "middle", 2));

    assert_eq!(bob.messages().load_history("alice").await.unwrap(), 2);

    let ids: Vec<String> = bob
        .messages()
        .messages_for_peer("alice")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);

    assert_eq!(bob.messages().load_history("alice").await.unwrap(), 0);
    assert_eq!(bob.messages().messages_for_peer("alice").len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_never_moves_backwards() {
    let net = Network::new();
    let bob = net.client("bob");
    bob.initialize().await.unwrap();

    bob.messages().on_inbound(plain_record("m-1", "alice", "bob", "hi", 1));
    bob.messages().mark_conversation_read("alice").await;
    assert_eq!(bob.messages().status("m-1"), Some(MessageStatus::Read));

    let mut stale = plain_record("m-1", "alice", "bob", "hi", 1);
    stale.status = Some(MessageStatus::Sent);
    bob.messages().on_inbound(stale.clone());
    net.directory.record_direct(stale);
    bob.messages().load_history("alice").await.unwrap();

    assert_eq!(bob.messages().status("m-1"), Some(MessageStatus::Read));
}

#[tokio::test(flavor = "multi_thread")]
async fn group_conversation_end_to_end() {
    let net = Network::new();
    net.directory
        .set_members("g1", vec!["alice".into(), "bob".into(), "alice".into()]);
    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    alice.groups().select_group("g1").await.unwrap();
    bob.groups().select_group("g1").await.unwrap();
    assert_eq!(bob.groups().roster("g1"), vec!["alice", "bob"]);
    assert_eq!(net.broker.subscriber_count(&destinations::group_topic("g1")), 2);

    alice.groups().send("g1", "hello group").await.unwrap();

    eventually("bob's copy", || bob.groups().messages_for_group("g1").len() == 1).await;
    let received = &bob.groups().messages_for_group("g1")[0];
    assert_eq!(received.plaintext, "hello group");
    assert_eq!(received.sender_id, "alice");
    assert_eq!(received.status, MessageStatus::Delivered);

    eventually("alice's echo", || {
        let messages = alice.groups().messages_for_group("g1");
        messages.len() == 1 && !messages[0].is_temporary
    })
    .await;

    bob.groups().deselect().await;
    assert_eq!(net.broker.subscriber_count(&destinations::group_topic("g1")), 1);
}
