//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use dhtchat::{
    add_friend, encode_public_key, keygen, ChatClient, ChatView, DhtClient, InMemoryKeyStore,
    KeyStore, Keygen, RecordKey, SessionConfig, SessionEnd, GREETING,
};
use tokio::sync::{mpsc, oneshot};

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Key(RecordKey),
    Incoming(String, String),
    PeerClosed,
    LocalClosed,
}

/// View that forwards every event to a channel.
pub struct ChannelView {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelView {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl ChatView for ChannelView {
    fn chat_key(&self, key: &RecordKey) {
        self.emit(Event::Key(*key));
    }

    fn incoming(&self, from: &str, line: &str) {
        self.emit(Event::Incoming(from.to_string(), line.to_string()));
    }

    fn peer_closed(&self) {
        self.emit(Event::PeerClosed);
    }

    fn local_closed(&self) {
        self.emit(Event::LocalClosed);
    }
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a chat event")
        .expect("view dropped")
}

pub fn incoming(from: &str, line: &str) -> Event {
    Event::Incoming(from.to_string(), line.to_string())
}

/// Two keystores that know each other as "alice" and "bob".
pub async fn introduced_stores() -> (InMemoryKeyStore, InMemoryKeyStore) {
    let alice = InMemoryKeyStore::new();
    let bob = InMemoryKeyStore::new();
    let alice_pair = generated(&alice).await;
    let bob_pair = generated(&bob).await;

    add_friend(&alice, "bob", &encode_public_key(bob_pair.public()))
        .await
        .unwrap();
    add_friend(&bob, "alice", &encode_public_key(alice_pair.public()))
        .await
        .unwrap();
    (alice, bob)
}

async fn generated(store: &dyn KeyStore) -> dhtchat::KeyPair {
    match keygen(store).await.unwrap() {
        Keygen::Generated(pair) => pair,
        Keygen::Existing(_) => panic!("store was not empty"),
    }
}

pub fn config(poll_interval: Duration) -> SessionConfig {
    SessionConfig {
        poll_interval,
        ..SessionConfig::default()
    }
}

/// Lines that exercise the whole text path.
pub fn sample_lines() -> Vec<&'static str> {
    vec![
        "",
        "X",
        "   \t   ",
        "1234567890",
        "!@#$%^&*()_+-=[]{}\\|;':\",./<>?",
        "Hello 👋 World 🌍",
        "你好世界 - Hello World",
        "مرحبا بالعالم",
        "Café résumé naïve",
        r#"{"key": "value", "num": 42}"#,
    ]
}

/// Alice starts a chat with Bob, both exchange lines, then Alice hangs up.
///
/// Every line must arrive exactly once and in order; the driver waits for
/// each delivery before sending the next line.
pub async fn converse<D: DhtClient>(
    alice: &ChatClient<D, InMemoryKeyStore>,
    bob: &ChatClient<D, InMemoryKeyStore>,
) -> (SessionEnd, SessionEnd, RecordKey) {
    let (alice_tx, mut alice_lines) = mpsc::channel::<String>(16);
    let (bob_tx, mut bob_lines) = mpsc::channel::<String>(16);
    let (alice_view, mut alice_events) = ChannelView::new();
    let (bob_view, mut bob_events) = ChannelView::new();
    let (key_tx, key_rx) = oneshot::channel();

    let alice_session = alice.start("bob", &mut alice_lines, &alice_view, std::future::pending());

    let bob_session = async {
        let key = key_rx.await.expect("driver gave up before the key was known");
        bob.respond("alice", key, &mut bob_lines, &bob_view, std::future::pending())
            .await
    };

    let driver = async move {
        let key = match next_event(&mut alice_events).await {
            Event::Key(key) => key,
            other => panic!("expected the chat key first, got {:?}", other),
        };
        key_tx.send(key).unwrap();

        assert_eq!(next_event(&mut bob_events).await, incoming("alice", GREETING));
        assert_eq!(next_event(&mut alice_events).await, incoming("bob", GREETING));

        for line in sample_lines() {
            alice_tx.send(line.to_string()).await.unwrap();
            assert_eq!(next_event(&mut bob_events).await, incoming("alice", line));
        }

        bob_tx.send("got it all".to_string()).await.unwrap();
        assert_eq!(next_event(&mut alice_events).await, incoming("bob", "got it all"));

        drop(alice_tx);
        assert_eq!(next_event(&mut alice_events).await, Event::LocalClosed);
        assert_eq!(next_event(&mut bob_events).await, Event::PeerClosed);

        // Nothing was delivered twice.
        assert!(alice_events.try_recv().is_err());
        assert!(bob_events.try_recv().is_err());
        drop(bob_tx);
        key
    };

    let (alice_end, bob_end, key) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(alice_session, bob_session, driver)
    })
    .await
    .expect("chat did not finish");

    (alice_end.unwrap(), bob_end.unwrap(), key)
}
