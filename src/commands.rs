//! Operations behind the command line.
//!
//! Each returns a typed outcome; printing and exit codes are the binary's job.

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, info};
use x25519_dalek::PublicKey;

use crate::crypto::SharedSecretCache;
use crate::dht::{DhtClient, RecordKey};
use crate::keys::{encode_public_key, parse_public_key, KeyPair};
use crate::mailbox::{teardown_record, Mailbox};
use crate::session::{ChatSession, ChatView, Role, SessionConfig, SessionEnd};
use crate::storage::KeyStore;
use crate::types::{ChatError, Result};

// ============================================================================
// Chat client
// ============================================================================

/// Starts and joins chats using one DHT connection and one keystore.
pub struct ChatClient<D, S>
where
    D: DhtClient,
    S: KeyStore,
{
    dht: D,
    store: S,
    secrets: SharedSecretCache,
    config: SessionConfig,
}

impl<D, S> ChatClient<D, S>
where
    D: DhtClient,
    S: KeyStore,
{
    /// Creates a client.
    pub fn new(dht: D, store: S, config: SessionConfig) -> Self {
        Self {
            dht,
            store,
            secrets: SharedSecretCache::new(),
            config,
        }
    }

    /// The DHT connection.
    pub fn dht(&self) -> &D {
        &self.dht
    }

    /// The keystore.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a chat record for `name` and run the session as its initiator.
    ///
    /// The record key is handed to `view` before the first line is sent.
    pub async fn start<F>(
        &self,
        name: &str,
        lines: &mut mpsc::Receiver<String>,
        view: &dyn ChatView,
        shutdown: F,
    ) -> Result<SessionEnd>
    where
        F: Future<Output = ()>,
    {
        let (identity, friend) = self.parties(name).await?;
        let secret = self.secrets.cached_dh(&friend, identity.secret()).await;

        let mailbox = Mailbox::create(&self.dht, &identity, &friend, secret).await?;
        view.chat_key(mailbox.key());

        ChatSession::new(mailbox, Role::Initiator, name, self.config.clone())
            .run_until(lines, view, shutdown)
            .await
    }

    /// Join the chat record `key` that `name` created.
    pub async fn respond<F>(
        &self,
        name: &str,
        key: RecordKey,
        lines: &mut mpsc::Receiver<String>,
        view: &dyn ChatView,
        shutdown: F,
    ) -> Result<SessionEnd>
    where
        F: Future<Output = ()>,
    {
        let (identity, friend) = self.parties(name).await?;
        let secret = self.secrets.cached_dh(&friend, identity.secret()).await;

        let mailbox = Mailbox::open(&self.dht, key, &identity, secret).await?;

        ChatSession::new(mailbox, Role::Responder, name, self.config.clone())
            .run_until(lines, view, shutdown)
            .await
    }

    async fn parties(&self, name: &str) -> Result<(KeyPair, PublicKey)> {
        let identity = self
            .store
            .load_self_identity()
            .await?
            .ok_or(ChatError::NoIdentity)?;
        let friend = self
            .store
            .load_friend_public_key(name)
            .await?
            .ok_or_else(|| ChatError::UnknownFriend(name.to_string()))?;
        Ok((identity, friend))
    }
}

// ============================================================================
// Keystore commands
// ============================================================================

/// Result of [`keygen`].
#[derive(Debug, Clone)]
pub enum Keygen {
    /// A new identity was generated and stored.
    Generated(KeyPair),
    /// An identity already existed and was left alone.
    Existing(KeyPair),
}

/// Generate and store an identity unless one exists.
pub async fn keygen<S: KeyStore + ?Sized>(store: &S) -> Result<Keygen> {
    if let Some(existing) = store.load_self_identity().await? {
        debug!("identity already present, not overwriting");
        return Ok(Keygen::Existing(existing));
    }

    let pair = KeyPair::generate();
    store.store_self_identity(&pair).await?;
    info!(public = %encode_public_key(pair.public()), "generated identity");
    Ok(Keygen::Generated(pair))
}

/// Remove the keystore, identity and friends included.
pub async fn delete_keystore<S: KeyStore + ?Sized>(store: &S) -> Result<()> {
    store.delete_store().await?;
    info!("deleted keystore");
    Ok(())
}

/// Store `name`'s public key, replacing any previous one.
pub async fn add_friend<S: KeyStore + ?Sized>(store: &S, name: &str, pubkey: &str) -> Result<()> {
    let key = parse_public_key(pubkey.trim())?;
    store.store_friend_public_key(name, &key).await?;
    info!(name, "added friend");
    Ok(())
}

/// Snapshot of the keystore for display.
#[derive(Debug, Clone)]
pub struct KeystoreDump {
    pub identity: Option<KeyPair>,
    pub friends: Vec<(String, PublicKey)>,
}

impl fmt::Display for KeystoreDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(pair) => {
                writeln!(f, "Own keypair:")?;
                writeln!(f, "    Public: {}", encode_public_key(pair.public()))?;
                writeln!(f, "    Private: {}", hex::encode(pair.secret().to_bytes()))?;
            }
            None => writeln!(f, "Own keypair: <unset>")?,
        }

        writeln!(f)?;
        writeln!(f, "Friends:")?;
        if self.friends.is_empty() {
            write!(f, "    <unset>")?;
        } else {
            let rows: Vec<String> = self
                .friends
                .iter()
                .map(|(name, key)| format!("    {}: {}", name, encode_public_key(key)))
                .collect();
            write!(f, "{}", rows.join("\n"))?;
        }
        Ok(())
    }
}

/// Read the identity and every friend.
pub async fn dump_keystore<S: KeyStore + ?Sized>(store: &S) -> Result<KeystoreDump> {
    let identity = store.load_self_identity().await?;

    let mut friends = Vec::new();
    for name in store.list_friend_names().await? {
        if let Some(key) = store.load_friend_public_key(&name).await? {
            friends.push((name, key));
        }
    }

    Ok(KeystoreDump { identity, friends })
}

// ============================================================================
// Record commands
// ============================================================================

/// Close and delete a chat record left behind by an earlier session.
pub async fn clean<D: DhtClient + ?Sized>(dht: &D, key: &RecordKey) -> Result<()> {
    teardown_record(dht, key).await?;
    info!(%key, "cleaned record");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::DhtNetwork;
    use crate::storage::InMemoryKeyStore;

    struct SilentView;

    impl ChatView for SilentView {
        fn chat_key(&self, _key: &RecordKey) {}
        fn incoming(&self, _from: &str, _line: &str) {}
        fn peer_closed(&self) {}
        fn local_closed(&self) {}
    }

    #[tokio::test]
    async fn test_keygen_does_not_overwrite() {
        let store = InMemoryKeyStore::new();

        let first = match keygen(&store).await.unwrap() {
            Keygen::Generated(pair) => pair,
            Keygen::Existing(_) => panic!("fresh store reported an identity"),
        };
        match keygen(&store).await.unwrap() {
            Keygen::Existing(pair) => assert_eq!(pair.to_string(), first.to_string()),
            Keygen::Generated(_) => panic!("identity was regenerated"),
        }
    }

    #[tokio::test]
    async fn test_add_friend_validates_key() {
        let store = InMemoryKeyStore::new();
        let result = add_friend(&store, "bob", "not a key").await;
        assert!(matches!(result, Err(ChatError::InvalidPublicKey(_))));
        assert!(store.list_friend_names().await.unwrap().is_empty());

        let bob = KeyPair::generate();
        add_friend(&store, "bob", &encode_public_key(bob.public()))
            .await
            .unwrap();
        let stored = store.load_friend_public_key("bob").await.unwrap().unwrap();
        assert_eq!(stored.as_bytes(), bob.public().as_bytes());
    }

    #[tokio::test]
    async fn test_dump_layout() {
        let store = InMemoryKeyStore::new();
        let empty = dump_keystore(&store).await.unwrap().to_string();
        assert_eq!(empty, "Own keypair: <unset>\n\nFriends:\n    <unset>");

        let me = KeyPair::generate();
        let bob = KeyPair::generate();
        store.store_self_identity(&me).await.unwrap();
        store.store_friend_public_key("bob", bob.public()).await.unwrap();

        let text = dump_keystore(&store).await.unwrap().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Own keypair:");
        assert_eq!(lines[1], format!("    Public: {}", encode_public_key(me.public())));
        assert!(lines[2].starts_with("    Private: "));
        assert_eq!(lines[4], "Friends:");
        assert_eq!(lines[5], format!("    bob: {}", encode_public_key(bob.public())));
    }

    #[tokio::test]
    async fn test_delete_keystore() {
        let store = InMemoryKeyStore::new();
        keygen(&store).await.unwrap();
        delete_keystore(&store).await.unwrap();
        assert!(store.load_self_identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_identity_and_friend() {
        let network = DhtNetwork::new();
        let client = ChatClient::new(network.client(), InMemoryKeyStore::new(), SessionConfig::default());
        let (_tx, mut rx) = mpsc::channel(1);

        let result = client
            .start("bob", &mut rx, &SilentView, std::future::pending())
            .await;
        assert!(matches!(result, Err(ChatError::NoIdentity)));

        keygen(client.store()).await.unwrap();
        let result = client
            .start("bob", &mut rx, &SilentView, std::future::pending())
            .await;
        assert!(matches!(result, Err(ChatError::UnknownFriend(name)) if name == "bob"));

        // Nothing was created on the way out.
        assert_eq!(network.record_count().await, 0);
    }

    #[derive(Default)]
    struct OrderView {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl ChatView for OrderView {
        fn chat_key(&self, key: &RecordKey) {
            self.events.lock().unwrap().push(format!("key {}", key));
        }
        fn prompt(&self) {
            self.events.lock().unwrap().push("prompt".to_string());
        }
        fn incoming(&self, _from: &str, _line: &str) {}
        fn peer_closed(&self) {}
        fn local_closed(&self) {
            self.events.lock().unwrap().push("local closed".to_string());
        }
    }

    #[tokio::test]
    async fn test_chat_key_shown_before_first_prompt() {
        let network = DhtNetwork::new();
        let store = InMemoryKeyStore::new();
        keygen(&store).await.unwrap();
        store
            .store_friend_public_key("bob", KeyPair::generate().public())
            .await
            .unwrap();
        let client = ChatClient::new(network.client(), store, SessionConfig::default());
        let view = OrderView::default();
        let (tx, mut rx) = mpsc::channel(1);
        drop(tx);

        let end = client
            .start("bob", &mut rx, &view, std::future::pending())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::LocalClosed);

        let events = view.events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("key "));
        assert_eq!(events[1], "prompt");
        assert_eq!(events[2], "local closed");
    }

    #[tokio::test]
    async fn test_respond_to_missing_record() {
        let network = DhtNetwork::new();
        let store = InMemoryKeyStore::new();
        keygen(&store).await.unwrap();
        store
            .store_friend_public_key("alice", KeyPair::generate().public())
            .await
            .unwrap();
        let client = ChatClient::new(network.client(), store, SessionConfig::default());
        let (_tx, mut rx) = mpsc::channel(1);

        let result = client
            .respond("alice", RecordKey::random(), &mut rx, &SilentView, std::future::pending())
            .await;
        assert!(matches!(result, Err(ChatError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn test_clean_tolerates_missing_record() {
        let network = DhtNetwork::new();
        let dht = network.client();
        clean(&dht, &RecordKey::random()).await.unwrap();

        let me = KeyPair::generate();
        let friend = KeyPair::generate();
        let record = dht
            .create_record(crate::dht::DhtSchema::two_party(me.public(), friend.public()))
            .await
            .unwrap();
        clean(&dht, &record.key).await.unwrap();
        assert_eq!(network.record_count().await, 0);
    }
}
