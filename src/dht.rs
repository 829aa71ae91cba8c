//! DHT substrate interfaces and an in-memory implementation.
//!
//! A record is a set of subkeys guarded by a schema: each schema member may
//! write only its own contiguous range of subkeys, anybody holding the record
//! key may read all of them. Every successful write bumps the subkey's
//! sequence number.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::keys::KeyPair;
use crate::types::{
    ChatError, Result, CRYPTO_KIND, MAX_SUBKEYS, MAX_SUBKEY_SIZE, RECORD_KEY_SIZE,
};

/// Index of a subkey within a record.
pub type ValueSubkey = u32;

/// Per-subkey write counter.
pub type ValueSeqNum = u32;

// ============================================================================
// Record types
// ============================================================================

/// Network address of a DHT record, shown as `VLD0:<base64url>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey([u8; RECORD_KEY_SIZE]);

impl RecordKey {
    /// A fresh random record key.
    pub fn random() -> Self {
        let mut bytes = [0u8; RECORD_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; RECORD_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            CRYPTO_KIND,
            data_encoding::BASE64URL_NOPAD.encode(&self.0)
        )
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", self)
    }
}

impl FromStr for RecordKey {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        let encoded = s
            .trim()
            .strip_prefix(CRYPTO_KIND)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| ChatError::InvalidRecordKey(format!("missing {}: prefix", CRYPTO_KIND)))?;

        let bytes = data_encoding::BASE64URL_NOPAD
            .decode(encoded.as_bytes())
            .map_err(|e| ChatError::InvalidRecordKey(e.to_string()))?;
        let key: [u8; RECORD_KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            ChatError::InvalidRecordKey(format!("expected {} bytes, got {}", RECORD_KEY_SIZE, v.len()))
        })?;
        Ok(Self(key))
    }
}

impl TryFrom<String> for RecordKey {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

/// A schema member and how many subkeys it may write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMember {
    /// Member's public key.
    #[serde(with = "hex_key")]
    pub key: [u8; 32],
    /// Number of subkeys granted to this member.
    pub subkey_count: u16,
}

/// Simple member schema: owner subkeys first, then each member's range in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtSchema {
    /// Subkeys reserved for the record owner.
    pub owner_subkeys: u16,
    /// Writers after the owner.
    pub members: Vec<SchemaMember>,
}

impl DhtSchema {
    /// Schema for a chat: member 0 writes subkey 0, member 1 writes subkey 1.
    pub fn two_party(me: &PublicKey, friend: &PublicKey) -> Self {
        Self {
            owner_subkeys: 0,
            members: vec![
                SchemaMember {
                    key: *me.as_bytes(),
                    subkey_count: 1,
                },
                SchemaMember {
                    key: *friend.as_bytes(),
                    subkey_count: 1,
                },
            ],
        }
    }

    /// Total number of subkeys in a record with this schema.
    pub fn subkey_count(&self) -> u32 {
        self.owner_subkeys as u32
            + self
                .members
                .iter()
                .map(|m| m.subkey_count as u32)
                .sum::<u32>()
    }

    /// Reject empty or oversized schemas.
    pub fn validate(&self) -> Result<()> {
        let count = self.subkey_count();
        if count == 0 {
            return Err(ChatError::InvalidSchema("schema has no subkeys".to_string()));
        }
        if count > MAX_SUBKEYS {
            return Err(ChatError::InvalidSchema(format!(
                "{} subkeys exceeds the limit of {}",
                count, MAX_SUBKEYS
            )));
        }
        Ok(())
    }

    /// Subkeys a member may write, if it is a member at all.
    #[cfg(test)]
    pub fn member_subkeys(&self, key: &[u8; 32]) -> Option<std::ops::Range<ValueSubkey>> {
        let mut start = self.owner_subkeys as u32;
        for member in &self.members {
            let end = start + member.subkey_count as u32;
            if &member.key == key {
                return Some(start..end);
            }
            start = end;
        }
        None
    }

    /// The member allowed to write `subkey`.
    pub fn writer_for(&self, subkey: ValueSubkey) -> Option<&[u8; 32]> {
        let mut start = self.owner_subkeys as u32;
        for member in &self.members {
            let end = start + member.subkey_count as u32;
            if (start..end).contains(&subkey) {
                return Some(&member.key);
            }
            start = end;
        }
        None
    }
}

/// Returned when a record is created or opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecordDescriptor {
    /// Record address.
    pub key: RecordKey,
    /// Write schema.
    pub schema: DhtSchema,
}

/// Current contents of one subkey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueData {
    /// Sequence number of the write that produced this value.
    pub seq: ValueSeqNum,
    /// Stored bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Public key of the writer.
    #[serde(with = "hex_key")]
    pub writer: [u8; 32],
}

// ============================================================================
// Client trait
// ============================================================================

/// Trait for talking to the DHT.
#[async_trait::async_trait]
pub trait DhtClient: Send + Sync {
    /// Create a record with the given schema. It starts open, without a writer.
    async fn create_record(&self, schema: DhtSchema) -> Result<DhtRecordDescriptor>;

    /// Open an existing record, optionally as one of its schema members.
    async fn open_record(
        &self,
        key: &RecordKey,
        writer: Option<&KeyPair>,
    ) -> Result<DhtRecordDescriptor>;

    /// Close a record opened by this client.
    async fn close_record(&self, key: &RecordKey) -> Result<()>;

    /// Delete a record.
    async fn delete_record(&self, key: &RecordKey) -> Result<()>;

    /// Write a subkey.
    async fn set_value(&self, key: &RecordKey, subkey: ValueSubkey, data: Vec<u8>) -> Result<()>;

    /// Read a subkey. `None` until the first write.
    async fn get_value(
        &self,
        key: &RecordKey,
        subkey: ValueSubkey,
        force_refresh: bool,
    ) -> Result<Option<ValueData>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct StoredRecord {
    schema: DhtSchema,
    subkeys: Vec<Option<ValueData>>,
    open_handles: usize,
    deleted: bool,
}

/// Shared record store that in-memory clients talk to.
///
/// Deleting a record that other clients still hold open only marks it; it
/// disappears once the last of them closes it.
#[derive(Default, Clone)]
pub struct DhtNetwork {
    records: Arc<RwLock<HashMap<RecordKey, StoredRecord>>>,
}

impl DhtNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client handle attached to this network.
    pub fn client(&self) -> InMemoryDht {
        InMemoryDht::new(self.clone())
    }

    /// Number of records currently stored, including ones pending deletion.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether a live (not deleted) record exists.
    pub async fn contains(&self, key: &RecordKey) -> bool {
        self.records
            .read()
            .await
            .get(key)
            .map(|r| !r.deleted)
            .unwrap_or(false)
    }
}

/// One client's view of a [`DhtNetwork`].
pub struct InMemoryDht {
    network: DhtNetwork,
    /// Records open on this client and the writer they were opened with.
    opened: RwLock<HashMap<RecordKey, Option<[u8; 32]>>>,
}

impl InMemoryDht {
    /// Attach a client to `network`.
    pub fn new(network: DhtNetwork) -> Self {
        Self {
            network,
            opened: RwLock::new(HashMap::new()),
        }
    }

    /// Open a record with a writer identified only by its public key.
    pub async fn open_record_as(
        &self,
        key: &RecordKey,
        writer: Option<[u8; 32]>,
    ) -> Result<DhtRecordDescriptor> {
        let mut records = self.network.records.write().await;
        let record = records
            .get_mut(key)
            .filter(|r| !r.deleted)
            .ok_or_else(|| ChatError::RecordNotFound(key.to_string()))?;

        let mut opened = self.opened.write().await;
        if opened.insert(*key, writer).is_none() {
            record.open_handles += 1;
        }
        debug!(%key, has_writer = writer.is_some(), "opened record");

        Ok(DhtRecordDescriptor {
            key: *key,
            schema: record.schema.clone(),
        })
    }

    /// Close everything this client still has open.
    pub async fn close_all(&self) {
        let keys: Vec<RecordKey> = self.opened.read().await.keys().copied().collect();
        for key in keys {
            if let Err(e) = self.close_record(&key).await {
                debug!(%key, error = %e, "close on disconnect failed");
            }
        }
    }

    async fn opened_writer(&self, key: &RecordKey) -> Result<Option<[u8; 32]>> {
        self.opened
            .read()
            .await
            .get(key)
            .copied()
            .ok_or_else(|| ChatError::RecordNotOpen(key.to_string()))
    }
}

#[async_trait::async_trait]
impl DhtClient for InMemoryDht {
    async fn create_record(&self, schema: DhtSchema) -> Result<DhtRecordDescriptor> {
        schema.validate()?;

        let key = RecordKey::random();
        let record = StoredRecord {
            subkeys: vec![None; schema.subkey_count() as usize],
            schema: schema.clone(),
            open_handles: 1,
            deleted: false,
        };

        self.network.records.write().await.insert(key, record);
        self.opened.write().await.insert(key, None);
        debug!(%key, "created record");

        Ok(DhtRecordDescriptor { key, schema })
    }

    async fn open_record(
        &self,
        key: &RecordKey,
        writer: Option<&KeyPair>,
    ) -> Result<DhtRecordDescriptor> {
        self.open_record_as(key, writer.map(|w| *w.public().as_bytes()))
            .await
    }

    async fn close_record(&self, key: &RecordKey) -> Result<()> {
        if self.opened.write().await.remove(key).is_none() {
            return Err(ChatError::RecordNotOpen(key.to_string()));
        }

        let mut records = self.network.records.write().await;
        if let Some(record) = records.get_mut(key) {
            record.open_handles = record.open_handles.saturating_sub(1);
            if record.deleted && record.open_handles == 0 {
                records.remove(key);
                debug!(%key, "removed deleted record on last close");
            }
        }
        debug!(%key, "closed record");
        Ok(())
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        let mut records = self.network.records.write().await;
        let record = records
            .get_mut(key)
            .filter(|r| !r.deleted)
            .ok_or_else(|| ChatError::RecordNotFound(key.to_string()))?;

        if record.open_handles == 0 {
            records.remove(key);
            debug!(%key, "deleted record");
        } else {
            record.deleted = true;
            debug!(%key, open = record.open_handles, "record marked deleted");
        }
        Ok(())
    }

    async fn set_value(&self, key: &RecordKey, subkey: ValueSubkey, data: Vec<u8>) -> Result<()> {
        let writer = self.opened_writer(key).await?;

        let mut records = self.network.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| ChatError::RecordNotFound(key.to_string()))?;

        let slot = record
            .subkeys
            .get_mut(subkey as usize)
            .ok_or(ChatError::InvalidSubkey(subkey))?;
        if data.len() > MAX_SUBKEY_SIZE {
            return Err(ChatError::ValueTooLarge(data.len()));
        }

        let writer = writer.ok_or(ChatError::Unauthorized(subkey))?;
        if record.schema.writer_for(subkey) != Some(&writer) {
            return Err(ChatError::Unauthorized(subkey));
        }

        let seq = match slot.as_ref() {
            None => 0,
            Some(v) => v
                .seq
                .checked_add(1)
                .ok_or(ChatError::SequenceExhausted(subkey))?,
        };
        *slot = Some(ValueData { seq, data, writer });
        debug!(%key, subkey, seq, "set value");
        Ok(())
    }

    async fn get_value(
        &self,
        key: &RecordKey,
        subkey: ValueSubkey,
        force_refresh: bool,
    ) -> Result<Option<ValueData>> {
        self.opened_writer(key).await?;

        let records = self.network.records.read().await;
        let record = records
            .get(key)
            .ok_or_else(|| ChatError::RecordNotFound(key.to_string()))?;

        let value = record
            .subkeys
            .get(subkey as usize)
            .ok_or(ChatError::InvalidSubkey(subkey))?
            .clone();
        debug!(%key, subkey, force_refresh, found = value.is_some(), "get value");
        Ok(value)
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

pub(crate) mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

pub(crate) mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&data_encoding::BASE64URL_NOPAD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        data_encoding::BASE64URL_NOPAD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
