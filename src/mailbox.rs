//! The shared two-subkey chat record.
//!
//! Each side writes its own subkey and polls the other. A poll only yields a
//! line when the subkey's sequence number has moved past the last one this
//! reader saw; otherwise the caller is expected to try again.

use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::codec;
use crate::crypto::SharedSecret;
use crate::dht::{DhtClient, DhtSchema, RecordKey, ValueSeqNum, ValueSubkey};
use crate::keys::KeyPair;
use crate::types::Result;

/// Read position within one subkey.
///
/// Starts out having seen nothing, so the first value is always new, even at
/// sequence 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    subkey: ValueSubkey,
    last_seq: Option<ValueSeqNum>,
}

impl ReadCursor {
    /// A cursor that has not observed anything on `subkey` yet.
    pub fn new(subkey: ValueSubkey) -> Self {
        Self {
            subkey,
            last_seq: None,
        }
    }

    /// Sequence number of the last delivered value.
    pub fn last_seq(&self) -> Option<ValueSeqNum> {
        self.last_seq
    }

    fn is_new(&self, seq: ValueSeqNum) -> bool {
        self.last_seq.map_or(true, |last| seq > last)
    }
}

/// An open chat record plus the secret its lines are encrypted with.
pub struct Mailbox<'a, D: DhtClient + ?Sized> {
    dht: &'a D,
    key: RecordKey,
    secret: SharedSecret,
}

impl<'a, D: DhtClient + ?Sized> Mailbox<'a, D> {
    /// Create a fresh record writable by exactly `identity` (subkey 0) and
    /// `friend` (subkey 1), then reopen it as `identity`.
    pub async fn create(
        dht: &'a D,
        identity: &KeyPair,
        friend: &PublicKey,
        secret: SharedSecret,
    ) -> Result<Mailbox<'a, D>> {
        let schema = DhtSchema::two_party(identity.public(), friend);
        let record = dht.create_record(schema).await?;
        info!(key = %record.key, "created chat record");

        // The record comes back open without a writer; reopen it as ourselves.
        let reopened = async {
            dht.close_record(&record.key).await?;
            dht.open_record(&record.key, Some(identity)).await
        }
        .await;
        if let Err(e) = reopened {
            warn!(key = %record.key, error = %e, "reopen failed, removing new record");
            if let Err(cleanup) = teardown_record(dht, &record.key).await {
                warn!(key = %record.key, error = %cleanup, "cleanup of new record failed");
            }
            return Err(e);
        }

        Ok(Self {
            dht,
            key: record.key,
            secret,
        })
    }

    /// Open a record someone else created.
    pub async fn open(
        dht: &'a D,
        key: RecordKey,
        identity: &KeyPair,
        secret: SharedSecret,
    ) -> Result<Mailbox<'a, D>> {
        dht.open_record(&key, Some(identity)).await?;
        info!(%key, "opened chat record");
        Ok(Self { dht, key, secret })
    }

    /// Record key to hand to the other party.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Encrypt `plaintext` and store it in `subkey`.
    ///
    /// Returns once the substrate accepted the write; the peer may see it later.
    pub async fn write(&self, subkey: ValueSubkey, plaintext: &str) -> Result<()> {
        let payload = codec::encrypt(plaintext, &self.secret)?;
        debug!(key = %self.key, subkey, "writing line");
        self.dht.set_value(&self.key, subkey, payload).await
    }

    /// Fetch the cursor's subkey from the network and return its line if it
    /// is newer than anything the cursor has seen.
    pub async fn poll(&self, cursor: &mut ReadCursor) -> Result<Option<String>> {
        let value = match self.dht.get_value(&self.key, cursor.subkey, true).await? {
            Some(value) => value,
            None => {
                debug!(key = %self.key, subkey = cursor.subkey, "no value yet");
                return Ok(None);
            }
        };

        if !cursor.is_new(value.seq) {
            debug!(key = %self.key, subkey = cursor.subkey, seq = value.seq, "no new value");
            return Ok(None);
        }

        let line = codec::decrypt(&value.data, &self.secret)?;
        cursor.last_seq = Some(value.seq);
        debug!(key = %self.key, subkey = cursor.subkey, seq = value.seq, "new line");
        Ok(Some(line))
    }

    /// Close then delete the record. Safe to call more than once, and safe to
    /// race with the peer doing the same.
    pub async fn teardown(&self) -> Result<()> {
        teardown_record(self.dht, &self.key).await
    }
}

/// Close then delete `key`, treating "already gone" as success.
pub async fn teardown_record<D: DhtClient + ?Sized>(dht: &D, key: &RecordKey) -> Result<()> {
    debug!(%key, "closing record");
    match dht.close_record(key).await {
        Err(e) if e.is_not_found() => debug!(%key, error = %e, "record already closed"),
        other => other?,
    }

    debug!(%key, "deleting record");
    match dht.delete_record(key).await {
        Err(e) if e.is_not_found() => debug!(%key, error = %e, "record already deleted"),
        other => other?,
    }
    Ok(())
}
