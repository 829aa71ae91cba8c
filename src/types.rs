//! Type definitions and protocol constants for dhtchat.

use thiserror::Error;

/// Size of the nonce prefixed to every chat payload, in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of a shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a DHT record key in bytes.
pub const RECORD_KEY_SIZE: usize = 32;

/// Plaintext that signals the end of a chat session.
pub const QUIT: &str = "QUIT";

/// Line written by each side as soon as its session starts.
///
/// Writing something right away makes the record propagate before anyone types.
pub const GREETING: &str = "Hello from the world!";

/// Largest payload a single subkey may hold.
pub const MAX_SUBKEY_SIZE: usize = 32768;

/// Largest number of subkeys a record schema may declare.
pub const MAX_SUBKEYS: u32 = 1024;

/// Crypto kind tag printed in front of record keys.
pub const CRYPTO_KIND: &str = "VLD0";

/// Shared-secret derivation salt.
pub const SHARED_SECRET_SALT: &[u8] = b"dhtchat-v1-shared-secret";

/// Shared-secret derivation info.
pub const SHARED_SECRET_INFO: &[u8] = b"x25519-dh";

/// Errors that can occur during dhtchat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    // Codec Errors
    /// Payload is too short to carry a nonce.
    #[error("Payload too short: {0} bytes (need at least {})", NONCE_SIZE)]
    PayloadTooShort(usize),

    /// Decrypted bytes are not valid UTF-8.
    #[error("Decoding failed: {0}")]
    DecodingError(String),

    // Key Errors
    /// Invalid public key text or length.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid key pair text.
    #[error("Invalid key pair: {0}")]
    InvalidKeyPair(String),

    /// Invalid record key text.
    #[error("Invalid record key: {0}")]
    InvalidRecordKey(String),

    // DHT Errors
    /// Record does not exist (or was deleted).
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Record is not open on this client.
    #[error("Record not open: {0}")]
    RecordNotOpen(String),

    /// The opened writer may not write this subkey.
    #[error("Not authorized to write subkey {0}")]
    Unauthorized(u32),

    /// Subkey index outside the record's schema.
    #[error("Invalid subkey: {0}")]
    InvalidSubkey(u32),

    /// Value exceeds the subkey size limit.
    #[error("Value too large: {0} bytes (max {})", MAX_SUBKEY_SIZE)]
    ValueTooLarge(usize),

    /// Subkey has taken its last possible write.
    #[error("Sequence numbers exhausted on subkey {0}")]
    SequenceExhausted(u32),

    /// Schema rejected by the substrate.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    // Precondition Errors
    /// No local identity in the keystore.
    #[error("No identity key pair in the keystore")]
    NoIdentity,

    /// No stored public key for this friend.
    #[error("Unknown friend: {0}")]
    UnknownFriend(String),

    // Storage Errors
    /// Keystore operation failed.
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    // Transport Errors
    /// Connection to the node failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Node sent something we could not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether this error means the record is already gone from this client.
    ///
    /// Teardown treats these as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChatError::RecordNotFound(_) | ChatError::RecordNotOpen(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ChatError::RecordNotFound("k".into()).is_not_found());
        assert!(ChatError::RecordNotOpen("k".into()).is_not_found());
        assert!(!ChatError::Unauthorized(0).is_not_found());
        assert!(!ChatError::NoIdentity.is_not_found());
    }

    #[test]
    fn test_sentinel_differs_from_greeting() {
        assert_ne!(QUIT, GREETING);
    }
}
