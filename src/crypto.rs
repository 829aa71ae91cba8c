//! Crypto substrate: nonces, unauthenticated stream encryption and
//! Diffie-Hellman shared secrets.
//!
//! `crypt_no_auth` is plain XChaCha20. There is no authentication tag, so a
//! ciphertext can be bit-flipped or truncated without detection. Only the
//! record's write schema keeps strangers out of the channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::x25519_ecdh;
use crate::types::{
    ChatError, Result, NONCE_SIZE, SHARED_SECRET_INFO, SHARED_SECRET_SALT, SHARED_SECRET_SIZE,
};

/// A 24-byte XChaCha20 nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Symmetric key both parties derive from their key pairs.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Fresh random nonce from the OS generator.
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// XOR `data` with the XChaCha20 keystream for (`secret`, `nonce`).
///
/// The operation is its own inverse.
pub fn crypt_no_auth(data: &[u8], nonce: &Nonce, secret: &SharedSecret) -> Result<Vec<u8>> {
    let mut cipher = XChaCha20::new_from_slices(secret.as_bytes(), nonce)
        .map_err(|e| ChatError::DecodingError(format!("Cipher init failed: {}", e)))?;
    let mut buffer = data.to_vec();
    cipher.apply_keystream(&mut buffer);
    Ok(buffer)
}

/// Derive the shared secret between our private key and their public key.
///
/// Raw X25519 output goes through HKDF-SHA256 so the key is uniformly random.
pub fn derive_shared_secret(my_secret: &StaticSecret, their_public: &PublicKey) -> SharedSecret {
    let mut raw = x25519_ecdh(my_secret, their_public);

    let hkdf = Hkdf::<Sha256>::new(Some(SHARED_SECRET_SALT), &raw);
    let mut bytes = [0u8; SHARED_SECRET_SIZE];
    hkdf.expand(SHARED_SECRET_INFO, &mut bytes)
        .expect("32 bytes is a valid length for HKDF-SHA256");
    raw.zeroize();

    SharedSecret { bytes }
}

/// Process-lifetime cache of derived shared secrets, keyed by
/// (local public key, remote public key).
#[derive(Default, Clone)]
pub struct SharedSecretCache {
    cache: Arc<RwLock<HashMap<([u8; 32], [u8; 32]), SharedSecret>>>,
}

impl SharedSecretCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached secret for this key pair, deriving it on first use.
    pub async fn cached_dh(&self, their_public: &PublicKey, my_secret: &StaticSecret) -> SharedSecret {
        let my_public = PublicKey::from(my_secret);
        let cache_key = (*my_public.as_bytes(), *their_public.as_bytes());

        if let Some(secret) = self.cache.read().await.get(&cache_key) {
            debug!("shared secret cache hit");
            return secret.clone();
        }

        debug!("deriving shared secret");
        let secret = derive_shared_secret(my_secret, their_public);
        self.cache.write().await.insert(cache_key, secret.clone());
        secret
    }

    /// Number of cached secrets.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache is empty.
    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Forget every cached secret.
    #[cfg(test)]
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_crypt_no_auth_is_involution() {
        let secret = SharedSecret::from_bytes([7u8; 32]);
        let nonce = random_nonce();
        let ciphertext = crypt_no_auth(b"attack at dawn", &nonce, &secret).unwrap();
        assert_ne!(ciphertext, b"attack at dawn");
        let plaintext = crypt_no_auth(&ciphertext, &nonce, &secret).unwrap();
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[test]
    fn test_random_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[test]
    fn test_both_sides_derive_same_secret() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let a = derive_shared_secret(alice.secret(), bob.public());
        let b = derive_shared_secret(bob.secret(), alice.public());
        assert_eq!(a, b);

        let eve = KeyPair::generate();
        assert_ne!(a, derive_shared_secret(eve.secret(), bob.public()));
    }

    #[tokio::test]
    async fn test_cached_dh() {
        let cache = SharedSecretCache::new();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let first = cache.cached_dh(bob.public(), alice.secret()).await;
        let second = cache.cached_dh(bob.public(), alice.secret()).await;
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);

        cache.cached_dh(alice.public(), bob.secret()).await;
        assert_eq!(cache.len().await, 2);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn test_debug_redacts() {
        let secret = SharedSecret::from_bytes([1u8; 32]);
        assert_eq!(format!("{:?}", secret), "SharedSecret([REDACTED])");
    }
}
