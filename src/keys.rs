//! Identity key pairs and public-key text encoding.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::{ChatError, Result, PUBLIC_KEY_SIZE};

/// The local user's identity: an X25519 key pair.
///
/// Text form is `<public hex>:<secret hex>`.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The secret half.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            encode_public_key(&self.public),
            hex::encode(self.secret.to_bytes())
        )
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &encode_public_key(&self.public))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl FromStr for KeyPair {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        let (public_text, secret_text) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ChatError::InvalidKeyPair("expected <public>:<secret>".to_string()))?;

        let secret_bytes = hex::decode(secret_text)
            .map_err(|e| ChatError::InvalidKeyPair(format!("secret is not hex: {}", e)))?;
        let secret: [u8; 32] = secret_bytes.try_into().map_err(|v: Vec<u8>| {
            ChatError::InvalidKeyPair(format!("secret must be 32 bytes, got {}", v.len()))
        })?;

        let pair = KeyPair::from_secret_bytes(secret);
        let public = parse_public_key(public_text)?;
        if public.as_bytes() != pair.public.as_bytes() {
            return Err(ChatError::InvalidKeyPair(
                "public key does not match secret".to_string(),
            ));
        }

        Ok(pair)
    }
}

/// Encode a public key as 64 lowercase hex characters.
pub fn encode_public_key(key: &PublicKey) -> String {
    hex::encode(key.as_bytes())
}

/// Parse a public key from its hex form.
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| ChatError::InvalidPublicKey(format!("not hex: {}", e)))?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChatError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(PublicKey::from(key))
}

/// Perform X25519 ECDH key exchange.
///
/// # Arguments
/// * `private_key` - Our private key
/// * `public_key` - Their public key
///
/// # Returns
/// 32-byte raw shared secret
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_SECRET_HEX: &str =
        "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_keypair_text_roundtrip() {
        let pair = KeyPair::generate();
        let parsed: KeyPair = pair.to_string().parse().unwrap();
        assert_eq!(parsed.public().as_bytes(), pair.public().as_bytes());
        assert_eq!(parsed.secret().to_bytes(), pair.secret().to_bytes());
    }

    #[test]
    fn test_keypair_rejects_mismatched_public() {
        let pair = KeyPair::generate();
        let other = KeyPair::generate();
        let text = format!(
            "{}:{}",
            encode_public_key(other.public()),
            hex::encode(pair.secret().to_bytes())
        );
        assert!(matches!(
            text.parse::<KeyPair>(),
            Err(ChatError::InvalidKeyPair(_))
        ));
    }

    #[test]
    fn test_keypair_rejects_missing_separator() {
        assert!(matches!(
            "deadbeef".parse::<KeyPair>(),
            Err(ChatError::InvalidKeyPair(_))
        ));
    }

    #[test]
    fn test_parse_public_key_length() {
        let result = parse_public_key("abcd");
        assert!(matches!(result, Err(ChatError::InvalidPublicKey(_))));
        assert!(parse_public_key("zz").is_err());
    }

    #[test]
    fn test_deterministic_public_key() {
        let bytes: [u8; 32] = hex::decode(ALICE_SECRET_HEX).unwrap().try_into().unwrap();
        let a = KeyPair::from_secret_bytes(bytes);
        let b = KeyPair::from_secret_bytes(bytes);
        assert_eq!(a.public().as_bytes(), b.public().as_bytes());
    }

    #[test]
    fn test_ecdh_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(
            x25519_ecdh(alice.secret(), bob.public()),
            x25519_ecdh(bob.secret(), alice.public())
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(pair.secret().to_bytes())));
    }
}
