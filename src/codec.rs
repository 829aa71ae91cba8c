//! Chat line encryption.
//!
//! Wire format of a subkey value:
//! - [0-23]  nonce (24 bytes)
//! - [24+]   XChaCha20 ciphertext of the UTF-8 line (variable)

use tracing::debug;

use crate::crypto::{crypt_no_auth, random_nonce, Nonce, SharedSecret};
use crate::types::{ChatError, Result, NONCE_SIZE};

/// Encrypt one chat line under `secret` with a fresh nonce.
pub fn encrypt(plaintext: &str, secret: &SharedSecret) -> Result<Vec<u8>> {
    let nonce = random_nonce();
    let encrypted = crypt_no_auth(plaintext.as_bytes(), &nonce, secret)?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + encrypted.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&encrypted);
    debug!(len = payload.len(), "encrypted chat line");
    Ok(payload)
}

/// Decrypt a `nonce || ciphertext` payload back into a chat line.
pub fn decrypt(payload: &[u8], secret: &SharedSecret) -> Result<String> {
    if payload.len() < NONCE_SIZE {
        return Err(ChatError::PayloadTooShort(payload.len()));
    }

    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
    let mut nonce: Nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    let cleartext = crypt_no_auth(ciphertext, &nonce, secret)?;
    debug!(len = cleartext.len(), "decrypted chat line");
    String::from_utf8(cleartext)
        .map_err(|e| ChatError::DecodingError(format!("Invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes([42u8; 32])
    }

    #[test]
    fn test_roundtrip() {
        let payload = encrypt("Hello from Rust!", &secret()).unwrap();
        assert_eq!(payload.len(), NONCE_SIZE + "Hello from Rust!".len());
        assert_eq!(decrypt(&payload, &secret()).unwrap(), "Hello from Rust!");
    }

    #[test]
    fn test_empty_line() {
        let payload = encrypt("", &secret()).unwrap();
        assert_eq!(payload.len(), NONCE_SIZE);
        assert_eq!(decrypt(&payload, &secret()).unwrap(), "");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let a = encrypt("again", &secret()).unwrap();
        let b = encrypt("again", &secret()).unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
    }

    #[test]
    fn test_too_short() {
        let result = decrypt(&[0u8; NONCE_SIZE - 1], &secret());
        assert!(matches!(result, Err(ChatError::PayloadTooShort(23))));
    }

    #[test]
    fn test_wrong_secret_is_not_the_message() {
        let payload = encrypt("こんにちは世界 Привет мир", &secret()).unwrap();
        let other = SharedSecret::from_bytes([1u8; 32]);
        match decrypt(&payload, &other) {
            Ok(text) => assert_ne!(text, "こんにちは世界 Привет мир"),
            Err(e) => assert!(matches!(e, ChatError::DecodingError(_))),
        }
    }

    #[test]
    fn test_invalid_utf8_after_decryption() {
        let nonce = [9u8; NONCE_SIZE];
        let garbage = crypt_no_auth(&[0xff, 0xfe, 0xfd], &nonce, &secret()).unwrap();
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&garbage);
        assert!(matches!(
            decrypt(&payload, &secret()),
            Err(ChatError::DecodingError(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(text in ".*", key in any::<[u8; 32]>()) {
            let secret = SharedSecret::from_bytes(key);
            let payload = encrypt(&text, &secret).unwrap();
            prop_assert_eq!(decrypt(&payload, &secret).unwrap(), text);
        }
    }
}
