use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_MESSAGE_KEY, KEY_ALPHABET, KEY_LENGTH, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// Shared secret for one encrypted message.
///
/// The sender reads it off the screen once and hands it to the recipient
/// out-of-band. It is never written to any store.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    /// Draw a fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut random = [0u8; KEY_LENGTH * 4];
        rand::rngs::OsRng.fill_bytes(&mut random);

        let key = random
            .chunks_exact(4)
            .map(|chunk| {
                let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                KEY_ALPHABET[value as usize % KEY_ALPHABET.len()] as char
            })
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

pub fn generate_key() -> EncryptionKey {
    EncryptionKey::generate()
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// BLAKE3 in derive-key mode; the shared key is already random, no stretching
fn cipher_key(key: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&hash.as_bytes()[..32]);
    out
}

// Returns base64(nonce || ciphertext)
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(&cipher_key(key.as_str()).into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(output))
}

/// Decrypt with a key typed in by the recipient.
pub fn try_decrypt(ciphertext: &str, key: &str) -> Result<String, CryptoError> {
    let data = STANDARD
        .decode(ciphertext.trim())
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::MalformedCiphertext);
    }

    let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(&cipher_key(key).into());
    let nonce = XNonce::from_slice(nonce_bytes);

    let plain = cipher
        .decrypt(nonce, sealed)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    String::from_utf8(plain).map_err(|_| CryptoError::DecryptionFailed)
}

/// `None` on a wrong key or garbled input, never a panic.
pub fn decrypt(ciphertext: &str, key: &str) -> Option<String> {
    try_decrypt(ciphertext, key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let plaintext = "Meet me at the usual place";

        let encrypted = encrypt(plaintext, &key).unwrap();
        assert_eq!(decrypt(&encrypted, key.as_str()).as_deref(), Some(plaintext));
    }

    #[test]
    fn test_roundtrip_unicode_and_empty() {
        let key = generate_key();
        for text in ["", "héllo wörld", "🔒🔑", "line\nbreak"] {
            let encrypted = encrypt(text, &key).unwrap();
            assert_eq!(decrypt(&encrypted, key.as_str()).as_deref(), Some(text));
        }
    }

    #[test]
    fn test_wrong_key_never_decrypts() {
        for i in 0..200 {
            let k1 = generate_key();
            let k2 = generate_key();
            if k1 == k2 {
                continue;
            }
            let encrypted = encrypt(&format!("message {i}"), &k1).unwrap();
            assert!(decrypt(&encrypted, k2.as_str()).is_none());
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_key();
        let encrypted = encrypt("Important data", &key).unwrap();

        let mut raw = STANDARD.decode(&encrypted).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        let tampered = STANDARD.encode(raw);

        assert!(matches!(
            try_decrypt(&tampered, key.as_str()),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_malformed_input_is_none() {
        let key = generate_key();
        assert!(decrypt("", key.as_str()).is_none());
        assert!(decrypt("not base64 at all!!", key.as_str()).is_none());
        assert!(decrypt("AAAA", key.as_str()).is_none());
    }

    #[test]
    fn test_key_shape() {
        for _ in 0..50 {
            let key = generate_key();
            assert_eq!(key.as_str().chars().count(), KEY_LENGTH);
            assert!(key.as_str().bytes().all(|b| KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let key = generate_key();
        let a = encrypt("same", &key).unwrap();
        let b = encrypt("same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_hides_key() {
        let key = generate_key();
        assert!(!format!("{key:?}").contains(key.as_str()));
    }
}
