//! Authenticated encryption for credential material at rest.
//!
//! AES-256-GCM via `ring`. Ciphertext layout: `[12-byte nonce][ciphertext + 16-byte tag]`.

use crate::error::{HubError, HubResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;

/// Symmetric cipher for credential blobs.
pub struct CredentialCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Build a cipher from a raw 256-bit key.
    pub fn new(key: &[u8]) -> HubResult<Self> {
        if key.len() != KEY_LEN {
            return Err(HubError::Validation(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| HubError::Internal("failed to initialise AES-256-GCM key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build a cipher from a hex-encoded key (64 hex characters).
    pub fn from_hex(key_hex: &str) -> HubResult<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| HubError::Validation(format!("encryption key is not valid hex: {e}")))?;
        Self::new(&bytes)
    }

    /// Encrypt `plaintext`, returning nonce-prefixed ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> HubResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| HubError::Internal("RNG failure".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| HubError::Internal("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Any tampering, truncation or wrong key yields [`HubError::Crypto`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> HubResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(HubError::Crypto);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| HubError::Crypto)?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| HubError::Crypto)?;
        Ok(plaintext.to_vec())
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> HubResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| HubError::Internal("RNG failure".into()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let cipher = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        let blob = cipher.encrypt(b"sk-secret").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"sk-secret");
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"sk-secret");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        let mut blob = cipher.encrypt(b"sk-secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&blob), Err(HubError::Crypto)));
    }

    #[test]
    fn wrong_key_fails() {
        let a = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        let b = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        let blob = a.encrypt(b"sk-secret").unwrap();
        assert!(matches!(b.decrypt(&blob), Err(HubError::Crypto)));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let cipher = CredentialCipher::new(&generate_key().unwrap()).unwrap();
        assert!(matches!(cipher.decrypt(&[0u8; 5]), Err(HubError::Crypto)));
    }

    #[test]
    fn key_length_is_checked() {
        assert!(CredentialCipher::new(&[0u8; 16]).is_err());
        assert!(CredentialCipher::from_hex("zz").is_err());
        assert!(CredentialCipher::from_hex(&"ab".repeat(32)).is_ok());
    }
}
