//! Encryption of bot credentials at rest
//!
//! Tokens are sealed with ChaCha20-Poly1305 under the deployment's 32-byte
//! crypt secret. The stored form is `base64(nonce || ciphertext || tag)`.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::types::{Result, RuinousError};

/// Secret key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Symmetric cipher for short secrets such as OAuth tokens
pub struct TokenCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl TokenCipher {
    /// Build a cipher from the configured secret, which must be exactly 32 bytes
    pub fn new(secret: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = secret.try_into().map_err(|_| {
            RuinousError::Config(format!(
                "crypt secret must be exactly {KEY_LEN} bytes, got {}",
                secret.len()
            ))
        })?;
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| RuinousError::Internal(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Decrypt a value produced by [`TokenCipher::encrypt`]
    ///
    /// Fails with `Auth` when the value was sealed under another key or has
    /// been tampered with.
    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|e| RuinousError::Auth(format!("Sealed token is not base64: {e}")))?;

        if raw.len() <= NONCE_LEN {
            return Err(RuinousError::Auth("Sealed token is truncated".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| RuinousError::Auth("Failed to decrypt token".into()))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| RuinousError::Auth("Decrypted token is not UTF-8".into()))
    }
}
