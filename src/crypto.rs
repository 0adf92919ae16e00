//! Reversible cipher for identity fields persisted at rest.
//!
//! Email, nickname, and profile image URL are never stored in the clear.
//! The vault only sees the [`IdentityCipher`] trait; the concrete transform
//! is supplied by the embedding application. [`AesGcmCipher`] is the default.
//!
//! # Wire Format
//!
//! Each ciphertext is a JSON envelope:
//! ```json
//! { "nonce": "<base64>", "ciphertext": "<base64>", "version": 1 }
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Envelope format version.
const ENVELOPE_VERSION: u8 = 1;

/// Opaque reversible transform for persisted identity fields.
///
/// Implementations must round-trip any UTF-8 string. Failures (wrong key,
/// tampered data) surface as errors; the vault treats a decrypt failure as
/// "field unavailable", not as fatal.
pub trait IdentityCipher: Send + Sync {
    /// Encrypt a plaintext field into an opaque string.
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Decrypt a previously encrypted field.
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

impl std::fmt::Debug for dyn IdentityCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityCipher")
    }
}

/// Encrypted field envelope stored in the key-value store.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedField {
    /// Base64-encoded nonce (12 bytes).
    nonce: String,
    /// Base64-encoded ciphertext.
    ciphertext: String,
    /// Envelope format version.
    version: u8,
}

/// AES-256-GCM identity cipher with a random per-field nonce.
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    /// Create a cipher from a raw 256-bit key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a cipher with a freshly generated random key.
    ///
    /// Useful for ephemeral sessions where identity fields should become
    /// unreadable once the process exits.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }
}

impl IdentityCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("valid key length");

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {e}"))?;

        let envelope = EncryptedField {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
            version: ENVELOPE_VERSION,
        };

        Ok(serde_json::to_string(&envelope).expect("envelope serializable"))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let envelope: EncryptedField =
            serde_json::from_str(ciphertext).context("Invalid ciphertext envelope")?;

        let cipher = Aes256Gcm::new_from_slice(&self.key).expect("valid key length");

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .context("Invalid nonce encoding")?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let data = BASE64
            .decode(&envelope.ciphertext)
            .context("Invalid ciphertext encoding")?;

        let plaintext = cipher
            .decrypt(nonce, data.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed: {e}"))?;

        String::from_utf8(plaintext).context("Decrypted data is not UTF-8")
    }
}
