//! Field-level encryption using ChaCha20-Poly1305 AEAD
//!
//! Provides the symmetric encryption layer for history records and peer
//! channel frames. Keys are derived from the user's secret phrase with
//! HKDF-SHA256; the derived key lives only in process memory and is never
//! written to storage.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// HKDF info label, fixed for all derived record keys
const KDF_INFO: &[u8] = b"chronicle.v1.key";

/// An encrypted field as persisted and transmitted.
///
/// The ciphertext carries the AEAD tag concatenated at the end; the nonce
/// travels alongside it. Both are base64 so the pair can be embedded in
/// JSON payloads unchanged. Only [`RecordCrypto`] constructs or consumes
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    /// Base64-encoded ciphertext + 16-byte auth tag
    pub ciphertext: String,
    /// Base64-encoded 12-byte nonce
    pub iv: String,
}

/// Symmetric encryption for record fields and channel frames.
///
/// One instance wraps one derived key. The same `(secret, context)` pair
/// always derives the same key, so any two devices holding the secret can
/// decrypt each other's data without ever exchanging key material.
pub struct RecordCrypto {
    cipher: ChaCha20Poly1305,
}

impl RecordCrypto {
    /// Derive a crypto instance from a user secret and a context string.
    ///
    /// The context namespaces keys: record encryption and peer channels use
    /// different contexts and therefore different keys. The HKDF salt is
    /// derived from the context, so no salt storage is needed.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::KeyDerivation` if the secret is empty.
    pub fn derive(secret: &str, context: &str) -> Result<Self, SyncError> {
        let key = Self::derive_key(secret, context)?;
        Ok(Self::from_key(&key))
    }

    /// Derive the raw 32-byte key for a secret and context.
    pub fn derive_key(secret: &str, context: &str) -> Result<[u8; 32], SyncError> {
        if secret.is_empty() {
            return Err(SyncError::KeyDerivation(
                "secret must not be empty".to_string(),
            ));
        }

        let salt = Sha256::digest(context.as_bytes());
        let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KDF_INFO, &mut key)
            .map_err(|e| SyncError::KeyDerivation(format!("HKDF expand failed: {}", e)))?;
        Ok(key)
    }

    /// Create a crypto instance from an existing 32-byte key.
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt a string field.
    ///
    /// A fresh random nonce is generated per call, so encrypting the same
    /// plaintext twice yields different ciphertext and different nonces.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedField, SyncError> {
        let nonce_bytes = Self::generate_nonce();
        let ciphertext = self.encrypt_with_nonce(plaintext.as_bytes(), &nonce_bytes)?;

        Ok(EncryptedField {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(nonce_bytes),
        })
    }

    /// Decrypt a field back to the plaintext string.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Authentication` if the nonce, ciphertext, or tag
    /// fail to verify (tampering or wrong key). Never returns garbage.
    pub fn decrypt(&self, field: &EncryptedField) -> Result<String, SyncError> {
        let ciphertext = BASE64
            .decode(&field.ciphertext)
            .map_err(|e| SyncError::Authentication(format!("Invalid ciphertext encoding: {}", e)))?;
        let iv = BASE64
            .decode(&field.iv)
            .map_err(|e| SyncError::Authentication(format!("Invalid nonce encoding: {}", e)))?;

        if iv.len() != NONCE_SIZE {
            return Err(SyncError::Authentication(format!(
                "Nonce must be {} bytes, got {}",
                NONCE_SIZE,
                iv.len()
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&iv);

        let plaintext = self.decrypt_with_nonce(&ciphertext, &nonce)?;
        String::from_utf8(plaintext)
            .map_err(|e| SyncError::Authentication(format!("Decrypted data is not UTF-8: {}", e)))
    }

    /// Encrypt raw bytes with a caller-supplied nonce.
    ///
    /// The nonce is not prepended; the caller stores it separately. Used by
    /// the peer channel framing, which carries the nonce in the frame header.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Authentication(format!("Encryption failed: {}", e)))
    }

    /// Decrypt raw bytes with a caller-supplied nonce.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SyncError::Authentication(format!("Decryption failed: {}", e)))
    }
}
