//! Cryptographic primitives for envelope encryption
//!
//! AES-256-GCM encryption/decryption shared by the local KEK wrapper and the
//! field cipher.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EnvelopeError, Result};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        let mut key = vec![0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    /// Decode a base64 key and require exactly 32 bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EnvelopeError::Config(format!("Invalid base64 key: {}", e)))?;
        if bytes.len() != AES_256_KEY_SIZE {
            return Err(EnvelopeError::Config(format!(
                "Key must decode to exactly {} bytes, got {}",
                AES_256_KEY_SIZE,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Short non-secret identifier: first 8 bytes of SHA-256, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl PartialEq for SecureKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SecureKey {}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// AES-GCM output with the authentication tag split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext without the tag
    pub ciphertext: Vec<u8>,
    /// The 16-byte GCM authentication tag
    pub tag: Vec<u8>,
}

impl EncryptedData {
    /// Split the combined `ciphertext || tag` returned by the AEAD
    fn from_sealed(nonce: Vec<u8>, mut sealed: Vec<u8>) -> Result<Self> {
        if sealed.len() < TAG_SIZE {
            return Err(EnvelopeError::Crypto("Sealed output shorter than tag".into()));
        }
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);
        Ok(Self { nonce, ciphertext: sealed, tag })
    }

    fn sealed(&self) -> Vec<u8> {
        [self.ciphertext.as_slice(), self.tag.as_slice()].concat()
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM with a fresh random nonce
    ///
    /// # Arguments
    /// * `key` - The 256-bit encryption key
    /// * `plaintext` - The data to encrypt
    /// * `aad` - Additional authenticated data bound to the ciphertext
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
        let cipher = Self::cipher(key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| EnvelopeError::Crypto(format!("Encryption error: {}", e)))?;

        EncryptedData::from_sealed(nonce_bytes.to_vec(), sealed)
    }

    /// Decrypt ciphertext using AES-256-GCM
    ///
    /// Tag mismatch (tamper, wrong key, wrong AAD) is `InvalidCiphertext`.
    pub fn decrypt(key: &SecureKey, encrypted: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = Self::cipher(key)?;

        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(EnvelopeError::InvalidCiphertext(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }
        if encrypted.tag.len() != TAG_SIZE {
            return Err(EnvelopeError::InvalidCiphertext(format!(
                "Invalid tag size: expected {}, got {}",
                TAG_SIZE,
                encrypted.tag.len()
            )));
        }

        let nonce = Nonce::from_slice(&encrypted.nonce);
        let sealed = encrypted.sealed();

        cipher
            .decrypt(nonce, Payload { msg: &sealed, aad })
            .map_err(|_| EnvelopeError::InvalidCiphertext("authentication failed".into()))
    }

    fn cipher(key: &SecureKey) -> Result<Aes256Gcm> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(EnvelopeError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))
    }
}
