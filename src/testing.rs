//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{EnvelopeError, Result};
use crate::kek::KmsClient;

/// In-process KMS: one AES key per key name, with an outage switch
#[derive(Debug)]
pub struct FakeKms {
    available: AtomicBool,
    delay: Mutex<Option<Duration>>,
    decrypts: AtomicUsize,
}

impl FakeKms {
    pub fn new() -> Self {
        Self { available: AtomicBool::new(true), delay: Mutex::new(None), decrypts: AtomicUsize::new(0) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn decrypts(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }

    fn key_for(name: &str) -> SecureKey {
        SecureKey::new(Sha256::digest(name.as_bytes()).to_vec())
    }

    async fn gate(&self) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(EnvelopeError::KmsUnavailable("fake KMS offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KmsClient for FakeKms {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        self.gate().await?;
        let sealed = AesGcmCipher::encrypt(&Self::key_for(key_name), plaintext, aad.unwrap_or_default())?;
        Ok([sealed.nonce, sealed.ciphertext, sealed.tag].concat())
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        self.gate().await?;
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EnvelopeError::UnwrapAuthFailure("ciphertext truncated".into()));
        }
        let (nonce, rest) = ciphertext.split_at(NONCE_SIZE);
        let (body, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let sealed = EncryptedData { nonce: nonce.to_vec(), ciphertext: body.to_vec(), tag: tag.to_vec() };
        AesGcmCipher::decrypt(&Self::key_for(key_name), &sealed, aad.unwrap_or_default())
            .map_err(|_| EnvelopeError::UnwrapAuthFailure(format!("KMS key {} rejected ciphertext", key_name)))
    }
}
