//! Key-encryption-key providers
//!
//! A [`KekProvider`] wraps and unwraps DEKs. Two implementations exist: a
//! local AES-256-GCM key supplied through configuration, and a network KMS
//! reached through a [`KmsClient`]. The wrapping provider is chosen once at
//! startup; a [`KekRing`] adds unwrap-only providers for rows still wrapped
//! under another KEK.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE, TAG_SIZE};
use crate::error::{EnvelopeError, Result};

/// How a DEK row was wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WrapAlgorithm {
    Local,
    Kms,
}

impl WrapAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            WrapAlgorithm::Local => "local",
            WrapAlgorithm::Kms => "kms",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(WrapAlgorithm::Local),
            "kms" => Ok(WrapAlgorithm::Kms),
            other => Err(EnvelopeError::Serialization(format!("unknown wrap algorithm: {}", other))),
        }
    }
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrapped DEK as persisted in the key catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub wrapped_dek: Vec<u8>,
    pub wrap_algorithm: WrapAlgorithm,
    /// Present only for `local`
    pub wrap_nonce: Option<Vec<u8>>,
    /// KMS resource name; `None` for `local`
    pub kek_reference: Option<String>,
}

/// Wrap/unwrap capability over one KEK
#[async_trait]
pub trait KekProvider: Send + Sync + fmt::Debug {
    fn algorithm(&self) -> WrapAlgorithm;

    /// Operator-facing description, never key material
    fn describe(&self) -> String;

    /// Whether rows wrapped as `wrapped` were produced by this provider's
    /// backend. A `true` answer does not guarantee the key matches.
    fn handles(&self, wrapped: &WrappedKey) -> bool;

    async fn wrap(&self, key_id: &Uuid, dek: &SecureKey) -> Result<WrappedKey>;

    async fn unwrap(&self, key_id: &Uuid, wrapped: &WrappedKey) -> Result<SecureKey>;
}

fn binding_aad(key_id: &Uuid, deployment_aad: Option<&[u8]>) -> Vec<u8> {
    let mut aad = key_id.as_bytes().to_vec();
    if let Some(extra) = deployment_aad {
        aad.push(b'|');
        aad.extend_from_slice(extra);
    }
    aad
}

fn check_dek(bytes: Vec<u8>, key_id: &Uuid) -> Result<SecureKey> {
    if bytes.len() != AES_256_KEY_SIZE {
        return Err(EnvelopeError::UnwrapAuthFailure(format!(
            "key {} unwrapped to {} bytes",
            key_id,
            bytes.len()
        )));
    }
    Ok(SecureKey::new(bytes))
}

/// AES-256-GCM wrapping under a locally configured key
pub struct LocalKekProvider {
    kek: SecureKey,
    aad: Option<Vec<u8>>,
}

impl LocalKekProvider {
    pub fn new(kek: SecureKey, aad: Option<Vec<u8>>) -> Result<Self> {
        if kek.len() != AES_256_KEY_SIZE {
            return Err(EnvelopeError::Config(format!(
                "local KEK must be {} bytes, got {}",
                AES_256_KEY_SIZE,
                kek.len()
            )));
        }
        Ok(Self { kek, aad })
    }
}

impl fmt::Debug for LocalKekProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKekProvider")
            .field("fingerprint", &self.kek.fingerprint())
            .finish()
    }
}

#[async_trait]
impl KekProvider for LocalKekProvider {
    fn algorithm(&self) -> WrapAlgorithm {
        WrapAlgorithm::Local
    }

    fn describe(&self) -> String {
        format!("local (fingerprint {})", self.kek.fingerprint())
    }

    fn handles(&self, wrapped: &WrappedKey) -> bool {
        wrapped.wrap_algorithm == WrapAlgorithm::Local
    }

    async fn wrap(&self, key_id: &Uuid, dek: &SecureKey) -> Result<WrappedKey> {
        let aad = binding_aad(key_id, self.aad.as_deref());
        let sealed = AesGcmCipher::encrypt(&self.kek, dek.as_bytes(), &aad)?;
        let mut wrapped_dek = sealed.ciphertext;
        wrapped_dek.extend_from_slice(&sealed.tag);

        Ok(WrappedKey {
            wrapped_dek,
            wrap_algorithm: WrapAlgorithm::Local,
            wrap_nonce: Some(sealed.nonce),
            kek_reference: None,
        })
    }

    async fn unwrap(&self, key_id: &Uuid, wrapped: &WrappedKey) -> Result<SecureKey> {
        if wrapped.wrap_algorithm != WrapAlgorithm::Local {
            return Err(EnvelopeError::Config(format!(
                "key {} is wrapped by {}, configured KEK is local",
                key_id, wrapped.wrap_algorithm
            )));
        }
        let nonce = wrapped.wrap_nonce.clone().ok_or_else(|| {
            EnvelopeError::UnwrapAuthFailure(format!("key {} has no wrap nonce", key_id))
        })?;
        if wrapped.wrapped_dek.len() < TAG_SIZE {
            return Err(EnvelopeError::UnwrapAuthFailure(format!("key {} wrapped value truncated", key_id)));
        }

        let (ciphertext, tag) = wrapped.wrapped_dek.split_at(wrapped.wrapped_dek.len() - TAG_SIZE);
        let sealed = EncryptedData { nonce, ciphertext: ciphertext.to_vec(), tag: tag.to_vec() };
        let aad = binding_aad(key_id, self.aad.as_deref());

        let bytes = AesGcmCipher::decrypt(&self.kek, &sealed, &aad).map_err(|e| match e {
            EnvelopeError::InvalidCiphertext(_) => {
                EnvelopeError::UnwrapAuthFailure(format!("key {} failed authentication", key_id))
            }
            other => other,
        })?;
        check_dek(bytes, key_id)
    }
}

/// Network key-management backend
///
/// Implementations map transport, permission, and throttling failures to
/// `KmsUnavailable` and authentication failures to `UnwrapAuthFailure`.
#[async_trait]
pub trait KmsClient: Send + Sync + fmt::Debug {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>>;

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>>;
}

/// Wrapping delegated to a KMS key
pub struct KmsKekProvider {
    client: Arc<dyn KmsClient>,
    key_name: String,
    aad: Option<Vec<u8>>,
    timeout: Duration,
}

impl KmsKekProvider {
    pub fn new(client: Arc<dyn KmsClient>, key_name: impl Into<String>, aad: Option<Vec<u8>>, timeout: Duration) -> Self {
        Self { client, key_name: key_name.into(), aad, timeout }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    async fn bounded<T>(&self, op: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            EnvelopeError::KmsUnavailable(format!("{} timed out after {:?}", op, self.timeout))
        })?
    }
}

impl fmt::Debug for KmsKekProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsKekProvider")
            .field("key_name", &self.key_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl KekProvider for KmsKekProvider {
    fn algorithm(&self) -> WrapAlgorithm {
        WrapAlgorithm::Kms
    }

    fn describe(&self) -> String {
        format!("kms ({})", self.key_name)
    }

    fn handles(&self, wrapped: &WrappedKey) -> bool {
        wrapped.wrap_algorithm == WrapAlgorithm::Kms
            && wrapped.kek_reference.as_deref() == Some(self.key_name.as_str())
    }

    async fn wrap(&self, key_id: &Uuid, dek: &SecureKey) -> Result<WrappedKey> {
        let wrapped_dek = self
            .bounded("kms encrypt", self.client.encrypt(&self.key_name, dek.as_bytes(), self.aad.as_deref()))
            .await?;
        tracing::debug!(key_id = %key_id, key_name = %self.key_name, "wrapped DEK via KMS");

        Ok(WrappedKey {
            wrapped_dek,
            wrap_algorithm: WrapAlgorithm::Kms,
            wrap_nonce: None,
            kek_reference: Some(self.key_name.clone()),
        })
    }

    async fn unwrap(&self, key_id: &Uuid, wrapped: &WrappedKey) -> Result<SecureKey> {
        if wrapped.wrap_algorithm != WrapAlgorithm::Kms {
            return Err(EnvelopeError::Config(format!(
                "key {} is wrapped by {}, configured KEK is kms",
                key_id, wrapped.wrap_algorithm
            )));
        }
        // The row names the KMS key that wrapped it, which may predate the
        // configured one.
        let key_name = wrapped.kek_reference.as_deref().unwrap_or(&self.key_name);
        let bytes = self
            .bounded("kms decrypt", self.client.decrypt(key_name, &wrapped.wrapped_dek, self.aad.as_deref()))
            .await?;
        check_dek(bytes, key_id)
    }
}

/// The providers a process can use
///
/// New wraps always go through the primary. Unwraps pick, per row, the
/// providers whose backend matches the row's `wrap_algorithm`, primary
/// first, so rows wrapped under a previous or migrating KEK stay readable
/// while a rewrap is under way.
#[derive(Debug, Clone)]
pub struct KekRing {
    primary: Arc<dyn KekProvider>,
    readers: Vec<Arc<dyn KekProvider>>,
}

impl KekRing {
    pub fn new(primary: Arc<dyn KekProvider>) -> Self {
        Self { primary, readers: Vec::new() }
    }

    /// Add an unwrap-only provider
    pub fn with_reader(mut self, reader: Arc<dyn KekProvider>) -> Self {
        self.readers.push(reader);
        self
    }

    pub fn primary(&self) -> &Arc<dyn KekProvider> {
        &self.primary
    }

    pub fn readers(&self) -> &[Arc<dyn KekProvider>] {
        &self.readers
    }

    /// Ring after a rewrap: `next` wraps, the old primary still unwraps
    pub fn rotated(&self, next: Arc<dyn KekProvider>) -> Self {
        let mut readers = Vec::with_capacity(self.readers.len() + 1);
        readers.push(Arc::clone(&self.primary));
        readers.extend(self.readers.iter().cloned());
        Self { primary: next, readers }
    }

    pub fn describe(&self) -> String {
        if self.readers.is_empty() {
            return self.primary.describe();
        }
        let readers: Vec<String> = self.readers.iter().map(|r| r.describe()).collect();
        format!("{}; also unwraps {}", self.primary.describe(), readers.join(", "))
    }

    pub async fn wrap(&self, key_id: &Uuid, dek: &SecureKey) -> Result<WrappedKey> {
        self.primary.wrap(key_id, dek).await
    }

    /// Unwrap through the first matching provider that authenticates the row
    pub async fn unwrap(&self, key_id: &Uuid, wrapped: &WrappedKey) -> Result<SecureKey> {
        let candidates = std::iter::once(&self.primary)
            .chain(self.readers.iter())
            .filter(|p| p.algorithm() == wrapped.wrap_algorithm);

        let mut last_failure = None;
        for provider in candidates {
            match provider.unwrap(key_id, wrapped).await {
                Err(EnvelopeError::UnwrapAuthFailure(detail)) => {
                    last_failure = Some(EnvelopeError::UnwrapAuthFailure(detail));
                }
                other => return other,
            }
        }
        Err(last_failure.unwrap_or_else(|| {
            EnvelopeError::Config(format!(
                "key {} is wrapped by {}, configured KEKs are {}",
                key_id,
                wrapped.wrap_algorithm,
                self.describe()
            ))
        }))
    }
}

impl From<Arc<dyn KekProvider>> for KekRing {
    fn from(primary: Arc<dyn KekProvider>) -> Self {
        Self::new(primary)
    }
}

/// KEK selector accepted by `kek-rewrap --new-kek`
#[derive(Clone)]
pub enum KekSpec {
    /// `local:<base64 32-byte key>`
    Local(SecureKey),
    /// `kms:<resource name>`
    Kms(String),
}

impl KekSpec {
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(material) = input.strip_prefix("local:") {
            Ok(KekSpec::Local(SecureKey::from_base64(material)?))
        } else if let Some(reference) = input.strip_prefix("kms:") {
            let reference = reference.trim();
            if reference.is_empty() {
                return Err(EnvelopeError::Config("empty KMS key reference".into()));
            }
            Ok(KekSpec::Kms(reference.to_string()))
        } else {
            Err(EnvelopeError::Config(
                "KEK must be given as local:<base64> or kms:<resource>".into(),
            ))
        }
    }
}

impl fmt::Debug for KekSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KekSpec::Local(key) => write!(f, "Local({})", key.fingerprint()),
            KekSpec::Kms(name) => write!(f, "Kms({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKms;

    #[tokio::test]
    async fn test_local_wrap_unwrap() {
        let provider = LocalKekProvider::new(SecureKey::generate(), None).unwrap();
        let dek = SecureKey::generate();
        let id = Uuid::new_v4();

        let wrapped = provider.wrap(&id, &dek).await.unwrap();
        assert_eq!(wrapped.wrap_algorithm, WrapAlgorithm::Local);
        assert!(wrapped.wrap_nonce.is_some());
        assert!(wrapped.kek_reference.is_none());
        assert_ne!(wrapped.wrapped_dek, dek.as_bytes());

        let unwrapped = provider.unwrap(&id, &wrapped).await.unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[tokio::test]
    async fn test_local_wrong_kek_is_auth_failure() {
        let a = LocalKekProvider::new(SecureKey::generate(), None).unwrap();
        let b = LocalKekProvider::new(SecureKey::generate(), None).unwrap();
        let id = Uuid::new_v4();
        let wrapped = a.wrap(&id, &SecureKey::generate()).await.unwrap();

        assert!(matches!(b.unwrap(&id, &wrapped).await, Err(EnvelopeError::UnwrapAuthFailure(_))));
    }

    #[tokio::test]
    async fn test_local_binds_key_id_and_deployment() {
        let kek = SecureKey::generate();
        let prod = LocalKekProvider::new(kek.clone(), Some(b"app=ledger,env=prod".to_vec())).unwrap();
        let staging = LocalKekProvider::new(kek, Some(b"app=ledger,env=staging".to_vec())).unwrap();
        let id = Uuid::new_v4();
        let wrapped = prod.wrap(&id, &SecureKey::generate()).await.unwrap();

        assert!(matches!(staging.unwrap(&id, &wrapped).await, Err(EnvelopeError::UnwrapAuthFailure(_))));
        assert!(matches!(
            prod.unwrap(&Uuid::new_v4(), &wrapped).await,
            Err(EnvelopeError::UnwrapAuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_local_tampered_wrap_rejected() {
        let provider = LocalKekProvider::new(SecureKey::generate(), None).unwrap();
        let id = Uuid::new_v4();
        let mut wrapped = provider.wrap(&id, &SecureKey::generate()).await.unwrap();
        wrapped.wrapped_dek[0] ^= 0x01;

        assert!(matches!(provider.unwrap(&id, &wrapped).await, Err(EnvelopeError::UnwrapAuthFailure(_))));
    }

    #[tokio::test]
    async fn test_kms_round_trip_and_reference() {
        let kms = Arc::new(FakeKms::new());
        let provider = KmsKekProvider::new(kms, "projects/p/keys/a", Some(b"env=prod".to_vec()), Duration::from_secs(1));
        let id = Uuid::new_v4();
        let dek = SecureKey::generate();

        let wrapped = provider.wrap(&id, &dek).await.unwrap();
        assert_eq!(wrapped.kek_reference.as_deref(), Some("projects/p/keys/a"));
        assert!(wrapped.wrap_nonce.is_none());
        assert!(provider.handles(&wrapped));
        assert_eq!(provider.unwrap(&id, &wrapped).await.unwrap(), dek);
    }

    #[tokio::test]
    async fn test_kms_aad_mismatch_is_auth_failure() {
        let kms = Arc::new(FakeKms::new());
        let prod = KmsKekProvider::new(kms.clone(), "k", Some(b"env=prod".to_vec()), Duration::from_secs(1));
        let dev = KmsKekProvider::new(kms, "k", Some(b"env=dev".to_vec()), Duration::from_secs(1));
        let id = Uuid::new_v4();
        let wrapped = prod.wrap(&id, &SecureKey::generate()).await.unwrap();

        assert!(matches!(dev.unwrap(&id, &wrapped).await, Err(EnvelopeError::UnwrapAuthFailure(_))));
    }

    #[tokio::test]
    async fn test_kms_outage_is_unavailable() {
        let kms = Arc::new(FakeKms::new());
        let provider = KmsKekProvider::new(kms.clone(), "k", None, Duration::from_secs(1));
        let id = Uuid::new_v4();
        let wrapped = provider.wrap(&id, &SecureKey::generate()).await.unwrap();

        kms.set_available(false);
        assert!(matches!(provider.unwrap(&id, &wrapped).await, Err(EnvelopeError::KmsUnavailable(_))));
    }

    #[tokio::test]
    async fn test_kms_timeout_is_unavailable() {
        let kms = Arc::new(FakeKms::new());
        kms.set_delay(Duration::from_millis(200));
        let provider = KmsKekProvider::new(kms, "k", None, Duration::from_millis(20));

        let result = provider.wrap(&Uuid::new_v4(), &SecureKey::generate()).await;
        assert!(matches!(result, Err(EnvelopeError::KmsUnavailable(_))));
    }

    #[tokio::test]
    async fn test_ring_unwraps_rows_of_either_backend() {
        let kms = Arc::new(FakeKms::new());
        let local: Arc<dyn KekProvider> = Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap());
        let remote: Arc<dyn KekProvider> =
            Arc::new(KmsKekProvider::new(kms, "projects/p/keys/a", None, Duration::from_secs(1)));
        let id = Uuid::new_v4();
        let dek = SecureKey::generate();
        let local_row = local.wrap(&id, &dek).await.unwrap();
        let kms_row = remote.wrap(&id, &dek).await.unwrap();

        let ring = KekRing::new(remote.clone()).with_reader(local.clone());
        assert_eq!(ring.unwrap(&id, &local_row).await.unwrap(), dek);
        assert_eq!(ring.unwrap(&id, &kms_row).await.unwrap(), dek);
        assert_eq!(ring.wrap(&id, &dek).await.unwrap().wrap_algorithm, WrapAlgorithm::Kms);

        let kms_only = KekRing::new(remote);
        assert!(matches!(kms_only.unwrap(&id, &local_row).await, Err(EnvelopeError::Config(_))));
    }

    #[tokio::test]
    async fn test_ring_falls_back_to_previous_local_key() {
        let old: Arc<dyn KekProvider> = Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap());
        let new: Arc<dyn KekProvider> = Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap());
        let id = Uuid::new_v4();
        let dek = SecureKey::generate();
        let wrapped = old.wrap(&id, &dek).await.unwrap();

        let ring = KekRing::new(old).rotated(new.clone());
        assert_eq!(ring.readers().len(), 1);
        assert_eq!(ring.unwrap(&id, &wrapped).await.unwrap(), dek);

        let stranger = KekRing::new(new);
        assert!(matches!(stranger.unwrap(&id, &wrapped).await, Err(EnvelopeError::UnwrapAuthFailure(_))));
    }

    #[test]
    fn test_kek_spec_parse() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let local = format!("local:{}", STANDARD.encode([3u8; 32]));
        assert!(matches!(KekSpec::parse(&local).unwrap(), KekSpec::Local(_)));
        assert!(matches!(
            KekSpec::parse("kms:projects/p/locations/l/keyRings/r/cryptoKeys/k").unwrap(),
            KekSpec::Kms(ref name) if name == "projects/p/locations/l/keyRings/r/cryptoKeys/k"
        ));
        assert!(KekSpec::parse("kms:").is_err());
        assert!(KekSpec::parse("plain-string").is_err());
    }
}
