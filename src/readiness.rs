//! Fail-closed readiness gate
//!
//! A process that cannot unwrap the active DEK must not serve protected
//! fields at all. The probe starts `NotReady(Pending)` and only flips to
//! `Ready` after a successful uncached unwrap of the active key.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{EnvelopeError, Result};
use crate::key_store::KeyStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum NotReadyReason {
    /// No check has completed yet
    Pending,
    NoActiveKey,
    KmsUnavailable(String),
    ConfigError(String),
    StoreUnavailable(String),
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::Pending => f.write_str("readiness not yet checked"),
            NotReadyReason::NoActiveKey => f.write_str("no active key (run crypto-init)"),
            NotReadyReason::KmsUnavailable(detail) => write!(f, "KMS unavailable: {}", detail),
            NotReadyReason::ConfigError(detail) => write!(f, "configuration error: {}", detail),
            NotReadyReason::StoreUnavailable(detail) => write!(f, "key store unavailable: {}", detail),
        }
    }
}

impl From<&EnvelopeError> for NotReadyReason {
    fn from(err: &EnvelopeError) -> Self {
        match err {
            EnvelopeError::NoActiveKey => NotReadyReason::NoActiveKey,
            EnvelopeError::KmsUnavailable(detail) => NotReadyReason::KmsUnavailable(detail.clone()),
            // The configured KEK cannot open the active DEK: wrong key or AAD
            EnvelopeError::UnwrapAuthFailure(detail) => NotReadyReason::ConfigError(detail.clone()),
            EnvelopeError::Config(detail) | EnvelopeError::Crypto(detail) => NotReadyReason::ConfigError(detail.clone()),
            other => NotReadyReason::StoreUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    pub fn reason(&self) -> Option<&NotReadyReason> {
        match self {
            Readiness::Ready => None,
            Readiness::NotReady(reason) => Some(reason),
        }
    }
}

enum Mode {
    Disabled,
    Misconfigured(String),
    Enabled(Arc<KeyStore>),
}

pub struct ReadinessProbe {
    mode: Mode,
    state: RwLock<Readiness>,
}

impl ReadinessProbe {
    /// Encryption turned off: always ready, nothing to check
    pub fn disabled() -> Self {
        Self { mode: Mode::Disabled, state: RwLock::new(Readiness::Ready) }
    }

    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { mode: Mode::Enabled(keys), state: RwLock::new(Readiness::NotReady(NotReadyReason::Pending)) }
    }

    /// Encryption enabled with configuration that could not be loaded
    pub fn misconfigured(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let state = Readiness::NotReady(NotReadyReason::ConfigError(detail.clone()));
        Self { mode: Mode::Misconfigured(detail), state: RwLock::new(state) }
    }

    /// Re-run the check and record the outcome
    pub async fn check_ready(&self) -> Readiness {
        let outcome = match &self.mode {
            Mode::Disabled => Readiness::Ready,
            Mode::Misconfigured(detail) => Readiness::NotReady(NotReadyReason::ConfigError(detail.clone())),
            Mode::Enabled(keys) => match keys.load_active_uncached().await {
                Ok(active) => {
                    tracing::info!(active_label = %active.label, "encryption ready");
                    Readiness::Ready
                }
                Err(e) => Readiness::NotReady(NotReadyReason::from(&e)),
            },
        };

        if let Readiness::NotReady(reason) = &outcome {
            tracing::warn!(%reason, "encryption not ready");
        }
        *self.state.write() = outcome.clone();
        outcome
    }

    /// Last recorded outcome
    pub fn current(&self) -> Readiness {
        self.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().is_ready()
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match &*self.state.read() {
            Readiness::Ready => Ok(()),
            Readiness::NotReady(reason) => Err(EnvelopeError::NotReady(reason.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::SecureKey;
    use crate::kek::{KekProvider, KmsKekProvider, LocalKekProvider};
    use crate::storage::{InMemoryCatalog, KeyCatalog};
    use crate::testing::FakeKms;
    use std::time::Duration;

    fn keys_with(catalog: Arc<dyn KeyCatalog>, kek: Arc<dyn KekProvider>) -> Arc<KeyStore> {
        Arc::new(KeyStore::new(
            catalog,
            kek,
            Arc::new(ManualClock::default()),
            Duration::from_secs(300),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let keys = keys_with(Arc::new(InMemoryCatalog::new()), Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap()));
        let probe = ReadinessProbe::new(keys);
        assert_eq!(probe.current(), Readiness::NotReady(NotReadyReason::Pending));
        assert!(matches!(probe.ensure_ready(), Err(EnvelopeError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_no_active_key() {
        let keys = keys_with(Arc::new(InMemoryCatalog::new()), Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap()));
        let probe = ReadinessProbe::new(keys);
        assert_eq!(probe.check_ready().await, Readiness::NotReady(NotReadyReason::NoActiveKey));
    }

    #[tokio::test]
    async fn test_ready_then_kms_outage() {
        let kms = Arc::new(FakeKms::new());
        let kek: Arc<dyn KekProvider> = Arc::new(KmsKekProvider::new(kms.clone(), "k", None, Duration::from_secs(1)));
        let keys = keys_with(Arc::new(InMemoryCatalog::new()), kek);
        keys.create_key("active", "active::1").await.unwrap();

        let probe = ReadinessProbe::new(keys.clone());
        assert!(probe.check_ready().await.is_ready());
        assert!(probe.ensure_ready().is_ok());

        // Cached DEKs must not mask the outage
        keys.load_active().await.unwrap();
        kms.set_available(false);
        let outcome = probe.check_ready().await;
        assert!(matches!(outcome, Readiness::NotReady(NotReadyReason::KmsUnavailable(_))));
        assert!(!probe.is_ready());
    }

    #[tokio::test]
    async fn test_wrong_kek_is_config_error() {
        let catalog: Arc<dyn KeyCatalog> = Arc::new(InMemoryCatalog::new());
        let right = keys_with(catalog.clone(), Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap()));
        right.create_key("active", "active::1").await.unwrap();

        let wrong = keys_with(catalog, Arc::new(LocalKekProvider::new(SecureKey::generate(), None).unwrap()));
        let probe = ReadinessProbe::new(wrong);
        assert!(matches!(probe.check_ready().await, Readiness::NotReady(NotReadyReason::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_disabled_and_misconfigured() {
        let disabled = ReadinessProbe::disabled();
        assert!(disabled.is_ready());
        assert!(disabled.check_ready().await.is_ready());

        let broken = ReadinessProbe::misconfigured("KEK_LOCAL_KEY missing");
        assert!(!broken.is_ready());
        assert_eq!(
            broken.check_ready().await,
            Readiness::NotReady(NotReadyReason::ConfigError("KEK_LOCAL_KEY missing".into()))
        );
    }

    #[test]
    fn test_reason_serializes_for_status() {
        let json = serde_json::to_string(&NotReadyReason::KmsUnavailable("timeout".into())).unwrap();
        assert_eq!(json, r#"{"reason":"kms_unavailable","detail":"timeout"}"#);
    }
}
