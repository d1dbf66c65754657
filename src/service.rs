//! Wiring of the engine from configuration
//!
//! Builds the KEK provider, key store, write-label registry, cipher,
//! orchestrator and readiness probe. A disabled or misconfigured service
//! still answers readiness and status so operators can see why.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::{EncryptionConfig, KekConfig, KekMode};
use crate::error::{EnvelopeError, Result};
use crate::field_cipher::FieldCipher;
use crate::kek::{KekProvider, KekRing, KekSpec, KmsKekProvider, LocalKekProvider};
use crate::key_store::KeyStore;
use crate::kms_http::HttpKmsClient;
use crate::label::{LabelKind, ACTIVE_LABEL};
use crate::readiness::{NotReadyReason, Readiness, ReadinessProbe};
use crate::rotation::RotationOrchestrator;
use crate::storage::{KeyCatalog, ProtectedStore};
use crate::write_label::WriteLabelRegistry;

/// Snapshot reported by `crypto-status`
#[derive(Debug, Clone, Serialize)]
pub struct CryptoStatus {
    pub enabled: bool,
    pub kek_mode: Option<KekMode>,
    /// `active` when an active key exists
    pub active_label: Option<String>,
    /// Origin label of the active key, as carried by its ciphertext
    pub active_key_label: Option<String>,
    pub rotating_label: Option<String>,
    pub retired_labels: Vec<String>,
    pub write_label: Option<String>,
    pub ready: bool,
    pub not_ready_reason: Option<NotReadyReason>,
}

impl fmt::Display for CryptoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let or_none = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        writeln!(f, "enabled:        {}", self.enabled)?;
        writeln!(f, "kek_mode:       {}", self.kek_mode.map(|m| m.as_str()).unwrap_or("-"))?;
        writeln!(f, "active_label:   {}", or_none(&self.active_label))?;
        writeln!(f, "active_key:     {}", or_none(&self.active_key_label))?;
        writeln!(f, "rotating_label: {}", or_none(&self.rotating_label))?;
        writeln!(f, "retired_labels: {}", self.retired_labels.len())?;
        for label in &self.retired_labels {
            writeln!(f, "  {}", label)?;
        }
        writeln!(f, "write_label:    {}", or_none(&self.write_label))?;
        match &self.not_ready_reason {
            None => write!(f, "ready:          {}", self.ready),
            Some(reason) => write!(f, "ready:          {} ({})", self.ready, reason),
        }
    }
}

struct Engine {
    keys: Arc<KeyStore>,
    cipher: Arc<FieldCipher>,
    orchestrator: RotationOrchestrator,
}

pub struct EncryptionService {
    config: EncryptionConfig,
    catalog: Arc<dyn KeyCatalog>,
    readiness: Arc<ReadinessProbe>,
    engine: Option<Engine>,
}

impl EncryptionService {
    /// Build from configuration with the configured KEK provider
    pub fn new(config: EncryptionConfig, catalog: Arc<dyn KeyCatalog>, protected: Arc<dyn ProtectedStore>) -> Self {
        if !config.enabled {
            return Self::disabled(config, catalog);
        }
        match build_ring(&config) {
            Ok(keks) => Self::with_provider(config, catalog, protected, keks, Arc::new(SystemClock)),
            Err(e) => {
                tracing::error!(error = %e, "failed to build KEK provider");
                Self::misconfigured(config, catalog, e.to_string())
            }
        }
    }

    /// Build around explicit KEK providers and clock
    pub fn with_provider(
        config: EncryptionConfig,
        catalog: Arc<dyn KeyCatalog>,
        protected: Arc<dyn ProtectedStore>,
        keks: impl Into<KekRing>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = Arc::new(KeyStore::new(
            catalog.clone(),
            keks,
            clock.clone(),
            config.dek_cache_ttl,
            config.write_label_ttl,
        ));
        let write_labels = Arc::new(WriteLabelRegistry::new(catalog.clone(), clock, config.write_label_ttl));
        let readiness = Arc::new(ReadinessProbe::new(keys.clone()));
        let cipher = Arc::new(FieldCipher::new(keys.clone(), write_labels.clone(), readiness.clone()));
        let orchestrator = RotationOrchestrator::new(keys.clone(), write_labels, protected);

        Self { config, catalog, readiness, engine: Some(Engine { keys, cipher, orchestrator }) }
    }

    pub fn disabled(config: EncryptionConfig, catalog: Arc<dyn KeyCatalog>) -> Self {
        Self { config, catalog, readiness: Arc::new(ReadinessProbe::disabled()), engine: None }
    }

    /// Encryption enabled but unusable; every operation reports `detail`
    pub fn misconfigured(config: EncryptionConfig, catalog: Arc<dyn KeyCatalog>, detail: impl Into<String>) -> Self {
        Self { config, catalog, readiness: Arc::new(ReadinessProbe::misconfigured(detail)), engine: None }
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    pub fn readiness(&self) -> &Arc<ReadinessProbe> {
        &self.readiness
    }

    pub async fn check_ready(&self) -> Readiness {
        self.readiness.check_ready().await
    }

    pub fn cipher(&self) -> Result<Arc<FieldCipher>> {
        Ok(self.engine()?.cipher.clone())
    }

    pub fn orchestrator(&self) -> Result<&RotationOrchestrator> {
        Ok(&self.engine()?.orchestrator)
    }

    pub fn key_store(&self) -> Result<&Arc<KeyStore>> {
        Ok(&self.engine()?.keys)
    }

    /// Build a provider for `kek-rewrap` sharing this deployment's AAD and KMS settings
    pub fn provider_from_spec(&self, spec: KekSpec) -> Result<Arc<dyn KekProvider>> {
        let kek = match spec {
            KekSpec::Local(key) => KekConfig::Local(key),
            KekSpec::Kms(key_name) => KekConfig::Kms { key_name },
        };
        provider_for(&self.config, &kek)
    }

    /// Re-check readiness and report the catalog
    pub async fn status(&self) -> Result<CryptoStatus> {
        let readiness = self.check_ready().await;
        let mut status = CryptoStatus {
            enabled: self.config.enabled,
            kek_mode: self.config.kek_mode(),
            active_label: None,
            active_key_label: None,
            rotating_label: None,
            retired_labels: Vec::new(),
            write_label: None,
            ready: readiness.is_ready(),
            not_ready_reason: readiness.reason().cloned(),
        };
        if !self.config.enabled {
            return Ok(status);
        }

        for key in self.catalog.list_keys().await? {
            match LabelKind::of(&key.label) {
                Some(LabelKind::Active) if key.retired_at.is_none() => {
                    status.active_label = Some(ACTIVE_LABEL.to_string());
                    status.active_key_label = Some(key.origin_label);
                }
                Some(LabelKind::Rotating) if key.retired_at.is_none() => status.rotating_label = Some(key.label),
                _ if key.retired_at.is_some() => status.retired_labels.push(key.label),
                _ => {}
            }
        }
        status.write_label = self.catalog.load_write_label().await?;
        Ok(status)
    }

    fn engine(&self) -> Result<&Engine> {
        match (&self.engine, self.config.enabled) {
            (Some(engine), _) => Ok(engine),
            (None, false) => Err(EnvelopeError::Config("encryption is disabled (ENCRYPTION_ENABLED=false)".into())),
            (None, true) => Err(EnvelopeError::NotReady(
                self.readiness.current().reason().map(|r| r.to_string()).unwrap_or_default(),
            )),
        }
    }
}

/// The provider named by the configuration
pub fn build_provider(config: &EncryptionConfig) -> Result<Arc<dyn KekProvider>> {
    let kek = config
        .kek
        .as_ref()
        .ok_or_else(|| EnvelopeError::Config("no KEK configured".into()))?;
    provider_for(config, kek)
}

/// The configured provider plus every configured unwrap-only KEK
pub fn build_ring(config: &EncryptionConfig) -> Result<KekRing> {
    let mut ring = KekRing::new(build_provider(config)?);
    for kek in &config.previous_keks {
        ring = ring.with_reader(provider_for(config, kek)?);
    }
    tracing::debug!(keks = %ring.describe(), "built KEK ring");
    Ok(ring)
}

fn provider_for(config: &EncryptionConfig, kek: &KekConfig) -> Result<Arc<dyn KekProvider>> {
    let provider: Arc<dyn KekProvider> = match kek {
        KekConfig::Local(key) => Arc::new(LocalKekProvider::new(key.clone(), config.aad_bytes())?),
        KekConfig::Kms { key_name } => {
            let client = HttpKmsClient::new(
                config.kms_endpoint.clone(),
                config.kms_access_token.clone(),
                config.kms_timeout,
            )?;
            Arc::new(KmsKekProvider::new(Arc::new(client), key_name.clone(), config.aad_bytes(), config.kms_timeout))
        }
    };
    tracing::debug!(provider = %provider.describe(), "built KEK provider");
    Ok(provider)
}
