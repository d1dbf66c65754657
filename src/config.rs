//! Environment-driven configuration
//!
//! Environment variables:
//! - ENCRYPTION_ENABLED: gate the whole subsystem (default false)
//! - KEK_MODE: `local` or `kms` (default local)
//! - KEK_LOCAL_KEY: base64 32-byte KEK for local mode
//! - KEK_KMS_KEY: KMS key resource name for kms mode
//! - KEK_LOCAL_KEY_PREVIOUS: base64 local KEK kept for unwrapping only
//!
//! In kms mode a set KEK_LOCAL_KEY, and in local mode a set KEK_KMS_KEY,
//! is used to unwrap rows still (or already) wrapped by the other backend.
//! - KEK_AAD: deployment AAD bound into every wrap, e.g. `app=ledger,env=prod`
//! - KMS_ENDPOINT, KMS_ACCESS_TOKEN, KMS_TIMEOUT_SECS (5)
//! - WRITE_LABEL_TTL_SECS (5), DEK_CACHE_TTL_SECS (300)
//! - ENCRYPTED_COLUMNS: comma-separated `table.key_column.column`

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::SecureKey;
use crate::error::{EnvelopeError, Result};
use crate::kms_http::DEFAULT_KMS_ENDPOINT;
use crate::storage::ProtectedColumn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KekMode {
    Local,
    Kms,
}

impl KekMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "kms" => Ok(Self::Kms),
            other => Err(EnvelopeError::Config(format!("KEK_MODE must be local or kms, got {:?}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KekMode::Local => "local",
            KekMode::Kms => "kms",
        }
    }
}

#[derive(Debug, Clone)]
pub enum KekConfig {
    Local(SecureKey),
    Kms { key_name: String },
}

impl KekConfig {
    pub fn mode(&self) -> KekMode {
        match self {
            KekConfig::Local(_) => KekMode::Local,
            KekConfig::Kms { .. } => KekMode::Kms,
        }
    }
}

#[derive(Clone)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Present whenever `enabled`
    pub kek: Option<KekConfig>,
    /// Unwrap-only KEKs for rows wrapped under another key or backend
    pub previous_keks: Vec<KekConfig>,
    pub kek_aad: Option<String>,
    pub kms_endpoint: String,
    pub kms_access_token: Option<String>,
    pub kms_timeout: Duration,
    pub write_label_ttl: Duration,
    pub dek_cache_ttl: Duration,
    pub columns: Vec<ProtectedColumn>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kek: None,
            previous_keks: Vec::new(),
            kek_aad: None,
            kms_endpoint: DEFAULT_KMS_ENDPOINT.to_string(),
            kms_access_token: None,
            kms_timeout: Duration::from_secs(5),
            write_label_ttl: Duration::from_secs(5),
            dek_cache_ttl: Duration::from_secs(300),
            columns: ProtectedColumn::defaults(),
        }
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("kek", &self.kek)
            .field("previous_keks", &self.previous_keks)
            .field("kek_aad", &self.kek_aad)
            .field("kms_endpoint", &self.kms_endpoint)
            .field("kms_access_token", &self.kms_access_token.as_ref().map(|_| "[REDACTED]"))
            .field("kms_timeout", &self.kms_timeout)
            .field("write_label_ttl", &self.write_label_ttl)
            .field("dek_cache_ttl", &self.dek_cache_ttl)
            .field("columns", &self.columns)
            .finish()
    }
}

impl EncryptionConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let enabled = match get("ENCRYPTION_ENABLED") {
            Some(v) => parse_bool("ENCRYPTION_ENABLED", &v)?,
            None => false,
        };

        let mut previous_keks = Vec::new();
        let kek = if enabled {
            let mode = get("KEK_MODE").map(|m| KekMode::parse(&m)).transpose()?.unwrap_or(KekMode::Local);
            let local = get("KEK_LOCAL_KEY").map(|m| SecureKey::from_base64(&m)).transpose()?;
            let kms = get("KEK_KMS_KEY");
            let primary = match mode {
                KekMode::Local => {
                    let key = local
                        .ok_or_else(|| EnvelopeError::Config("KEK_LOCAL_KEY not set for local KEK mode".into()))?;
                    previous_keks.extend(kms.map(|key_name| KekConfig::Kms { key_name }));
                    KekConfig::Local(key)
                }
                KekMode::Kms => {
                    let key_name =
                        kms.ok_or_else(|| EnvelopeError::Config("KEK_KMS_KEY not set for kms KEK mode".into()))?;
                    previous_keks.extend(local.map(KekConfig::Local));
                    KekConfig::Kms { key_name }
                }
            };
            if let Some(material) = get("KEK_LOCAL_KEY_PREVIOUS") {
                previous_keks.push(KekConfig::Local(SecureKey::from_base64(&material)?));
            }
            Some(primary)
        } else {
            None
        };

        let columns = match get("ENCRYPTED_COLUMNS") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ProtectedColumn::parse)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.columns,
        };

        let config = Self {
            enabled,
            kek,
            previous_keks,
            kek_aad: get("KEK_AAD"),
            kms_endpoint: get("KMS_ENDPOINT").unwrap_or(defaults.kms_endpoint),
            kms_access_token: get("KMS_ACCESS_TOKEN"),
            kms_timeout: secs(&get, "KMS_TIMEOUT_SECS", defaults.kms_timeout)?,
            write_label_ttl: secs(&get, "WRITE_LABEL_TTL_SECS", defaults.write_label_ttl)?,
            dek_cache_ttl: secs(&get, "DEK_CACHE_TTL_SECS", defaults.dek_cache_ttl)?,
            columns,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.kek.is_none() {
            return Err(EnvelopeError::Config("encryption enabled but no KEK configured".into()));
        }
        for (name, value) in [
            ("KMS_TIMEOUT_SECS", self.kms_timeout),
            ("WRITE_LABEL_TTL_SECS", self.write_label_ttl),
            ("DEK_CACHE_TTL_SECS", self.dek_cache_ttl),
        ] {
            if value.is_zero() {
                return Err(EnvelopeError::Config(format!("{} must be positive", name)));
            }
        }
        if self.columns.is_empty() {
            return Err(EnvelopeError::Config("ENCRYPTED_COLUMNS lists no columns".into()));
        }
        Ok(())
    }

    pub fn kek_mode(&self) -> Option<KekMode> {
        self.kek.as_ref().map(KekConfig::mode)
    }

    pub fn aad_bytes(&self) -> Option<Vec<u8>> {
        self.kek_aad.as_ref().map(|aad| aad.as_bytes().to_vec())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EnvelopeError::Config(format!("{} must be a boolean, got {:?}", name, value))),
    }
}

fn secs<G>(get: &G, name: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| EnvelopeError::Config(format!("{} must be whole seconds, got {:?}", name, v))),
        None => Ok(default),
    }
}
