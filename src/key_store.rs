use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::clock::{to_chrono, Clock};
use crate::crypto::SecureKey;
use crate::error::{EnvelopeError, Result};
use crate::kek::{KekProvider, KekRing};
use crate::label;
use crate::storage::{EncryptionKey, KeyCatalog};

/// A DEK together with the origin label ciphertext under it carries
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub label: String,
    pub dek: SecureKey,
}

#[derive(Debug, Clone)]
pub struct RewrapReport {
    pub rewrapped: usize,
    pub already_current: usize,
    pub provider: String,
}

impl std::fmt::Display for RewrapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} DEKs re-wrapped under {}, {} already current",
            self.rewrapped, self.provider, self.already_current
        )
    }
}

struct CachedDek {
    key: ResolvedKey,
    cached_at: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Default)]
struct DekCache {
    entries: HashMap<String, CachedDek>,
    /// Bumped by every invalidation; lookups that started under an older
    /// generation do not populate the cache
    generation: u64,
}

/// Key catalog access: KEK → wrapped DEK rows → plaintext DEKs
///
/// Unwrapped DEKs are memoized per process. Entries looked up by origin
/// label never change meaning and live for the DEK TTL; entries looked up
/// by a lifecycle label (`active`, which moves at finalize) live only for
/// the alias TTL. Every label transition clears the cache.
///
/// Rows are unwrapped through a [`KekRing`], so a process keeps reading
/// rows wrapped under any KEK it is configured with.
pub struct KeyStore {
    catalog: Arc<dyn KeyCatalog>,
    keks: RwLock<KekRing>,
    clock: Arc<dyn Clock>,
    dek_ttl: Duration,
    alias_ttl: Duration,
    cache: RwLock<DekCache>,
}

impl KeyStore {
    pub fn new(
        catalog: Arc<dyn KeyCatalog>,
        keks: impl Into<KekRing>,
        clock: Arc<dyn Clock>,
        dek_ttl: std::time::Duration,
        alias_ttl: std::time::Duration,
    ) -> Self {
        Self {
            catalog,
            keks: RwLock::new(keks.into()),
            clock,
            dek_ttl: to_chrono(dek_ttl),
            alias_ttl: to_chrono(alias_ttl),
            cache: RwLock::new(DekCache::default()),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn KeyCatalog> {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The provider currently used for wrapping
    pub fn kek(&self) -> Arc<dyn KekProvider> {
        Arc::clone(self.keks.read().primary())
    }

    pub fn keks(&self) -> KekRing {
        self.keks.read().clone()
    }

    /// Find the active row and unwrap its DEK. The returned label is the
    /// active key's origin label.
    pub async fn load_active(&self) -> Result<ResolvedKey> {
        self.resolve_key(label::ACTIVE_LABEL).await.map_err(|e| match e {
            EnvelopeError::UnknownLabel(_) => EnvelopeError::NoActiveKey,
            other => other,
        })
    }

    /// `load_active` bypassing the cache, so the KEK is exercised
    pub async fn load_active_uncached(&self) -> Result<ResolvedKey> {
        let row = self.catalog.active_key().await?.ok_or(EnvelopeError::NoActiveKey)?;
        let dek = self.unwrap_row(&row).await?;
        Ok(ResolvedKey { label: row.origin_label, dek })
    }

    /// Unwrap the DEK a ciphertext label refers to
    pub async fn resolve(&self, label: &str) -> Result<SecureKey> {
        Ok(self.resolve_key(label).await?.dek)
    }

    /// Resolve a label (lifecycle or origin) to its key
    pub async fn resolve_key(&self, label: &str) -> Result<ResolvedKey> {
        label::validate(label)?;
        let now = self.clock.now();

        let generation = {
            let cache = self.cache.read();
            if let Some(cached) = cache.entries.get(label) {
                if now - cached.cached_at < cached.ttl {
                    return Ok(cached.key.clone());
                }
            }
            cache.generation
        };

        let row = self
            .catalog
            .find_by_label(label)
            .await?
            .ok_or_else(|| EnvelopeError::UnknownLabel(label.to_string()))?;
        let dek = self.unwrap_row(&row).await?;
        let key = ResolvedKey { label: row.origin_label.clone(), dek };

        let mut cache = self.cache.write();
        if cache.generation != generation {
            // The catalog moved while this lookup was in flight; `row` may
            // already be stale for an alias
            tracing::debug!(label, origin = %row.origin_label, "resolved DEK across an invalidation, not caching");
            return Ok(key);
        }
        cache.entries.insert(
            row.origin_label.clone(),
            CachedDek { key: key.clone(), cached_at: now, ttl: self.dek_ttl },
        );
        if row.origin_label != label {
            cache.entries.insert(
                label.to_string(),
                CachedDek { key: key.clone(), cached_at: now, ttl: self.alias_ttl },
            );
        }
        tracing::debug!(label, origin = %row.origin_label, "resolved DEK");
        Ok(key)
    }

    /// Insert a pre-wrapped row
    pub async fn insert(&self, key: &EncryptionKey) -> Result<()> {
        label::validate(&key.label)?;
        label::validate(&key.origin_label)?;
        self.catalog.insert_key(key).await
    }

    /// Generate a fresh DEK, wrap it under the current KEK and insert it
    pub async fn create_key(&self, label: &str, origin_label: &str) -> Result<EncryptionKey> {
        let dek = SecureKey::generate();
        let id = Uuid::new_v4();
        let wrapped = self.keks().wrap(&id, &dek).await?;

        let row = EncryptionKey {
            id,
            label: label.to_string(),
            origin_label: origin_label.to_string(),
            wrapped,
            created_at: self.clock.now(),
            retired_at: None,
        };
        self.insert(&row).await?;
        tracing::info!(label, origin = origin_label, key_id = %id, "created DEK");
        Ok(row)
    }

    /// Mark a key retired; returns its new `retired::<ts>` label
    pub async fn retire(&self, label: &str, at: DateTime<Utc>) -> Result<String> {
        let row = self
            .catalog
            .find_by_label(label)
            .await?
            .ok_or_else(|| EnvelopeError::UnknownLabel(label.to_string()))?;
        let retired = label::retired_label(at);
        self.catalog.retire_key(&row.id, &retired, at).await?;
        self.invalidate_all();
        tracing::info!(label, retired = %retired, "retired DEK");
        Ok(retired)
    }

    /// Retire the active row and relabel the rotating row `active` in one step
    pub async fn promote_rotating(
        &self,
        active: &EncryptionKey,
        rotating: &EncryptionKey,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let retired = label::retired_label(at);
        self.catalog.promote_rotating(&active.id, &rotating.id, &retired, at).await?;
        self.invalidate_all();
        Ok(retired)
    }

    /// Re-wrap every DEK under `new_kek` without changing the DEKs
    ///
    /// Each row is swapped only if its wrapping is unchanged since it was
    /// read. Rows the new provider can already unwrap are left alone, so an
    /// interrupted rewrap can simply be run again. Afterwards this process
    /// wraps with `new_kek` and still unwraps with its previous providers.
    pub async fn rewrap_all(&self, new_kek: Arc<dyn KekProvider>) -> Result<RewrapReport> {
        let current = self.keks();
        let rows = self.catalog.list_keys().await?;
        let mut report = RewrapReport { rewrapped: 0, already_current: 0, provider: new_kek.describe() };

        for row in rows {
            if new_kek.handles(&row.wrapped) {
                match new_kek.unwrap(&row.id, &row.wrapped).await {
                    Ok(_) => {
                        report.already_current += 1;
                        continue;
                    }
                    Err(EnvelopeError::UnwrapAuthFailure(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            let dek = current.unwrap(&row.id, &row.wrapped).await?;
            let rewrapped = new_kek.wrap(&row.id, &dek).await?;
            if new_kek.unwrap(&row.id, &rewrapped).await? != dek {
                return Err(EnvelopeError::Crypto(format!("re-wrapped key {} did not round-trip", row.label)));
            }

            if !self.catalog.swap_wrapping(&row.id, &row.wrapped, &rewrapped).await? {
                return Err(EnvelopeError::CatalogBusy(format!(
                    "key {} changed during rewrap; run again",
                    row.label
                )));
            }
            report.rewrapped += 1;
            tracing::info!(label = %row.label, provider = %report.provider, "re-wrapped DEK");
        }

        *self.keks.write() = current.rotated(new_kek);
        self.invalidate_all();
        Ok(report)
    }

    pub fn invalidate(&self, label: &str) {
        let mut cache = self.cache.write();
        cache.entries.remove(label);
        cache.generation += 1;
    }

    pub fn invalidate_all(&self) {
        let mut cache = self.cache.write();
        cache.entries.clear();
        cache.generation += 1;
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().entries.len()
    }

    async fn unwrap_row(&self, row: &EncryptionKey) -> Result<SecureKey> {
        self.keks().unwrap(&row.id, &row.wrapped).await
    }
}
