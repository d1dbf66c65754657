//! DEK rotation and KEK rewrap workflows
//!
//! Rotation state lives in the catalog: a `rotating::*` row means a
//! rotation is in flight. Operator mutations (init, begin, finalize, rewrap)
//! hold the `key-catalog` lease; `rotate_run` relies on the protected store's
//! claim-and-skip and can run from several workers at once.

use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EnvelopeError, Result};
use crate::field_cipher::FieldCipher;
use crate::kek::KekProvider;
use crate::key_store::{KeyStore, RewrapReport};
use crate::label::{self, ACTIVE_LABEL};
use crate::storage::{BatchOutcome, EncryptionKey, ProtectedStore};
use crate::write_label::WriteLabelRegistry;

/// Lease guarding operator mutations of the key catalog
pub const CATALOG_LOCK: &str = "key-catalog";

const LEASE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RotationState {
    Idle,
    Rotating { label: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationProgress {
    pub label: String,
    pub migrated: u64,
    pub skipped: u64,
    pub remaining: u64,
}

impl fmt::Display for RotationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migrated={} skipped={} remaining={}", self.migrated, self.skipped, self.remaining)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    /// Origin label of the newly active key
    pub active_label: String,
    pub retired_label: String,
}

pub struct RotationOrchestrator {
    keys: Arc<KeyStore>,
    write_labels: Arc<WriteLabelRegistry>,
    protected: Arc<dyn ProtectedStore>,
    holder: String,
}

impl RotationOrchestrator {
    pub fn new(keys: Arc<KeyStore>, write_labels: Arc<WriteLabelRegistry>, protected: Arc<dyn ProtectedStore>) -> Self {
        let holder = format!("pid-{}-{}", std::process::id(), Uuid::new_v4());
        Self { keys, write_labels, protected, holder }
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.keys.clock()
    }

    /// Current state derived from the catalog
    pub async fn state(&self) -> Result<RotationState> {
        Ok(match self.rotating_key().await? {
            Some(row) => RotationState::Rotating { label: row.label },
            None => RotationState::Idle,
        })
    }

    /// Create the first active key and seed the write label
    pub async fn init(&self) -> Result<EncryptionKey> {
        self.acquire().await?;
        let outcome = self.init_locked().await;
        self.release(outcome).await
    }

    async fn init_locked(&self) -> Result<EncryptionKey> {
        if let Some(active) = self.keys.catalog().active_key().await? {
            return Err(EnvelopeError::AlreadyInitialized(active.origin_label));
        }
        let origin = label::initial_origin_label(self.clock().now());
        let row = self.keys.create_key(ACTIVE_LABEL, &origin).await?;
        self.write_labels.set_write_label(ACTIVE_LABEL).await?;
        self.keys.invalidate_all();
        tracing::info!(origin = %origin, keks = %self.keys.keks().describe(), "crypto initialized");
        Ok(row)
    }

    /// Start a rotation: new DEK under `rotating::<now>`, write label flipped
    pub async fn rotate_begin(&self) -> Result<String> {
        self.acquire().await?;
        let outcome = self.rotate_begin_locked().await;
        self.release(outcome).await
    }

    async fn rotate_begin_locked(&self) -> Result<String> {
        if let Some(existing) = self.rotating_key().await? {
            return Err(EnvelopeError::RotationInProgressConflict(format!(
                "rotation to {} already in progress",
                existing.label
            )));
        }
        // The old key must stay readable for the whole run phase
        let active = self.keys.load_active_uncached().await?;

        let new_label = label::rotating_label(self.clock().now());
        self.keys.create_key(&new_label, &new_label).await?;
        self.write_labels.set_write_label(&new_label).await?;
        self.keys.invalidate_all();
        tracing::info!(from = %active.label, to = %new_label, "rotation started");
        Ok(new_label)
    }

    /// Migrate one batch of fields to `new_label`
    ///
    /// Fields under the active key are moved first. Fields still carrying a
    /// retired key's label, written by a process that had not yet seen an
    /// earlier finalize, are swept in the same pass.
    pub async fn rotate_run(&self, new_label: &str, batch_size: usize) -> Result<RotationProgress> {
        if batch_size == 0 {
            return Err(EnvelopeError::Config("batch size must be positive".into()));
        }
        let target = self.expect_rotating(new_label).await?;
        let sources = self.source_keys(&target).await?;
        let to = self.keys.resolve_key(&target.origin_label).await?;

        let mut outcome = BatchOutcome::default();
        let mut remaining = 0;
        for source in &sources {
            let budget = batch_size.saturating_sub((outcome.migrated + outcome.skipped) as usize);
            let mut left = self.protected.count_labelled(&source.origin_label).await?;
            if budget > 0 && left > 0 {
                let from = self.keys.resolve_key(&source.origin_label).await?;
                let reencrypt = |value: &str| FieldCipher::reencrypt(value, &from, &to);
                let batch = self.protected.migrate_batch(&from.label, budget, &reencrypt).await?;
                outcome.migrated += batch.migrated;
                outcome.skipped += batch.skipped;
                left = self.protected.count_labelled(&from.label).await?;
                tracing::debug!(from = %from.label, migrated = batch.migrated, left, "source batch committed");
            }
            remaining += left;
        }

        tracing::info!(
            to = %to.label,
            sources = sources.len(),
            migrated = outcome.migrated,
            skipped = outcome.skipped,
            remaining,
            "rotation batch committed"
        );
        Ok(RotationProgress {
            label: target.label,
            migrated: outcome.migrated,
            skipped: outcome.skipped,
            remaining,
        })
    }

    /// Run batches until nothing remains or a batch makes no progress
    ///
    /// A batch with no progress and rows remaining means other workers hold
    /// them; the caller can simply run again.
    pub async fn rotate_run_until_done(&self, new_label: &str, batch_size: usize) -> Result<RotationProgress> {
        let mut total = RotationProgress { label: new_label.to_string(), migrated: 0, skipped: 0, remaining: 0 };
        loop {
            let batch = self.rotate_run(new_label, batch_size).await?;
            total.label = batch.label;
            total.migrated += batch.migrated;
            total.skipped += batch.skipped;
            total.remaining = batch.remaining;
            if batch.remaining == 0 || batch.migrated + batch.skipped == 0 {
                return Ok(total);
            }
        }
    }

    /// Retire the old active key and promote `new_label` to `active`
    pub async fn rotate_finalize(&self, new_label: &str) -> Result<FinalizeReport> {
        self.acquire().await?;
        let outcome = self.rotate_finalize_locked(new_label).await;
        self.release(outcome).await
    }

    async fn rotate_finalize_locked(&self, new_label: &str) -> Result<FinalizeReport> {
        let rotating = self.expect_rotating(new_label).await?;
        let sources = self.source_keys(&rotating).await?;
        let active = sources.first().cloned().ok_or(EnvelopeError::NoActiveKey)?;

        // Processes that have not yet seen the flipped write label may still
        // write under the old key
        let elapsed = self.clock().now() - rotating.created_at;
        let window = self.write_labels.ttl();
        if elapsed < window {
            let wait = window - elapsed;
            let wait_secs = wait.num_seconds() + i64::from(wait > Duration::seconds(wait.num_seconds()));
            return Err(EnvelopeError::TransitionWindowOpen { label: rotating.label, wait_secs });
        }

        let mut remaining = 0;
        for source in &sources {
            remaining += self.protected.count_labelled(&source.origin_label).await?;
        }
        if remaining > 0 {
            return Err(EnvelopeError::RotationIncomplete { label: rotating.label, remaining });
        }

        let retired_label = self.keys.promote_rotating(&active, &rotating, self.clock().now()).await?;
        self.write_labels.set_write_label(ACTIVE_LABEL).await?;
        self.keys.invalidate_all();
        tracing::info!(active = %rotating.origin_label, retired = %retired_label, "rotation finalized");
        Ok(FinalizeReport { active_label: rotating.origin_label, retired_label })
    }

    /// Re-wrap every DEK under `new_kek` and switch this process to it
    pub async fn rewrap_kek(&self, new_kek: Arc<dyn KekProvider>) -> Result<RewrapReport> {
        self.acquire().await?;
        let outcome = self.keys.rewrap_all(new_kek).await;
        let report = self.release(outcome).await?;
        tracing::info!(%report, "KEK rewrap complete");
        Ok(report)
    }

    async fn rotating_key(&self) -> Result<Option<EncryptionKey>> {
        let mut rotating = self.keys.catalog().rotating_keys().await?;
        match rotating.len() {
            0 => Ok(None),
            1 => Ok(rotating.pop()),
            n => Err(EnvelopeError::RotationInProgressConflict(format!(
                "{} rotating keys in catalog",
                n
            ))),
        }
    }

    /// The active key followed by every retired key
    async fn source_keys(&self, target: &EncryptionKey) -> Result<Vec<EncryptionKey>> {
        let keys = self.keys.catalog().list_keys().await?;
        let active = keys.iter().find(|k| k.is_active()).cloned().ok_or(EnvelopeError::NoActiveKey)?;
        let mut sources = vec![active];
        sources.extend(keys.into_iter().filter(|k| k.retired_at.is_some() && k.id != target.id));
        Ok(sources)
    }

    async fn expect_rotating(&self, new_label: &str) -> Result<EncryptionKey> {
        match self.rotating_key().await? {
            Some(row) if row.answers_to(new_label) => Ok(row),
            Some(row) => Err(EnvelopeError::RotationInProgressConflict(format!(
                "rotation in progress is {}, not {}",
                row.label, new_label
            ))),
            None => Err(EnvelopeError::RotationInProgressConflict(format!(
                "no rotation in progress for {}",
                new_label
            ))),
        }
    }

    async fn acquire(&self) -> Result<()> {
        let now = self.clock().now();
        let until = now + Duration::seconds(LEASE_TTL_SECS);
        let acquired = self
            .keys
            .catalog()
            .try_acquire_lease(CATALOG_LOCK, &self.holder, now, until)
            .await?;
        if !acquired {
            return Err(EnvelopeError::CatalogBusy(format!(
                "{} lock held by another operator",
                CATALOG_LOCK
            )));
        }
        tracing::debug!(holder = %self.holder, "acquired catalog lock");
        Ok(())
    }

    /// Release the lease, keeping the operation's own error if it failed
    async fn release<T>(&self, outcome: Result<T>) -> Result<T> {
        let released = self.keys.catalog().release_lease(CATALOG_LOCK, &self.holder).await;
        let value = outcome?;
        released?;
        Ok(value)
    }
}
