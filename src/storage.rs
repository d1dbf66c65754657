//! Storage abstraction for the key catalog and protected business rows
//!
//! The relational store is an external collaborator. This module defines
//! the read/write/lock primitives the engine needs from it and an
//! in-memory implementation for development and tests. The PostgreSQL
//! implementation lives in `postgres_storage`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EnvelopeError, Result};
use crate::field_cipher::EncryptedField;
use crate::kek::WrappedKey;
use crate::label::{self, ACTIVE_LABEL};

/// A DEK row in the key catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub id: Uuid,
    /// Lifecycle label: `active`, `rotating::<ts>` or `retired::<ts>`
    pub label: String,
    /// Immutable label the key was created under; stamped into ciphertext
    pub origin_label: String,
    pub wrapped: WrappedKey,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl EncryptionKey {
    pub fn is_active(&self) -> bool {
        self.label == ACTIVE_LABEL && self.retired_at.is_none()
    }

    pub fn is_rotating(&self) -> bool {
        label::is_rotating(&self.label) && self.retired_at.is_none()
    }

    /// Whether `label` names this key, either currently or by origin
    pub fn answers_to(&self, label: &str) -> bool {
        self.label == label || self.origin_label == label
    }
}

/// Key catalog and settings primitives
#[async_trait]
pub trait KeyCatalog: Send + Sync {
    /// The unretired row labelled `active`
    async fn active_key(&self) -> Result<Option<EncryptionKey>>;

    /// Unretired rows labelled `rotating::*`
    async fn rotating_keys(&self) -> Result<Vec<EncryptionKey>>;

    /// Row whose current label equals `label`, else whose origin label does
    async fn find_by_label(&self, label: &str) -> Result<Option<EncryptionKey>>;

    async fn list_keys(&self) -> Result<Vec<EncryptionKey>>;

    /// Insert a new row; `DuplicateLabel` if either label is taken and
    /// `RotationInProgressConflict` for a second rotating row
    async fn insert_key(&self, key: &EncryptionKey) -> Result<()>;

    /// Relabel to `retired_label` and set `retired_at`
    async fn retire_key(&self, id: &Uuid, retired_label: &str, at: DateTime<Utc>) -> Result<()>;

    /// Atomically retire the active row and promote the rotating row to `active`
    async fn promote_rotating(
        &self,
        active_id: &Uuid,
        rotating_id: &Uuid,
        retired_label: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace a row's wrapping if it still equals `expected`; returns
    /// whether the swap happened
    async fn swap_wrapping(&self, id: &Uuid, expected: &WrappedKey, replacement: &WrappedKey) -> Result<bool>;

    async fn load_write_label(&self) -> Result<Option<String>>;

    async fn store_write_label(&self, label: &str, at: DateTime<Utc>) -> Result<()>;

    /// Take or renew the named lease; returns false while another holder's
    /// lease is unexpired
    async fn try_acquire_lease(&self, name: &str, holder: &str, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// A protected text column: `table.key_column.column`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectedColumn {
    pub table: String,
    pub key_column: String,
    pub column: String,
}

impl ProtectedColumn {
    pub fn new(table: &str, key_column: &str, column: &str) -> Result<Self> {
        for part in [table, key_column, column] {
            let valid = !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(EnvelopeError::Config(format!("invalid SQL identifier: {:?}", part)));
            }
        }
        Ok(Self { table: table.into(), key_column: key_column.into(), column: column.into() })
    }

    /// Parse `table.key_column.column`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.trim().split('.').collect();
        match parts.as_slice() {
            [table, key, column] => Self::new(table, key, column),
            _ => Err(EnvelopeError::Config(format!(
                "protected column must be table.key_column.column, got {:?}",
                spec
            ))),
        }
    }

    /// Default finance columns: transaction descriptions, raw merchant strings, notes
    pub fn defaults() -> Vec<Self> {
        ["description", "raw_merchant", "notes"]
            .iter()
            .map(|column| Self {
                table: "transactions".into(),
                key_column: "id".into(),
                column: (*column).into(),
            })
            .collect()
    }
}

impl std::fmt::Display for ProtectedColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Re-encrypts one stored value. `Ok(None)` means the value no longer needs
/// migrating and is left untouched.
pub type Reencrypt<'a> = dyn Fn(&str) -> Result<Option<String>> + Send + Sync + 'a;

/// Result of one migration batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub migrated: u64,
    pub skipped: u64,
}

/// Business rows holding encrypted fields
#[async_trait]
pub trait ProtectedStore: Send + Sync {
    /// Claim up to `limit` fields labelled `from_label` that no concurrent
    /// caller holds, rewrite them through `reencrypt`, and commit the batch
    /// atomically. Any error aborts the batch without writing.
    async fn migrate_batch(&self, from_label: &str, limit: usize, reencrypt: &Reencrypt<'_>) -> Result<BatchOutcome>;

    /// Number of fields, across all protected columns, labelled `label`
    async fn count_labelled(&self, label: &str) -> Result<u64>;
}

/// In-memory implementation of KeyCatalog
///
/// Suitable for development, testing, and single-instance deployments.
/// Data is lost when the process terminates.
#[derive(Default)]
pub struct InMemoryCatalog {
    keys: RwLock<HashMap<Uuid, EncryptionKey>>,
    write_label: RwLock<Option<String>>,
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyCatalog for InMemoryCatalog {
    async fn active_key(&self) -> Result<Option<EncryptionKey>> {
        let keys = self.keys.read();
        Ok(keys.values().find(|k| k.is_active()).cloned())
    }

    async fn rotating_keys(&self) -> Result<Vec<EncryptionKey>> {
        let keys = self.keys.read();
        Ok(keys.values().filter(|k| k.is_rotating()).cloned().collect())
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<EncryptionKey>> {
        let keys = self.keys.read();
        let by_label = keys.values().find(|k| k.label == label);
        let found = by_label.or_else(|| keys.values().find(|k| k.origin_label == label));
        Ok(found.cloned())
    }

    async fn list_keys(&self) -> Result<Vec<EncryptionKey>> {
        let keys = self.keys.read();
        let mut all: Vec<_> = keys.values().cloned().collect();
        all.sort_by_key(|k| k.created_at);
        Ok(all)
    }

    async fn insert_key(&self, key: &EncryptionKey) -> Result<()> {
        let mut keys = self.keys.write();
        for existing in keys.values() {
            if existing.answers_to(&key.label) || existing.answers_to(&key.origin_label) || existing.id == key.id {
                return Err(EnvelopeError::DuplicateLabel(key.label.clone()));
            }
        }
        if key.is_rotating() && keys.values().any(|k| k.is_rotating()) {
            return Err(EnvelopeError::RotationInProgressConflict(format!(
                "a rotating key already exists; cannot insert {}",
                key.label
            )));
        }
        keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn retire_key(&self, id: &Uuid, retired_label: &str, at: DateTime<Utc>) -> Result<()> {
        let mut keys = self.keys.write();
        if keys.values().any(|k| k.id != *id && k.answers_to(retired_label)) {
            return Err(EnvelopeError::DuplicateLabel(retired_label.to_string()));
        }
        let key = keys.get_mut(id).ok_or_else(|| EnvelopeError::UnknownLabel(id.to_string()))?;
        key.label = retired_label.to_string();
        key.retired_at = Some(at);
        Ok(())
    }

    async fn promote_rotating(
        &self,
        active_id: &Uuid,
        rotating_id: &Uuid,
        retired_label: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut keys = self.keys.write();
        let valid = keys.get(active_id).map(|k| k.is_active()).unwrap_or(false)
            && keys.get(rotating_id).map(|k| k.is_rotating()).unwrap_or(false);
        if !valid {
            return Err(EnvelopeError::RotationInProgressConflict(
                "catalog changed underneath finalize".into(),
            ));
        }
        if keys.values().any(|k| k.answers_to(retired_label)) {
            return Err(EnvelopeError::DuplicateLabel(retired_label.to_string()));
        }

        if let Some(old) = keys.get_mut(active_id) {
            old.label = retired_label.to_string();
            old.retired_at = Some(at);
        }
        if let Some(new) = keys.get_mut(rotating_id) {
            new.label = ACTIVE_LABEL.to_string();
        }
        Ok(())
    }

    async fn swap_wrapping(&self, id: &Uuid, expected: &WrappedKey, replacement: &WrappedKey) -> Result<bool> {
        let mut keys = self.keys.write();
        let key = keys.get_mut(id).ok_or_else(|| EnvelopeError::UnknownLabel(id.to_string()))?;
        if key.wrapped != *expected {
            return Ok(false);
        }
        key.wrapped = replacement.clone();
        Ok(true)
    }

    async fn load_write_label(&self) -> Result<Option<String>> {
        Ok(self.write_label.read().clone())
    }

    async fn store_write_label(&self, label: &str, _at: DateTime<Utc>) -> Result<()> {
        *self.write_label.write() = Some(label.to_string());
        Ok(())
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(name) {
            Some((current, expires)) if current != holder && *expires > now => Ok(false),
            _ => {
                leases.insert(name.to_string(), (holder.to_string(), until));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(name).map(|(h, _)| h == holder).unwrap_or(false) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Address of one protected value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldLocator {
    pub column: ProtectedColumn,
    pub row_key: String,
}

/// In-memory implementation of ProtectedStore
#[derive(Default)]
pub struct InMemoryProtectedStore {
    values: RwLock<HashMap<FieldLocator, String>>,
    claimed: Mutex<HashSet<FieldLocator>>,
}

impl InMemoryProtectedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, column: &ProtectedColumn, row_key: &str, value: String) {
        let locator = FieldLocator { column: column.clone(), row_key: row_key.to_string() };
        self.values.write().insert(locator, value);
    }

    pub fn get(&self, column: &ProtectedColumn, row_key: &str) -> Option<String> {
        let locator = FieldLocator { column: column.clone(), row_key: row_key.to_string() };
        self.values.read().get(&locator).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    fn claim(&self, from_label: &str, limit: usize) -> Vec<(FieldLocator, String)> {
        let values = self.values.read();
        let mut claimed = self.claimed.lock();
        let mut batch = Vec::new();
        for (locator, value) in values.iter() {
            if batch.len() >= limit {
                break;
            }
            if claimed.contains(locator) || EncryptedField::peek_label(value) != Some(from_label) {
                continue;
            }
            claimed.insert(locator.clone());
            batch.push((locator.clone(), value.clone()));
        }
        batch
    }

    pub fn claimed_len(&self) -> usize {
        self.claimed.lock().len()
    }

    fn release(&self, batch: &[(FieldLocator, String)]) {
        let mut claimed = self.claimed.lock();
        for (locator, _) in batch {
            claimed.remove(locator);
        }
    }
}

#[async_trait]
impl ProtectedStore for InMemoryProtectedStore {
    async fn migrate_batch(&self, from_label: &str, limit: usize, reencrypt: &Reencrypt<'_>) -> Result<BatchOutcome> {
        let batch = self.claim(from_label, limit);
        // Other workers run between claim and commit, as they would against
        // a database round trip
        tokio::task::yield_now().await;

        let mut rewritten = Vec::with_capacity(batch.len());
        let mut outcome = BatchOutcome::default();
        for (locator, value) in &batch {
            match reencrypt(value) {
                Ok(Some(next)) => rewritten.push((locator.clone(), value.clone(), next)),
                Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    self.release(&batch);
                    return Err(e);
                }
            }
        }

        {
            let mut values = self.values.write();
            for (locator, previous, next) in rewritten {
                // Conditional write: a value changed by the application since
                // the claim already carries a current label
                match values.get_mut(&locator) {
                    Some(current) if *current == previous => {
                        *current = next;
                        outcome.migrated += 1;
                    }
                    _ => outcome.skipped += 1,
                }
            }
        }

        self.release(&batch);
        Ok(outcome)
    }

    async fn count_labelled(&self, label: &str) -> Result<u64> {
        let values = self.values.read();
        Ok(values.values().filter(|v| EncryptedField::peek_label(v) == Some(label)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kek::WrapAlgorithm;
    use chrono::Duration;

    fn key(label: &str, origin: &str) -> EncryptionKey {
        EncryptionKey {
            id: Uuid::new_v4(),
            label: label.into(),
            origin_label: origin.into(),
            wrapped: WrappedKey {
                wrapped_dek: vec![1, 2, 3],
                wrap_algorithm: WrapAlgorithm::Local,
                wrap_nonce: Some(vec![0; 12]),
                kek_reference: None,
            },
            created_at: Utc::now(),
            retired_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let catalog = InMemoryCatalog::new();
        let active = key("active", "active::1");
        catalog.insert_key(&active).await.unwrap();

        assert_eq!(catalog.active_key().await.unwrap().unwrap().id, active.id);
        assert_eq!(catalog.find_by_label("active").await.unwrap().unwrap().id, active.id);
        assert_eq!(catalog.find_by_label("active::1").await.unwrap().unwrap().id, active.id);
        assert!(catalog.find_by_label("rotating::9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_labels_rejected() {
        let catalog = InMemoryCatalog::new();
        catalog.insert_key(&key("active", "active::1")).await.unwrap();

        let dup = catalog.insert_key(&key("active", "active::2")).await;
        assert!(matches!(dup, Err(EnvelopeError::DuplicateLabel(_))));

        let dup_origin = catalog.insert_key(&key("rotating::1", "active::1")).await;
        assert!(matches!(dup_origin, Err(EnvelopeError::DuplicateLabel(_))));
    }

    #[tokio::test]
    async fn test_single_rotating_row() {
        let catalog = InMemoryCatalog::new();
        catalog.insert_key(&key("rotating::1", "rotating::1")).await.unwrap();
        let second = catalog.insert_key(&key("rotating::2", "rotating::2")).await;
        assert!(matches!(second, Err(EnvelopeError::RotationInProgressConflict(_))));
    }

    #[tokio::test]
    async fn test_promote_rotating_keeps_rows() {
        let catalog = InMemoryCatalog::new();
        let active = key("active", "active::1");
        let rotating = key("rotating::2", "rotating::2");
        catalog.insert_key(&active).await.unwrap();
        catalog.insert_key(&rotating).await.unwrap();

        let at = Utc::now();
        catalog.promote_rotating(&active.id, &rotating.id, "retired::3", at).await.unwrap();

        let keys = catalog.list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        let old = catalog.find_by_label("retired::3").await.unwrap().unwrap();
        assert_eq!(old.id, active.id);
        assert_eq!(old.retired_at, Some(at));
        let new = catalog.active_key().await.unwrap().unwrap();
        assert_eq!(new.id, rotating.id);
        assert_eq!(catalog.find_by_label("rotating::2").await.unwrap().unwrap().id, rotating.id);
        assert!(catalog.rotating_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_swap_wrapping_is_conditional() {
        let catalog = InMemoryCatalog::new();
        let row = key("active", "active::1");
        catalog.insert_key(&row).await.unwrap();

        let mut replacement = row.wrapped.clone();
        replacement.wrapped_dek = vec![9, 9];
        assert!(catalog.swap_wrapping(&row.id, &row.wrapped, &replacement).await.unwrap());
        assert!(!catalog.swap_wrapping(&row.id, &row.wrapped, &replacement).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_exclusion_and_expiry() {
        let catalog = InMemoryCatalog::new();
        let now = Utc::now();
        let until = now + Duration::seconds(30);

        assert!(catalog.try_acquire_lease("key-catalog", "a", now, until).await.unwrap());
        assert!(!catalog.try_acquire_lease("key-catalog", "b", now, until).await.unwrap());
        assert!(catalog
            .try_acquire_lease("key-catalog", "b", until + Duration::seconds(1), until + Duration::seconds(60))
            .await
            .unwrap());

        catalog.release_lease("key-catalog", "a").await.unwrap();
        assert!(!catalog.try_acquire_lease("key-catalog", "a", now, until).await.unwrap());
        catalog.release_lease("key-catalog", "b").await.unwrap();
        assert!(catalog.try_acquire_lease("key-catalog", "a", now, until).await.unwrap());
    }

    fn relabel(value: &str, to: &str) -> Result<Option<String>> {
        match value.strip_prefix("enc1$old$") {
            Some(rest) => Ok(Some(format!("enc1${}${}", to, rest))),
            None => Ok(None),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing_and_releases_claims() {
        let store = InMemoryProtectedStore::new();
        let column = ProtectedColumn::defaults().remove(0);
        for i in 0..6 {
            store.put(&column, &format!("tx-{}", i), format!("enc1$old$n$c{}$t", i));
        }
        store.put(&column, "tx-4", "enc1$old$n$corrupt$t".into());
        let snapshot = |store: &InMemoryProtectedStore| -> Vec<Option<String>> {
            (0..6).map(|i| store.get(&column, &format!("tx-{}", i))).collect()
        };
        let before = snapshot(&store);

        let failing = |value: &str| {
            if value.contains("corrupt") {
                Err(EnvelopeError::InvalidCiphertext("authentication failed".into()))
            } else {
                relabel(value, "new")
            }
        };
        let result = store.migrate_batch("old", 10, &failing).await;
        assert!(matches!(result, Err(EnvelopeError::InvalidCiphertext(_))));
        assert_eq!(snapshot(&store), before);
        assert_eq!(store.claimed_len(), 0);

        // Once the bad value is repaired every row is claimable again
        store.put(&column, "tx-4", "enc1$old$n$c4$t".into());
        let outcome = store.migrate_batch("old", 10, &|v: &str| relabel(v, "new")).await.unwrap();
        assert_eq!(outcome.migrated, 6);
        assert_eq!(store.count_labelled("old").await.unwrap(), 0);
        assert_eq!(store.count_labelled("new").await.unwrap(), 6);
        assert_eq!(store.claimed_len(), 0);
    }

    #[test]
    fn test_protected_column_parse() {
        let column = ProtectedColumn::parse("transactions.id.description").unwrap();
        assert_eq!(column.table, "transactions");
        assert_eq!(column.to_string(), "transactions.description");
        assert!(ProtectedColumn::parse("transactions.description").is_err());
        assert!(ProtectedColumn::parse("tx;drop.id.notes").is_err());
        assert_eq!(ProtectedColumn::defaults().len(), 3);
    }
}
