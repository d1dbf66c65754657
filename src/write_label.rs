//! Process-local view of the persisted write label
//!
//! New ciphertext is written under the label stored in the settings row.
//! Each process caches that value for a bounded TTL; after a flip, other
//! processes converge within one TTL. The window only affects which key new
//! writes use, never whether reads succeed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::clock::{to_chrono, Clock};
use crate::error::Result;
use crate::label::{self, ACTIVE_LABEL};
use crate::storage::KeyCatalog;

pub struct WriteLabelRegistry {
    catalog: Arc<dyn KeyCatalog>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cached: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl WriteLabelRegistry {
    pub fn new(catalog: Arc<dyn KeyCatalog>, clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        Self { catalog, clock, ttl: to_chrono(ttl), cached: RwLock::new(None) }
    }

    /// Staleness bound other processes converge within
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Label new ciphertext should use. An absent settings row reads as `active`.
    pub async fn current_write_label(&self) -> Result<String> {
        let now = self.clock.now();
        if let Some((label, fetched_at)) = self.cached.read().as_ref() {
            if now - *fetched_at < self.ttl {
                return Ok(label.clone());
            }
        }

        let label = self
            .catalog
            .load_write_label()
            .await?
            .unwrap_or_else(|| ACTIVE_LABEL.to_string());
        tracing::debug!(write_label = %label, "refreshed write label");
        *self.cached.write() = Some((label.clone(), now));
        Ok(label)
    }

    pub async fn set_write_label(&self, label: &str) -> Result<()> {
        label::validate(label)?;
        self.catalog.store_write_label(label, self.clock.now()).await?;
        self.invalidate();
        tracing::info!(write_label = label, "write label updated");
        Ok(())
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryCatalog;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn test_defaults_to_active() {
        let registry = WriteLabelRegistry::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(ManualClock::default()),
            StdDuration::from_secs(5),
        );
        assert_eq!(registry.current_write_label().await.unwrap(), "active");
    }

    #[tokio::test]
    async fn test_local_set_is_immediate() {
        let registry = WriteLabelRegistry::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(ManualClock::default()),
            StdDuration::from_secs(5),
        );
        registry.current_write_label().await.unwrap();
        registry.set_write_label("rotating::1").await.unwrap();
        assert_eq!(registry.current_write_label().await.unwrap(), "rotating::1");
    }

    #[tokio::test]
    async fn test_other_process_converges_within_ttl() {
        let catalog: Arc<dyn KeyCatalog> = Arc::new(InMemoryCatalog::new());
        let clock = Arc::new(ManualClock::default());
        let operator = WriteLabelRegistry::new(catalog.clone(), clock.clone(), StdDuration::from_secs(5));
        let app = WriteLabelRegistry::new(catalog.clone(), clock.clone(), StdDuration::from_secs(5));

        assert_eq!(app.current_write_label().await.unwrap(), "active");
        operator.set_write_label("rotating::1").await.unwrap();

        clock.advance(Duration::seconds(2));
        assert_eq!(app.current_write_label().await.unwrap(), "active");

        clock.advance(Duration::seconds(4));
        assert_eq!(app.current_write_label().await.unwrap(), "rotating::1");
    }

    #[tokio::test]
    async fn test_rejects_invalid_label() {
        let registry = WriteLabelRegistry::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(ManualClock::default()),
            StdDuration::from_secs(5),
        );
        assert!(registry.set_write_label("bad$label").await.is_err());
    }
}
