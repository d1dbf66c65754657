use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EnvelopeError, Result};
use crate::kek::{WrapAlgorithm, WrappedKey};
use crate::storage::{BatchOutcome, EncryptionKey, KeyCatalog, ProtectedColumn, ProtectedStore, Reencrypt};

const SCHEMA: &str = include_str!("../migrations/001_encryption_keys.sql");

const UNIQUE_VIOLATION: &str = "23505";
const SINGLE_ROTATING_INDEX: &str = "encryption_keys_single_rotating";

const KEY_COLUMNS: &str =
    "id, label, origin_label, wrapped_dek, wrap_algorithm, wrap_nonce, kek_reference, created_at, retired_at";

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to connect to PostgreSQL: {}", e)))
}

/// Create the key catalog tables if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to apply encryption schema: {}", e)))?;
    Ok(())
}

fn key_from_row(r: &PgRow) -> Result<EncryptionKey> {
    let algorithm: String = r.try_get("wrap_algorithm")?;
    Ok(EncryptionKey {
        id: r.try_get("id")?,
        label: r.try_get("label")?,
        origin_label: r.try_get("origin_label")?,
        wrapped: WrappedKey {
            wrapped_dek: r.try_get("wrapped_dek")?,
            wrap_algorithm: WrapAlgorithm::parse(&algorithm)?,
            wrap_nonce: r.try_get("wrap_nonce")?,
            kek_reference: r.try_get("kek_reference")?,
        },
        created_at: r.try_get("created_at")?,
        retired_at: r.try_get("retired_at")?,
    })
}

/// Map unique violations on the key table to catalog errors
fn insert_error(err: sqlx::Error, label: &str) -> EnvelopeError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            if db.constraint() == Some(SINGLE_ROTATING_INDEX) {
                return EnvelopeError::RotationInProgressConflict(format!(
                    "a rotating key already exists; cannot insert {}",
                    label
                ));
            }
            return EnvelopeError::DuplicateLabel(label.to_string());
        }
    }
    EnvelopeError::Storage(format!("Failed to write key {}: {}", label, err))
}

/// PostgreSQL key catalog over `encryption_keys`, `encryption_settings`
/// and `encryption_locks`
///
/// - No plaintext DEKs stored; only wrapped material
/// - Rows are relabelled and retired, never deleted
/// - A partial unique index allows a single live rotating row
pub struct PgKeyCatalog {
    pool: PgPool,
}

impl PgKeyCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl KeyCatalog for PgKeyCatalog {
    async fn active_key(&self) -> Result<Option<EncryptionKey>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM encryption_keys WHERE label = 'active' AND retired_at IS NULL",
            KEY_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to get active key: {}", e)))?;

        row.as_ref().map(key_from_row).transpose()
    }

    async fn rotating_keys(&self) -> Result<Vec<EncryptionKey>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM encryption_keys WHERE label LIKE 'rotating::%' AND retired_at IS NULL ORDER BY created_at",
            KEY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to get rotating keys: {}", e)))?;

        rows.iter().map(key_from_row).collect()
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<EncryptionKey>> {
        // Current label wins over origin label
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM encryption_keys
            WHERE label = $1 OR origin_label = $1
            ORDER BY (label = $1) DESC
            LIMIT 1
            "#,
            KEY_COLUMNS
        ))
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to find key {}: {}", label, e)))?;

        row.as_ref().map(key_from_row).transpose()
    }

    async fn list_keys(&self) -> Result<Vec<EncryptionKey>> {
        let rows = sqlx::query(&format!("SELECT {} FROM encryption_keys ORDER BY created_at", KEY_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EnvelopeError::Storage(format!("Failed to list keys: {}", e)))?;

        rows.iter().map(key_from_row).collect()
    }

    async fn insert_key(&self, key: &EncryptionKey) -> Result<()> {
        // Labels must be unique across both label columns, which the
        // per-column unique constraints alone do not cover
        let result = sqlx::query(
            r#"
            INSERT INTO encryption_keys
                (id, label, origin_label, wrapped_dek, wrap_algorithm, wrap_nonce, kek_reference, created_at, retired_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9
            WHERE NOT EXISTS (
                SELECT 1 FROM encryption_keys
                WHERE label IN ($2, $3) OR origin_label IN ($2, $3)
            )
            "#,
        )
        .bind(key.id)
        .bind(&key.label)
        .bind(&key.origin_label)
        .bind(&key.wrapped.wrapped_dek)
        .bind(key.wrapped.wrap_algorithm.as_str())
        .bind(&key.wrapped.wrap_nonce)
        .bind(&key.wrapped.kek_reference)
        .bind(key.created_at)
        .bind(key.retired_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, &key.label))?;

        if result.rows_affected() == 0 {
            return Err(EnvelopeError::DuplicateLabel(key.label.clone()));
        }
        Ok(())
    }

    async fn retire_key(&self, id: &Uuid, retired_label: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE encryption_keys SET label = $2, retired_at = $3 WHERE id = $1")
            .bind(id)
            .bind(retired_label)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, retired_label))?;

        if result.rows_affected() == 0 {
            return Err(EnvelopeError::UnknownLabel(id.to_string()));
        }
        Ok(())
    }

    async fn promote_rotating(
        &self,
        active_id: &Uuid,
        rotating_id: &Uuid,
        retired_label: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let retired = sqlx::query(
            r#"
            UPDATE encryption_keys SET label = $2, retired_at = $3
            WHERE id = $1 AND label = 'active' AND retired_at IS NULL
            "#,
        )
        .bind(active_id)
        .bind(retired_label)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error(e, retired_label))?;

        let promoted = sqlx::query(
            r#"
            UPDATE encryption_keys SET label = 'active'
            WHERE id = $1 AND label LIKE 'rotating::%' AND retired_at IS NULL
            "#,
        )
        .bind(rotating_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to promote rotating key: {}", e)))?;

        if retired.rows_affected() != 1 || promoted.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(EnvelopeError::RotationInProgressConflict(
                "catalog changed underneath finalize".into(),
            ));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn swap_wrapping(&self, id: &Uuid, expected: &WrappedKey, replacement: &WrappedKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE encryption_keys
            SET wrapped_dek = $2, wrap_algorithm = $3, wrap_nonce = $4, kek_reference = $5
            WHERE id = $1
              AND wrapped_dek = $6
              AND wrap_algorithm = $7
              AND wrap_nonce IS NOT DISTINCT FROM $8
              AND kek_reference IS NOT DISTINCT FROM $9
            "#,
        )
        .bind(id)
        .bind(&replacement.wrapped_dek)
        .bind(replacement.wrap_algorithm.as_str())
        .bind(&replacement.wrap_nonce)
        .bind(&replacement.kek_reference)
        .bind(&expected.wrapped_dek)
        .bind(expected.wrap_algorithm.as_str())
        .bind(&expected.wrap_nonce)
        .bind(&expected.kek_reference)
        .execute(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to rewrap key {}: {}", id, e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn load_write_label(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT write_label FROM encryption_settings WHERE id")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EnvelopeError::Storage(format!("Failed to read write label: {}", e)))?;

        Ok(row.map(|r| r.try_get::<String, _>("write_label")).transpose()?)
    }

    async fn store_write_label(&self, label: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO encryption_settings (id, write_label, updated_at)
            VALUES (TRUE, $1, $2)
            ON CONFLICT (id) DO UPDATE SET write_label = EXCLUDED.write_label, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(label)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to store write label: {}", e)))?;

        Ok(())
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO encryption_locks (name, holder, expires_at)
            VALUES ($1, $2, $4)
            ON CONFLICT (name) DO UPDATE SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE encryption_locks.holder = EXCLUDED.holder OR encryption_locks.expires_at <= $3
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(until)
        .execute(&self.pool)
        .await
        .map_err(|e| EnvelopeError::Storage(format!("Failed to acquire lock {}: {}", name, e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM encryption_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| EnvelopeError::Storage(format!("Failed to release lock {}: {}", name, e)))?;

        Ok(())
    }
}

/// PostgreSQL protected columns holding `enc1$...` values
pub struct PgProtectedStore {
    pool: PgPool,
    columns: Vec<ProtectedColumn>,
}

impl PgProtectedStore {
    pub fn new(pool: PgPool, columns: Vec<ProtectedColumn>) -> Self {
        Self { pool, columns }
    }

    pub fn columns(&self) -> &[ProtectedColumn] {
        &self.columns
    }

    /// Claim, rewrite and commit up to `limit` values of one column
    async fn migrate_column(
        &self,
        column: &ProtectedColumn,
        from_label: &str,
        limit: usize,
        reencrypt: &Reencrypt<'_>,
    ) -> Result<BatchOutcome> {
        let mut tx = self.pool.begin().await?;

        // Rows locked by a concurrent run are skipped, not waited on
        let rows = sqlx::query(&claim_sql(column))
            .bind(from_label)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| EnvelopeError::Storage(format!("Failed to claim rows in {}: {}", column, e)))?;

        let update = rewrite_sql(column);

        let mut outcome = BatchOutcome::default();
        for row in &rows {
            let row_ref: String = row.try_get("row_ref")?;
            let row_key: String = row.try_get("row_key")?;
            let value: String = row.try_get("value")?;
            // An error drops `tx`, rolling the whole batch back
            let Some(next) = reencrypt(&value)? else {
                outcome.skipped += 1;
                continue;
            };
            let result = sqlx::query(&update)
                .bind(&next)
                .bind(&row_ref)
                .bind(&value)
                .execute(&mut *tx)
                .await
                .map_err(|e| EnvelopeError::Storage(format!("Failed to rewrite {} row {}: {}", column, row_key, e)))?;
            if result.rows_affected() == 0 {
                outcome.skipped += 1;
            } else {
                outcome.migrated += result.rows_affected();
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Lock up to `$2` values of `column` labelled `$1`. The physical row id is
/// returned so the rewrite can address the row without touching the key
/// column's type.
fn claim_sql(column: &ProtectedColumn) -> String {
    format!(
        r#"
        SELECT ctid::text AS row_ref, "{key}"::text AS row_key, "{col}" AS value
        FROM "{table}"
        WHERE split_part("{col}", '$', 1) = 'enc1' AND split_part("{col}", '$', 2) = $1
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
        key = column.key_column,
        col = column.column,
        table = column.table,
    )
}

/// Conditional rewrite of one claimed value. The row lock taken by
/// `claim_sql` keeps `ctid` stable until the transaction ends.
fn rewrite_sql(column: &ProtectedColumn) -> String {
    format!(
        r#"UPDATE "{table}" SET "{col}" = $1 WHERE ctid = $2::tid AND "{col}" = $3"#,
        col = column.column,
        table = column.table,
    )
}

#[async_trait]
impl ProtectedStore for PgProtectedStore {
    async fn migrate_batch(&self, from_label: &str, limit: usize, reencrypt: &Reencrypt<'_>) -> Result<BatchOutcome> {
        let mut total = BatchOutcome::default();
        for column in &self.columns {
            let budget = limit.saturating_sub((total.migrated + total.skipped) as usize);
            if budget == 0 {
                break;
            }
            let outcome = self.migrate_column(column, from_label, budget, reencrypt).await?;
            tracing::debug!(%column, migrated = outcome.migrated, skipped = outcome.skipped, "column batch committed");
            total.migrated += outcome.migrated;
            total.skipped += outcome.skipped;
        }
        Ok(total)
    }

    async fn count_labelled(&self, label: &str) -> Result<u64> {
        let mut total = 0u64;
        for column in &self.columns {
            let row = sqlx::query(&format!(
                r#"
                SELECT COUNT(*) AS count
                FROM "{table}"
                WHERE split_part("{col}", '$', 1) = 'enc1' AND split_part("{col}", '$', 2) = $1
                "#,
                col = column.column,
                table = column.table,
            ))
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EnvelopeError::Storage(format!("Failed to count rows in {}: {}", column, e)))?;

            let count: i64 = row.try_get("count")?;
            total += count.max(0) as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_catalog_tables() {
        for table in ["encryption_keys", "encryption_settings", "encryption_locks"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)));
        }
        assert!(SCHEMA.contains(SINGLE_ROTATING_INDEX));
    }

    #[test]
    fn test_rewrite_addresses_claimed_row_by_ctid() {
        let column = ProtectedColumn::parse("transactions.id.raw_merchant").unwrap();
        let claim = claim_sql(&column);
        assert!(claim.contains("ctid::text AS row_ref"));
        assert!(claim.contains("FOR UPDATE SKIP LOCKED"));

        let rewrite = rewrite_sql(&column);
        assert!(rewrite.contains("ctid = $2::tid"));
        assert!(rewrite.contains(r#""raw_merchant" = $3"#));
        assert!(!rewrite.contains(r#""id""#));
    }

    #[test]
    fn test_non_database_errors_are_storage() {
        let err = insert_error(sqlx::Error::RowNotFound, "rotating::1");
        assert!(matches!(err, EnvelopeError::Storage(_)));
    }
}
