//! Settlement retry queue and reconciliation gap log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{SqliteStorage, amount_text, fmt_time, get_amount, parse_time};
use crate::domain::ReconciliationGap;
use crate::storage::{ReconciliationStore, RetryEntry, RetryStore, StorageError};

#[async_trait]
impl RetryStore for SqliteStorage {
    async fn enqueue_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_retries (awaiting_id, attempts, next_attempt_at, last_error, created_at)
            VALUES (?, 0, ?, ?, ?)
            ON CONFLICT(awaiting_id) DO UPDATE SET
                next_attempt_at = excluded.next_attempt_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(awaiting_id)
        .bind(fmt_time(&next_attempt_at))
        .bind(last_error)
        .bind(fmt_time(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT awaiting_id, attempts, next_attempt_at, last_error
            FROM settlement_retries WHERE next_attempt_at <= ?
            ORDER BY next_attempt_at ASC LIMIT ?
            "#,
        )
        .bind(fmt_time(&now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_retry_row).collect()
    }

    async fn reschedule_retry(
        &self,
        awaiting_id: &str,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u32, StorageError> {
        let row = sqlx::query(
            r#"
            UPDATE settlement_retries
            SET attempts = attempts + 1, next_attempt_at = ?, last_error = ?
            WHERE awaiting_id = ?
            RETURNING attempts
            "#,
        )
        .bind(fmt_time(&next_attempt_at))
        .bind(last_error)
        .bind(awaiting_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("retry entry {}", awaiting_id)))?;

        let attempts: i64 = row.try_get("attempts")?;
        Ok(attempts as u32)
    }

    async fn remove_retry(&self, awaiting_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM settlement_retries WHERE awaiting_id = ?")
            .bind(awaiting_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for SqliteStorage {
    async fn record_gap(&self, gap: &ReconciliationGap) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_gaps (
                id, order_id, awaiting_id, leg, amount, currency, error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&gap.id)
        .bind(&gap.order_id)
        .bind(&gap.awaiting_id)
        .bind(&gap.leg)
        .bind(amount_text(gap.amount))
        .bind(&gap.currency)
        .bind(&gap.error)
        .bind(fmt_time(&gap.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_gaps(&self) -> Result<Vec<ReconciliationGap>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, awaiting_id, leg, amount, currency, error, created_at
            FROM reconciliation_gaps ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_gap_row).collect()
    }
}

fn parse_retry_row(row: &SqliteRow) -> Result<RetryEntry, StorageError> {
    let attempts: i64 = row.try_get("attempts")?;
    let next_attempt_at: String = row.try_get("next_attempt_at")?;

    Ok(RetryEntry {
        awaiting_id: row.try_get("awaiting_id")?,
        attempts: attempts as u32,
        next_attempt_at: parse_time("next_attempt_at", &next_attempt_at)?,
        last_error: row.try_get("last_error")?,
    })
}

fn parse_gap_row(row: &SqliteRow) -> Result<ReconciliationGap, StorageError> {
    let created_at: String = row.try_get("created_at")?;

    Ok(ReconciliationGap {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        awaiting_id: row.try_get("awaiting_id")?,
        leg: row.try_get("leg")?,
        amount: get_amount(row, "amount")?,
        currency: row.try_get("currency")?,
        error: row.try_get("error")?,
        created_at: parse_time("created_at", &created_at)?,
    })
}
