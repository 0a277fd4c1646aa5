use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{
    SqliteStorage, amount_text, fmt_time, get_amount, parse_decimal, parse_enum, parse_time,
};
use crate::domain::{Awaiting, AwaitingStatus, DeliveryTarget};
use crate::storage::{AwaitingStore, StorageError};

const AWAITING_COLUMNS: &str = r#"
    id, order_id, order_type, amount, order_amount, currency, status, user_id, funding,
    payer_wallet_id, receiver_wallet_id, deposit_address, payment_reference, delivery,
    shortfall, failure_reason, reservation_released, fill_applied, created_at, updated_at
"#;

/// Inserts an awaiting on an open connection or transaction.
pub(super) async fn insert_awaiting(
    conn: &mut SqliteConnection,
    awaiting: &Awaiting,
) -> Result<(), StorageError> {
    let delivery = awaiting
        .delivery
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::InvalidData(format!("Invalid delivery: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO awaitings (
            id, order_id, order_type, amount, order_amount, currency, status, user_id,
            funding, payer_wallet_id, receiver_wallet_id, deposit_address, payment_reference,
            delivery, shortfall, failure_reason, reservation_released, fill_applied,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&awaiting.id)
    .bind(&awaiting.order_id)
    .bind(awaiting.order_type.to_string())
    .bind(amount_text(awaiting.amount))
    .bind(amount_text(awaiting.order_amount))
    .bind(&awaiting.currency)
    .bind(awaiting.status.to_string())
    .bind(&awaiting.user_id)
    .bind(awaiting.funding.to_string())
    .bind(&awaiting.payer_wallet_id)
    .bind(&awaiting.receiver_wallet_id)
    .bind(&awaiting.deposit_address)
    .bind(&awaiting.payment_reference)
    .bind(delivery)
    .bind(awaiting.shortfall.map(amount_text))
    .bind(&awaiting.failure_reason)
    .bind(awaiting.reservation_released)
    .bind(awaiting.fill_applied)
    .bind(fmt_time(&awaiting.created_at))
    .bind(fmt_time(&awaiting.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl AwaitingStore for SqliteStorage {
    async fn get_awaiting(&self, id: &str) -> Result<Option<Awaiting>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM awaitings WHERE id = ?",
            AWAITING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_awaiting_row).transpose()
    }

    async fn transition_awaiting(
        &self,
        id: &str,
        from: AwaitingStatus,
        to: AwaitingStatus,
        reason: Option<&str>,
    ) -> Result<bool, StorageError> {
        if !from.can_transition_to(to) {
            return Err(StorageError::InvalidData(format!(
                "awaiting cannot move from {} to {}",
                from, to
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE awaitings
            SET status = ?, failure_reason = COALESCE(?, failure_reason), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.to_string())
        .bind(reason)
        .bind(fmt_time(&Utc::now()))
        .bind(id)
        .bind(from.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_awaiting(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE awaitings SET status = 'PROCESSING', updated_at = ?
            WHERE id = ? AND status = 'PENDING' AND reservation_released = 0
            "#,
        )
        .bind(fmt_time(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Awaiting>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM awaitings WHERE deposit_address = ? AND status = 'PENDING' \
             ORDER BY created_at ASC LIMIT 1",
            AWAITING_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_awaiting_row).transpose()
    }

    async fn find_pending_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Awaiting>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM awaitings WHERE payment_reference = ? AND status = 'PENDING' LIMIT 1",
            AWAITING_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_awaiting_row).transpose()
    }

    async fn record_shortfall(&self, id: &str, shortfall: Decimal) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE awaitings SET shortfall = ?, updated_at = ? WHERE id = ?")
            .bind(amount_text(shortfall))
            .bind(fmt_time(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("awaiting {}", id)));
        }
        Ok(())
    }

    async fn assign_awaiting_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE awaitings SET user_id = ?, updated_at = ? WHERE id = ? AND user_id IS NULL",
        )
        .bind(user_id)
        .bind(fmt_time(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_active_awaitings(&self, order_id: &str) -> Result<i64, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM awaitings
            WHERE order_id = ? AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(order_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Awaiting>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM awaitings WHERE status = 'PENDING' AND created_at < ? \
             ORDER BY created_at ASC LIMIT ?",
            AWAITING_COLUMNS
        ))
        .bind(fmt_time(&created_before))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_awaiting_row).collect()
    }
}

/// Parses an awaiting from a database row.
fn parse_awaiting_row(row: &SqliteRow) -> Result<Awaiting, StorageError> {
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let funding: String = row.try_get("funding")?;

    let delivery: Option<String> = row.try_get("delivery")?;
    let delivery = delivery
        .map(|raw| serde_json::from_str::<DeliveryTarget>(&raw))
        .transpose()
        .map_err(|e| StorageError::InvalidData(format!("Invalid delivery: {}", e)))?;

    let shortfall: Option<String> = row.try_get("shortfall")?;
    let shortfall = shortfall
        .map(|raw| parse_decimal("shortfall", &raw))
        .transpose()?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Awaiting {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        order_type: parse_enum(&order_type)?,
        amount: get_amount(row, "amount")?,
        order_amount: get_amount(row, "order_amount")?,
        currency: row.try_get("currency")?,
        status: parse_enum(&status)?,
        user_id: row.try_get("user_id")?,
        funding: parse_enum(&funding)?,
        payer_wallet_id: row.try_get("payer_wallet_id")?,
        receiver_wallet_id: row.try_get("receiver_wallet_id")?,
        deposit_address: row.try_get("deposit_address")?,
        payment_reference: row.try_get("payment_reference")?,
        delivery,
        shortfall,
        failure_reason: row.try_get("failure_reason")?,
        reservation_released: row.try_get("reservation_released")?,
        fill_applied: row.try_get("fill_applied")?,
        created_at: parse_time("created_at", &created_at)?,
        updated_at: parse_time("updated_at", &updated_at)?,
    })
}
