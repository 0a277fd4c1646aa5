use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use super::awaitings::insert_awaiting;
use super::{
    SqliteStorage, amount_text, fmt_time, get_amount, parse_decimal, parse_enum, parse_time,
};
use crate::domain::{Awaiting, AwaitingStatus, FillRecord, Order, OrderStatus};
use crate::storage::{FillApply, FillUpdate, OrderStore, ReserveOutcome, StorageError};

const ORDER_COLUMNS: &str = r#"
    id, user_id, base_currency, quote_currency, order_type, amount, amount_processed,
    amount_reserved, amount_minimum, price, fee, percentage_processed, status, version,
    escrow_hold_id, wallet_id, proceeds_wallet_id, created_at, updated_at
"#;

/// Loads an order inside an open transaction.
async fn load_order(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Order>, StorageError> {
    let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
        .bind(id)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(parse_order_row).transpose()
}

#[async_trait]
impl OrderStore for SqliteStorage {
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, base_currency, quote_currency, order_type, amount,
                amount_processed, amount_reserved, amount_minimum, price, fee,
                percentage_processed, status, version, escrow_hold_id, wallet_id,
                proceeds_wallet_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.user_id)
        .bind(&order.base_currency)
        .bind(&order.quote_currency)
        .bind(order.order_type.to_string())
        .bind(amount_text(order.amount))
        .bind(amount_text(order.amount_processed))
        .bind(amount_text(order.amount_reserved))
        .bind(amount_text(order.amount_minimum))
        .bind(order.price.to_string())
        .bind(amount_text(order.fee))
        .bind(order.percentage_processed.to_string())
        .bind(order.status.to_string())
        .bind(order.version)
        .bind(&order.escrow_hold_id)
        .bind(&order.wallet_id)
        .bind(&order.proceeds_wallet_id)
        .bind(fmt_time(&order.created_at))
        .bind(fmt_time(&order.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(order_id = %order.id, "Order saved");
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_order_row).transpose()
    }

    async fn reserve_capacity(
        &self,
        order_id: &str,
        amount: Decimal,
        awaiting: &Awaiting,
    ) -> Result<ReserveOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        // The partial unique index on pending deposit addresses rejects a
        // second claimant of the same address.
        match insert_awaiting(&mut *tx, awaiting).await {
            Ok(()) => {}
            Err(StorageError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(ReserveOutcome::AddressBusy);
            }
            Err(StorageError::Database(sqlx::Error::Database(e)))
                if e.is_foreign_key_violation() =>
            {
                tx.rollback().await?;
                return Ok(ReserveOutcome::Unavailable);
            }
            Err(e) => return Err(e),
        }

        let Some(order) = load_order(&mut *tx, order_id).await? else {
            tx.rollback().await?;
            return Ok(ReserveOutcome::Unavailable);
        };

        let free = order.amount - order.amount_processed - order.amount_reserved;
        if order.status != OrderStatus::Open || free < amount {
            tx.rollback().await?;
            return Ok(ReserveOutcome::Unavailable);
        }

        sqlx::query("UPDATE orders SET amount_reserved = ?, updated_at = ? WHERE id = ?")
            .bind(amount_text(order.amount_reserved + amount))
            .bind(fmt_time(&Utc::now()))
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ReserveOutcome::Reserved)
    }

    async fn release_reservation(
        &self,
        awaiting_id: &str,
        from: AwaitingStatus,
        amount: Decimal,
    ) -> Result<bool, StorageError> {
        let now = fmt_time(&Utc::now());

        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query(
            r#"
            UPDATE awaitings SET reservation_released = 1, updated_at = ?
            WHERE id = ? AND status = ? AND reservation_released = 0 AND fill_applied = 0
            "#,
        )
        .bind(&now)
        .bind(awaiting_id)
        .bind(from.to_string())
        .execute(&mut *tx)
        .await?;

        if flagged.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE id = (SELECT order_id FROM awaitings WHERE id = ?)",
            ORDER_COLUMNS
        ))
        .bind(awaiting_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(order) = row.as_ref().map(parse_order_row).transpose()? {
            let reserved = (order.amount_reserved - amount).max(Decimal::ZERO);
            sqlx::query("UPDATE orders SET amount_reserved = ?, updated_at = ? WHERE id = ?")
                .bind(amount_text(reserved))
                .bind(&now)
                .bind(&order.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn apply_fill(&self, update: &FillUpdate) -> Result<FillApply, StorageError> {
        let now = fmt_time(&Utc::now());

        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query(
            r#"
            UPDATE awaitings SET fill_applied = 1, updated_at = ?
            WHERE id = ? AND fill_applied = 0 AND reservation_released = 0
            "#,
        )
        .bind(&now)
        .bind(&update.awaiting_id)
        .execute(&mut *tx)
        .await?;

        if flagged.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(FillApply::AlreadyApplied);
        }

        let order = match load_order(&mut *tx, &update.order_id).await? {
            Some(order)
                if order.version == update.expected_version
                    && order.status == OrderStatus::Open
                    && order.amount_processed + update.order_amount <= order.amount =>
            {
                order
            }
            _ => {
                tx.rollback().await?;
                return Ok(FillApply::VersionConflict);
            }
        };

        let processed = order.amount_processed + update.order_amount;
        let reserved = (order.amount_reserved - update.order_amount).max(Decimal::ZERO);

        sqlx::query(
            r#"
            UPDATE orders
            SET amount_processed = ?,
                amount_reserved = ?,
                percentage_processed = ?,
                status = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(amount_text(processed))
        .bind(amount_text(reserved))
        .bind(update.percentage_processed.to_string())
        .bind(update.status.to_string())
        .bind(&now)
        .bind(&update.order_id)
        .execute(&mut *tx)
        .await?;

        let record = &update.record;
        sqlx::query(
            r#"
            INSERT INTO fills (
                id, order_id, awaiting_id, fill_amount, order_amount, price, version, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.order_id)
        .bind(&record.awaiting_id)
        .bind(amount_text(record.fill_amount))
        .bind(amount_text(record.order_amount))
        .bind(record.price.to_string())
        .bind(record.version)
        .bind(fmt_time(&record.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            order_id = %update.order_id,
            awaiting_id = %update.awaiting_id,
            version = record.version,
            "Fill applied"
        );
        Ok(FillApply::Applied)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        expected_version: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'CANCELED', version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND status = 'OPEN' AND amount_reserved = '0'
                AND NOT EXISTS (
                    SELECT 1 FROM awaitings
                    WHERE order_id = orders.id AND status IN ('PENDING', 'PROCESSING')
                )
            "#,
        )
        .bind(fmt_time(&Utc::now()))
        .bind(order_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_fills(&self, order_id: &str) -> Result<Vec<FillRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, awaiting_id, fill_amount, order_amount, price, version, created_at
            FROM fills WHERE order_id = ? ORDER BY version ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_fill_row).collect()
    }
}

/// Parses an order from a database row.
fn parse_order_row(row: &SqliteRow) -> Result<Order, StorageError> {
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let price: String = row.try_get("price")?;
    let percentage: String = row.try_get("percentage_processed")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        base_currency: row.try_get("base_currency")?,
        quote_currency: row.try_get("quote_currency")?,
        order_type: parse_enum(&order_type)?,
        amount: get_amount(row, "amount")?,
        amount_processed: get_amount(row, "amount_processed")?,
        amount_reserved: get_amount(row, "amount_reserved")?,
        amount_minimum: get_amount(row, "amount_minimum")?,
        price: parse_decimal("price", &price)?,
        fee: get_amount(row, "fee")?,
        percentage_processed: parse_decimal("percentage_processed", &percentage)?,
        status: parse_enum::<OrderStatus>(&status)?,
        version: row.try_get("version")?,
        escrow_hold_id: row.try_get("escrow_hold_id")?,
        wallet_id: row.try_get("wallet_id")?,
        proceeds_wallet_id: row.try_get("proceeds_wallet_id")?,
        created_at: parse_time("created_at", &created_at)?,
        updated_at: parse_time("updated_at", &updated_at)?,
    })
}

fn parse_fill_row(row: &SqliteRow) -> Result<FillRecord, StorageError> {
    let price: String = row.try_get("price")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(FillRecord {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        awaiting_id: row.try_get("awaiting_id")?,
        fill_amount: get_amount(row, "fill_amount")?,
        order_amount: get_amount(row, "order_amount")?,
        price: parse_decimal("price", &price)?,
        version: row.try_get("version")?,
        created_at: parse_time("created_at", &created_at)?,
    })
}
