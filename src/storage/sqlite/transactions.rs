use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use super::{SqliteStorage, amount_text, fmt_time, get_amount, parse_enum, parse_time};
use crate::domain::{Transaction, TransactionStatus};
use crate::storage::{StorageError, TransactionStore};

const TRANSACTION_COLUMNS: &str = "id, reference, wallet_id, user_id, amount, currency, \
     tx_type, kind, status, awaiting_id, external_id, created_at";

#[async_trait]
impl TransactionStore for SqliteStorage {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, reference, wallet_id, user_id, amount, currency, tx_type, kind,
                status, awaiting_id, external_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(reference, wallet_id) DO NOTHING
            "#,
        )
        .bind(&tx.id)
        .bind(&tx.reference)
        .bind(&tx.wallet_id)
        .bind(&tx.user_id)
        .bind(amount_text(tx.amount))
        .bind(&tx.currency)
        .bind(tx.tx_type.to_string())
        .bind(tx.kind.to_string())
        .bind(tx.status.to_string())
        .bind(&tx.awaiting_id)
        .bind(&tx.external_id)
        .bind(fmt_time(&tx.created_at))
        .execute(&self.pool)
        .await?;

        let rows_affected = result.rows_affected();

        if rows_affected > 0 {
            debug!(
                reference = %tx.reference,
                wallet_id = %tx.wallet_id,
                tx_type = %tx.tx_type,
                amount = %tx.amount,
                "Transaction saved"
            );
        }

        Ok(rows_affected > 0)
    }

    async fn find_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
    ) -> Result<Option<Transaction>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reference = ? AND wallet_id = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(reference)
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_transaction_row).transpose()
    }

    async fn find_transactions_by_reference(
        &self,
        reference: &str,
    ) -> Result<Vec<Transaction>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reference = ? ORDER BY tx_type DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_transaction_row).collect()
    }

    async fn transition_transaction(
        &self,
        reference: &str,
        wallet_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE transactions SET status = ? WHERE reference = ? AND wallet_id = ? AND status = ?",
        )
        .bind(to.to_string())
        .bind(reference)
        .bind(wallet_id)
        .bind(from.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_pending_transactions(&self, awaiting_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE transactions SET status = 'FAILED' WHERE awaiting_id = ? AND status = 'PENDING'",
        )
        .bind(awaiting_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Parses a transaction from a database row.
fn parse_transaction_row(row: &SqliteRow) -> Result<Transaction, StorageError> {
    let tx_type: String = row.try_get("tx_type")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        wallet_id: row.try_get("wallet_id")?,
        user_id: row.try_get("user_id")?,
        amount: get_amount(row, "amount")?,
        currency: row.try_get("currency")?,
        tx_type: parse_enum(&tx_type)?,
        kind: parse_enum(&kind)?,
        status: parse_enum(&status)?,
        awaiting_id: row.try_get("awaiting_id")?,
        external_id: row.try_get("external_id")?,
        created_at: parse_time("created_at", &created_at)?,
    })
}
