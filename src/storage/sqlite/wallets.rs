use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{SqliteStorage, amount_text, fmt_time, get_amount, parse_time};
use crate::domain::{BalanceChange, Wallet};
use crate::storage::{StorageError, WalletStore};

const WALLET_COLUMNS: &str = "id, user_id, currency, account_balance, available_balance, \
     deposit_address, subscription_id, updated_at";

#[async_trait]
impl WalletStore for SqliteStorage {
    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO wallets (
                id, user_id, currency, account_balance, available_balance,
                deposit_address, subscription_id, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                currency = excluded.currency,
                account_balance = excluded.account_balance,
                available_balance = excluded.available_balance,
                deposit_address = excluded.deposit_address,
                subscription_id = excluded.subscription_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&wallet.id)
        .bind(&wallet.user_id)
        .bind(&wallet.currency)
        .bind(amount_text(wallet.account_balance))
        .bind(amount_text(wallet.available_balance))
        .bind(&wallet.deposit_address)
        .bind(&wallet.subscription_id)
        .bind(fmt_time(&wallet.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_wallet(&self, id: &str) -> Result<Option<Wallet>, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM wallets WHERE id = ?", WALLET_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_wallet_row).transpose()
    }

    async fn find_wallet_by_address(&self, address: &str) -> Result<Option<Wallet>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE deposit_address = ? LIMIT 1",
            WALLET_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_wallet_row).transpose()
    }

    async fn find_wallet_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Wallet>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE subscription_id = ? LIMIT 1",
            WALLET_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_wallet_row).transpose()
    }

    async fn update_balances(
        &self,
        id: &str,
        account: Decimal,
        available: Decimal,
    ) -> Result<BalanceChange, StorageError> {
        let now = fmt_time(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE wallets SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::NotFound(format!("wallet {}", id)));
        }

        let row = sqlx::query(
            "SELECT account_balance, available_balance FROM wallets WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let previous_account = get_amount(&row, "account_balance")?;
        let previous_available = get_amount(&row, "available_balance")?;

        sqlx::query(
            r#"
            UPDATE wallets SET account_balance = ?, available_balance = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(amount_text(account))
        .bind(amount_text(available))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(BalanceChange {
            previous_account,
            previous_available,
            account: account.normalize(),
            available: available.normalize(),
        })
    }
}

/// Parses a wallet from a database row.
fn parse_wallet_row(row: &SqliteRow) -> Result<Wallet, StorageError> {
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        currency: row.try_get("currency")?,
        account_balance: get_amount(row, "account_balance")?,
        available_balance: get_amount(row, "available_balance")?,
        deposit_address: row.try_get("deposit_address")?,
        subscription_id: row.try_get("subscription_id")?,
        updated_at: parse_time("updated_at", &updated_at)?,
    })
}
