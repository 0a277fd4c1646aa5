//! SQLite implementation of the storage traits.
//!
//! Monetary columns hold normalized decimal text, so any amount `Decimal`
//! can represent survives a round trip. SQLite cannot do exact arithmetic on
//! that text, so balance updates read the row and compute in Rust. Every such
//! transaction opens with a write, which takes the database write lock before
//! the read; no other writer can interleave between the read and the update.

mod awaitings;
mod orders;
mod queue;
mod transactions;
mod wallets;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::StorageConfig;
use crate::storage::StorageError;

const MEMORY_PATH: &str = ":memory:";

/// SqliteStorage implements every storage trait using SQLite.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

/// SqliteStorageConfig holds SQLite storage configuration.
#[derive(Debug, Clone)]
pub struct SqliteStorageConfig {
    /// Path to the SQLite database file, or ":memory:".
    pub path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: "escrow_fill.db".to_string(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteStorageConfig {
    /// In-memory database, used by tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }
}

impl From<&StorageConfig> for SqliteStorageConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            path: config.path(),
            max_connections: config.max_connections(),
            busy_timeout: config.busy_timeout(),
        }
    }
}

impl SqliteStorage {
    /// Creates a new SQLite storage instance and applies the schema.
    pub async fn new(config: SqliteStorageConfig) -> Result<Self, StorageError> {
        let in_memory = config.path == MEMORY_PATH;

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        }
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

        // Every in-memory connection is its own database, so the pool keeps
        // exactly one alive for the lifetime of the storage.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;

        let storage = Self { pool };

        storage.migrate().await?;

        info!(path = %config.path, "SQLite storage initialized");
        Ok(storage)
    }

    /// Runs database migrations to create the schema.
    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                base_currency TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                order_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                amount_processed TEXT NOT NULL DEFAULT '0',
                amount_reserved TEXT NOT NULL DEFAULT '0',
                amount_minimum TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                percentage_processed TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                escrow_hold_id TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                proceeds_wallet_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS awaitings (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id),
                order_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                order_amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                user_id TEXT,
                funding TEXT NOT NULL,
                payer_wallet_id TEXT NOT NULL,
                receiver_wallet_id TEXT NOT NULL,
                deposit_address TEXT,
                payment_reference TEXT,
                delivery TEXT,
                shortfall TEXT,
                failure_reason TEXT,
                reservation_released INTEGER NOT NULL DEFAULT 0,
                fill_applied INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id),
                awaiting_id TEXT NOT NULL UNIQUE,
                fill_amount TEXT NOT NULL,
                order_amount TEXT NOT NULL,
                price TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                currency TEXT NOT NULL,
                account_balance TEXT NOT NULL DEFAULT '0',
                available_balance TEXT NOT NULL DEFAULT '0',
                deposit_address TEXT,
                subscription_id TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                reference TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                user_id TEXT,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                awaiting_id TEXT,
                external_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (reference, wallet_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_retries (
                awaiting_id TEXT PRIMARY KEY,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_gaps (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                awaiting_id TEXT,
                leg TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_awaitings_order ON awaitings(order_id, status)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_awaitings_pending_address ON awaitings(deposit_address) WHERE status = 'PENDING' AND deposit_address IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_awaitings_payment_ref ON awaitings(payment_reference)",
            "CREATE INDEX IF NOT EXISTS idx_awaitings_created ON awaitings(status, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_wallets_address ON wallets(deposit_address)",
            "CREATE INDEX IF NOT EXISTS idx_wallets_subscription ON wallets(subscription_id)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_awaiting ON transactions(awaiting_id)",
            "CREATE INDEX IF NOT EXISTS idx_retries_due ON settlement_retries(next_attempt_at)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Close closes the storage connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Formats a timestamp so that lexical order matches chronological order.
fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("Invalid {}: {}", field, e)))
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(value)
        .map_err(|e| StorageError::InvalidData(format!("Invalid {}: {}", field, e)))
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T, StorageError> {
    T::from_str(value).map_err(StorageError::InvalidData)
}

/// Canonical text of an amount. Equal values always store identical text.
fn amount_text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn get_amount(row: &SqliteRow, field: &str) -> Result<Decimal, StorageError> {
    let raw: String = row.try_get(field)?;
    parse_decimal(field, &raw)
}

#[cfg(test)]
mod tests;
