//! Ledger gateway: every balance mutation goes through here.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{CustodyLedger, LedgerEntry, LedgerError};
use crate::config::RetryConfig;
use crate::domain::{
    BalanceChange, Transaction, TransactionKind, TransactionStatus, TransactionType, Wallet,
};
use crate::storage::Storage;

/// Posting describes the audit rows a fund movement produces.
#[derive(Debug, Clone, Copy)]
pub struct Posting<'a> {
    /// Idempotency key shared by the ledger call and its Transaction rows.
    pub reference: &'a str,
    pub kind: TransactionKind,
    pub awaiting_id: Option<&'a str>,
    /// Status of the written rows. Pending when a later callback confirms
    /// the movement.
    pub status: TransactionStatus,
}

impl<'a> Posting<'a> {
    pub fn new(reference: &'a str, kind: TransactionKind) -> Self {
        Self {
            reference,
            kind,
            awaiting_id: None,
            status: TransactionStatus::Success,
        }
    }

    pub fn for_awaiting(mut self, awaiting_id: &'a str) -> Self {
        self.awaiting_id = Some(awaiting_id);
        self
    }

    pub fn pending(mut self) -> Self {
        self.status = TransactionStatus::Pending;
        self
    }
}

/// LedgerGateway wraps a [`CustodyLedger`] with wallet-cache resync,
/// Transaction bookkeeping and bounded retries.
///
/// Reads are retried blindly. Fund movements are only retried after a
/// lookup confirms the previous attempt did not commit.
pub struct LedgerGateway {
    ledger: Arc<dyn CustodyLedger>,
    storage: Arc<dyn Storage>,
    retry: RetryConfig,
}

impl LedgerGateway {
    pub fn new(ledger: Arc<dyn CustodyLedger>, storage: Arc<dyn Storage>, retry: RetryConfig) -> Self {
        Self {
            ledger,
            storage,
            retry,
        }
    }

    /// Re-reads authoritative balances into the wallet cache.
    pub async fn resync(&self, wallet_id: &str) -> Result<BalanceChange, LedgerError> {
        let balance = self
            .with_retry("balance", || self.ledger.balance(wallet_id))
            .await?;
        let change = self
            .storage
            .update_balances(wallet_id, balance.account, balance.available)
            .await?;

        debug!(
            wallet_id,
            account = %change.account,
            available = %change.available,
            "Wallet resynced"
        );
        Ok(change)
    }

    /// Resyncs and returns the authoritative available balance.
    pub async fn available(&self, wallet_id: &str) -> Result<Decimal, LedgerError> {
        Ok(self.resync(wallet_id).await?.available)
    }

    /// Holds `amount` of the wallet's funds. Fails on insufficient funds.
    pub async fn escrow(
        &self,
        wallet_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, LedgerError> {
        let hold_id = self
            .move_funds(
                "escrow",
                reference,
                |entry| entry.hold_id.clone(),
                || self.ledger.escrow(wallet_id, amount, reference),
            )
            .await?;
        self.resync(wallet_id).await?;

        info!(wallet_id, hold_id = %hold_id, amount = %amount, "Escrow placed");
        Ok(hold_id)
    }

    /// Releases what is left on a hold back to the owner wallet.
    pub async fn release_escrow(
        &self,
        hold_id: &str,
        wallet_id: &str,
        reference: &str,
    ) -> Result<Decimal, LedgerError> {
        let released = self
            .move_funds(
                "release_escrow",
                reference,
                |entry| Some(entry.amount.unwrap_or_default()),
                || self.ledger.release_escrow(hold_id, reference),
            )
            .await?;
        self.resync(wallet_id).await?;

        info!(wallet_id, hold_id, released = %released, "Escrow released");
        Ok(released)
    }

    /// Draws `amount` from the owner's hold into the recipient wallet.
    pub async fn settle_escrow(
        &self,
        hold_id: &str,
        owner: &Wallet,
        recipient: &Wallet,
        amount: Decimal,
        posting: Posting<'_>,
    ) -> Result<(), LedgerError> {
        self.move_funds(
            "settle_escrow",
            posting.reference,
            |_| Some(()),
            || {
                self.ledger
                    .settle_escrow(hold_id, amount, &recipient.id, posting.reference)
            },
        )
        .await?;

        self.record(owner, amount, TransactionType::Debit, posting, None)
            .await?;
        self.record(recipient, amount, TransactionType::Credit, posting, None)
            .await?;
        self.resync(&owner.id).await?;
        self.resync(&recipient.id).await?;

        info!(
            hold_id,
            from = %owner.id,
            to = %recipient.id,
            amount = %amount,
            reference = posting.reference,
            "Escrow settled"
        );
        Ok(())
    }

    /// Unescrowed peer move. Always writes a debit and a credit row sharing
    /// the posting reference.
    pub async fn transfer(
        &self,
        from: &Wallet,
        to: &Wallet,
        amount: Decimal,
        posting: Posting<'_>,
    ) -> Result<(), LedgerError> {
        self.move_funds(
            "transfer",
            posting.reference,
            |_| Some(()),
            || self.ledger.transfer(&from.id, &to.id, amount, posting.reference),
        )
        .await?;

        self.record(from, amount, TransactionType::Debit, posting, None)
            .await?;
        self.record(to, amount, TransactionType::Credit, posting, None)
            .await?;
        self.resync(&from.id).await?;
        self.resync(&to.id).await?;

        info!(
            from = %from.id,
            to = %to.id,
            amount = %amount,
            reference = posting.reference,
            "Transfer completed"
        );
        Ok(())
    }

    /// Mints into a wallet.
    pub async fn credit(
        &self,
        wallet: &Wallet,
        amount: Decimal,
        posting: Posting<'_>,
    ) -> Result<(), LedgerError> {
        self.move_funds(
            "credit",
            posting.reference,
            |_| Some(()),
            || self.ledger.credit(&wallet.id, amount, posting.reference),
        )
        .await?;

        self.record(wallet, amount, TransactionType::Credit, posting, None)
            .await?;
        self.resync(&wallet.id).await?;
        Ok(())
    }

    /// Burns from a wallet.
    pub async fn debit(
        &self,
        wallet: &Wallet,
        amount: Decimal,
        posting: Posting<'_>,
    ) -> Result<(), LedgerError> {
        self.move_funds(
            "debit",
            posting.reference,
            |_| Some(()),
            || self.ledger.debit(&wallet.id, amount, posting.reference),
        )
        .await?;

        self.record(wallet, amount, TransactionType::Debit, posting, None)
            .await?;
        self.resync(&wallet.id).await?;
        Ok(())
    }

    /// Sends funds on-chain and returns the transaction hash when known.
    pub async fn withdraw(
        &self,
        wallet: &Wallet,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
        posting: Posting<'_>,
    ) -> Result<Option<String>, LedgerError> {
        let hash = self
            .move_funds(
                "withdraw",
                posting.reference,
                |entry| Some(entry.external_id.clone()),
                || {
                    self.ledger
                        .withdraw(&wallet.id, amount, address, network, posting.reference)
                },
            )
            .await?;

        self.record(wallet, amount, TransactionType::Debit, posting, hash.clone())
            .await?;
        self.resync(&wallet.id).await?;

        info!(
            wallet_id = %wallet.id,
            address,
            amount = %amount,
            tx_hash = hash.as_deref().unwrap_or("-"),
            "Withdrawal sent"
        );
        Ok(hash)
    }

    async fn record(
        &self,
        wallet: &Wallet,
        amount: Decimal,
        tx_type: TransactionType,
        posting: Posting<'_>,
        external_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let mut tx = Transaction::new(
            posting.reference,
            &wallet.id,
            amount,
            &wallet.currency,
            tx_type,
            posting.kind,
        )
        .with_status(posting.status)
        .with_user(wallet.user_id.clone())
        .with_external_id(external_id);
        if let Some(awaiting_id) = posting.awaiting_id {
            tx = tx.with_awaiting(awaiting_id);
        }
        self.storage.insert_transaction(&tx).await?;
        Ok(())
    }

    /// Retries an idempotent read with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(op, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Retrying ledger read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a fund movement. After a transient failure the reference is
    /// looked up first; the call is only repeated if nothing was committed.
    async fn move_funds<T, F, Fut>(
        &self,
        op: &str,
        reference: &str,
        recover: impl Fn(&LedgerEntry) -> Option<T>,
        mut call: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            match self.ledger.lookup(reference).await {
                Ok(Some(entry)) => {
                    if let Some(value) = recover(&entry) {
                        info!(op, reference, "Ledger call committed despite error");
                        return Ok(value);
                    }
                }
                Ok(None) => {}
                Err(lookup_err) => {
                    warn!(op, reference, error = %lookup_err, "Cannot verify ledger call outcome");
                    return Err(err);
                }
            }

            if attempt + 1 >= max_attempts {
                return Err(err);
            }

            let delay = self.retry.backoff(attempt);
            warn!(op, reference, attempt = attempt + 1, error = %err, "Retrying unconfirmed ledger call");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
