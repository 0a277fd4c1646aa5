//! In-process custody ledger for local runs and tests.
//!
//! Accounts spring into existence empty on first use. Every fund-moving call
//! is idempotent on its reference: replaying a committed reference returns
//! the recorded outcome without moving funds again.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AccountBalance, CustodyLedger, LedgerEntry, LedgerError};

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub enum FailureMode {
    /// Fails with a non-retryable rejection; nothing is committed.
    Reject,
    /// Fails transiently; nothing is committed.
    Transient,
    /// Commits the call but reports a transient failure.
    LostResponse,
}

#[derive(Debug, Default)]
struct Account {
    balance: Decimal,
    held: Decimal,
}

impl Account {
    fn available(&self) -> Decimal {
        self.balance - self.held
    }
}

#[derive(Debug)]
struct Hold {
    account_id: String,
    remaining: Decimal,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    holds: HashMap<String, Hold>,
    entries: HashMap<String, LedgerEntry>,
    failures: HashMap<&'static str, VecDeque<FailureMode>>,
    next_hold: u64,
}

impl State {
    fn account(&mut self, id: &str) -> &mut Account {
        self.accounts.entry(id.to_string()).or_default()
    }

    fn take_failure(&mut self, op: &'static str) -> Option<FailureMode> {
        self.failures.get_mut(op).and_then(VecDeque::pop_front)
    }

    fn record(&mut self, reference: &str) -> &mut LedgerEntry {
        self.entries
            .entry(reference.to_string())
            .or_insert_with(|| LedgerEntry {
                reference: reference.to_string(),
                hold_id: None,
                external_id: None,
                amount: None,
            })
    }

    fn ensure_available(&mut self, account_id: &str, amount: Decimal) -> Result<(), LedgerError> {
        let available = self.account(account_id).available();
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account_id.to_string(),
                requested: amount,
                available,
            });
        }
        Ok(())
    }
}

/// InMemoryLedger implements [`CustodyLedger`] over a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next call of `op` (e.g. "transfer").
    #[cfg(test)]
    pub async fn fail_next(&self, op: &'static str, mode: FailureMode) {
        let mut state = self.state.lock().await;
        state.failures.entry(op).or_default().push_back(mode);
    }

    /// Amount left on a hold.
    #[cfg(test)]
    pub async fn hold_remaining(&self, hold_id: &str) -> Option<Decimal> {
        let state = self.state.lock().await;
        state.holds.get(hold_id).map(|h| h.remaining)
    }

    /// Runs `apply` unless the reference was already committed, honoring any
    /// injected failure for `op`.
    async fn commit<T>(
        &self,
        op: &'static str,
        reference: &str,
        replay: impl FnOnce(&LedgerEntry) -> T,
        apply: impl FnOnce(&mut State) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get(reference) {
            debug!(op, reference, "replayed ledger reference");
            return Ok(replay(entry));
        }

        match state.take_failure(op) {
            Some(FailureMode::Reject) => {
                return Err(LedgerError::Rejected(format!("{} rejected", op)));
            }
            Some(FailureMode::Transient) => {
                return Err(LedgerError::Transient(format!("{} timed out", op)));
            }
            Some(FailureMode::LostResponse) => {
                apply(&mut state)?;
                return Err(LedgerError::Transient(format!("{} response lost", op)));
            }
            None => {}
        }

        apply(&mut state)
    }
}

#[async_trait]
impl CustodyLedger for InMemoryLedger {
    async fn balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(FailureMode::Transient | FailureMode::LostResponse) = state.take_failure("balance") {
            return Err(LedgerError::Transient("balance timed out".into()));
        }
        let account = state.account(account_id);
        Ok(AccountBalance {
            account: account.balance,
            available: account.available(),
        })
    }

    async fn escrow(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, LedgerError> {
        self.commit(
            "escrow",
            reference,
            |entry| entry.hold_id.clone().unwrap_or_default(),
            |state| {
                state.ensure_available(account_id, amount)?;
                state.account(account_id).held += amount;
                state.next_hold += 1;
                let hold_id = format!("hold-{}", state.next_hold);
                state.holds.insert(
                    hold_id.clone(),
                    Hold {
                        account_id: account_id.to_string(),
                        remaining: amount,
                    },
                );
                state.record(reference).hold_id = Some(hold_id.clone());
                Ok(hold_id)
            },
        )
        .await
    }

    async fn release_escrow(&self, hold_id: &str, reference: &str) -> Result<Decimal, LedgerError> {
        self.commit(
            "release_escrow",
            reference,
            |entry| entry.amount.unwrap_or_default(),
            |state| {
                let hold = state
                    .holds
                    .get_mut(hold_id)
                    .ok_or_else(|| LedgerError::HoldNotFound(hold_id.to_string()))?;
                let released = hold.remaining;
                hold.remaining = Decimal::ZERO;
                let account_id = hold.account_id.clone();
                state.account(&account_id).held -= released;
                state.record(reference).amount = Some(released);
                Ok(released)
            },
        )
        .await
    }

    async fn settle_escrow(
        &self,
        hold_id: &str,
        amount: Decimal,
        recipient_id: &str,
        reference: &str,
    ) -> Result<(), LedgerError> {
        self.commit(
            "settle_escrow",
            reference,
            |_| (),
            |state| {
                let hold = state
                    .holds
                    .get_mut(hold_id)
                    .ok_or_else(|| LedgerError::HoldNotFound(hold_id.to_string()))?;
                if hold.remaining < amount {
                    return Err(LedgerError::HoldExhausted {
                        hold_id: hold_id.to_string(),
                        requested: amount,
                        remaining: hold.remaining,
                    });
                }
                hold.remaining -= amount;
                let owner_id = hold.account_id.clone();

                let owner = state.account(&owner_id);
                owner.held -= amount;
                owner.balance -= amount;
                state.account(recipient_id).balance += amount;
                state.record(reference);
                Ok(())
            },
        )
        .await
    }

    async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        self.commit(
            "transfer",
            reference,
            |_| (),
            |state| {
                state.ensure_available(from_id, amount)?;
                state.account(from_id).balance -= amount;
                state.account(to_id).balance += amount;
                state.record(reference);
                Ok(())
            },
        )
        .await
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        self.commit(
            "credit",
            reference,
            |_| (),
            |state| {
                state.account(account_id).balance += amount;
                state.record(reference);
                Ok(())
            },
        )
        .await
    }

    async fn debit(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        self.commit(
            "debit",
            reference,
            |_| (),
            |state| {
                state.ensure_available(account_id, amount)?;
                state.account(account_id).balance -= amount;
                state.record(reference);
                Ok(())
            },
        )
        .await
    }

    async fn withdraw(
        &self,
        account_id: &str,
        amount: Decimal,
        address: &str,
        _network: Option<&str>,
        reference: &str,
    ) -> Result<Option<String>, LedgerError> {
        self.commit(
            "withdraw",
            reference,
            |entry| entry.external_id.clone(),
            |state| {
                if address.is_empty() {
                    return Err(LedgerError::Rejected("withdrawal address is empty".into()));
                }
                state.ensure_available(account_id, amount)?;
                state.account(account_id).balance -= amount;
                let hash = format!("0x{}", uuid::Uuid::new_v4().simple());
                state.record(reference).external_id = Some(hash.clone());
                Ok(Some(hash))
            },
        )
        .await
    }

    async fn lookup(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(reference).cloned())
    }
}
