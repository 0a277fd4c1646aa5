//! Local mirror of custodial ledger accounts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wallet is a read cache of a ledger account. The ledger is authoritative;
/// balances here are only trusted right after a resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Ledger account id.
    pub id: String,
    /// Owning user; None for platform-operated wallets.
    pub user_id: Option<String>,
    pub currency: String,
    pub account_balance: Decimal,
    /// Spendable balance (account balance minus holds).
    pub available_balance: Decimal,
    /// On-chain deposit address, for crypto wallets.
    pub deposit_address: Option<String>,
    /// Custody provider's push subscription id for this address.
    pub subscription_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(id: impl Into<String>, user_id: Option<String>, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id,
            currency: currency.into(),
            account_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            deposit_address: None,
            subscription_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_deposit_address(mut self, address: impl Into<String>) -> Self {
        self.deposit_address = Some(address.into());
        self
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }
}

/// BalanceChange is the outcome of a resync: cached balances before and
/// authoritative balances after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub previous_account: Decimal,
    pub previous_available: Decimal,
    pub account: Decimal,
    pub available: Decimal,
}

impl BalanceChange {
    /// Signed change of the account balance.
    pub fn delta(&self) -> Decimal {
        self.account - self.previous_account
    }
}
