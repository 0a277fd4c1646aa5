//! Payment gateway for fiat deposits, bank payouts and account resolution.

mod http;

pub use http::HttpPaymentGateway;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DepositRequest asks the gateway to collect a fiat payment.
#[derive(Debug, Clone, Serialize)]
pub struct DepositRequest {
    /// Our reference; echoed back in callbacks.
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    /// Payer contact, when known.
    pub email: Option<String>,
}

/// DepositInstructions tell the payer how to complete a deposit.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositInstructions {
    pub reference: String,
    /// Hosted checkout page, if the gateway offers one.
    pub checkout_url: Option<String>,
    /// Gateway-side id.
    pub external_id: Option<String>,
}

/// PayoutRequest sends funds to a bank account.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub bank_code: String,
    pub account_number: String,
    pub account_name: Option<String>,
    pub narration: String,
}

/// PayoutReceipt acknowledges a queued payout. The final outcome arrives
/// later as a callback.
#[derive(Debug, Clone, Deserialize)]
pub struct PayoutReceipt {
    pub reference: String,
    pub external_id: Option<String>,
}

/// ResolvedAccount is a verified bank account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolvedAccount {
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_deposit(
        &self,
        request: &DepositRequest,
    ) -> Result<DepositInstructions, PaymentError>;

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt, PaymentError>;

    async fn resolve_account(
        &self,
        bank_code: &str,
        account_number: &str,
    ) -> Result<ResolvedAccount, PaymentError>;
}

/// Payment gateway errors.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payment gateway error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("bank account could not be resolved: {0}")]
    AccountNotResolved(String),

    #[error("payment gateway did not answer within {0:?}")]
    Timeout(std::time::Duration),
}
