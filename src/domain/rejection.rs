//! Synchronous, caller-actionable rejections.

use rust_decimal::Decimal;
use serde::Serialize;

/// RejectReason is the machine-readable cause of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OrderNotFound,
    OrderNotOpen,
    InsufficientCapacity,
    BelowMinimum,
    InvalidAmount,
    PrecisionExceeded,
    InsufficientBalance,
    UnknownCurrency,
    InvalidWallet,
    InvalidDelivery,
    AddressBusy,
    NotOwner,
    ActiveFills,
    AwaitingNotFound,
    InvalidState,
    PaymentInitFailed,
}

impl RejectReason {
    /// Stable snake_case code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::OrderNotFound => "order_not_found",
            RejectReason::OrderNotOpen => "order_not_open",
            RejectReason::InsufficientCapacity => "insufficient_capacity",
            RejectReason::BelowMinimum => "below_minimum",
            RejectReason::InvalidAmount => "invalid_amount",
            RejectReason::PrecisionExceeded => "precision_exceeded",
            RejectReason::InsufficientBalance => "insufficient_balance",
            RejectReason::UnknownCurrency => "unknown_currency",
            RejectReason::InvalidWallet => "invalid_wallet",
            RejectReason::InvalidDelivery => "invalid_delivery",
            RejectReason::AddressBusy => "address_busy",
            RejectReason::NotOwner => "not_owner",
            RejectReason::ActiveFills => "active_fills",
            RejectReason::AwaitingNotFound => "awaiting_not_found",
            RejectReason::InvalidState => "invalid_state",
            RejectReason::PaymentInitFailed => "payment_init_failed",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code().replace('_', " "))
    }
}

/// Rejection carries the reason plus the order's available amount when the
/// rejection concerns capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub available_amount: Option<Decimal>,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            available_amount: None,
            message: message.into(),
        }
    }

    pub fn with_available(mut self, available: Decimal) -> Self {
        self.available_amount = Some(available.normalize());
        self
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.available_amount {
            Some(available) => write!(f, "{}: {} (available {})", self.reason, self.message, available),
            None => write!(f, "{}: {}", self.reason, self.message),
        }
    }
}
