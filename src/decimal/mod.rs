//! Currency-aware precision rules for monetary amounts.
//!
//! Every rounding here truncates toward zero so that no conversion can
//! manufacture value. Comparisons use [`EPSILON`] instead of exact equality.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use thiserror::Error;

use crate::domain::OrderType;

/// Tolerance for amount comparisons (1e-8).
pub const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

/// Decimal errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecimalError {
    #[error("amount {amount} has more than {max} decimal places")]
    PrecisionExceeded { amount: Decimal, max: u32 },

    #[error("amount {0} is out of range")]
    OutOfRange(Decimal),

    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),
}

/// Precision profile of one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CurrencyProfile {
    /// Places shown to users.
    pub display_decimals: u32,
    /// Places persisted and accepted on input.
    pub storage_decimals: u32,
    /// Places accepted by the chain for on-chain transfers.
    pub blockchain_decimals: u32,
}

impl CurrencyProfile {
    pub const DEFAULT: Self = Self::uniform(8);

    pub const fn uniform(decimals: u32) -> Self {
        Self {
            display_decimals: decimals,
            storage_decimals: decimals,
            blockchain_decimals: decimals,
        }
    }

    /// Built-in profile table. Unknown codes get [`CurrencyProfile::DEFAULT`].
    pub fn for_currency(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            // fiat and stablecoins
            "USD" | "EUR" | "GBP" | "NGN" | "KES" | "GHS" | "ZAR" | "USDT" | "USDC" | "BUSD"
            | "DAI" | "CUSD" => Self::uniform(2),
            "BTC" | "ETH" => Self::uniform(8),
            "SOL" | "TRX" | "XRP" | "BNB" | "MATIC" | "ADA" | "DOGE" | "LTC" | "XLM" | "TON" => {
                Self::uniform(6)
            }
            _ => Self::DEFAULT,
        }
    }

    pub fn to_storage(&self, value: Decimal) -> Decimal {
        truncate(value, self.storage_decimals)
    }

    pub fn to_display(&self, value: Decimal) -> Decimal {
        truncate(value, self.display_decimals)
    }

    pub fn to_blockchain(&self, value: Decimal) -> Decimal {
        truncate(value, self.blockchain_decimals)
    }

    /// Rejects amounts carrying more places than storage allows.
    pub fn check_precision(&self, value: Decimal) -> Result<(), DecimalError> {
        if value.normalize().scale() > self.storage_decimals {
            return Err(DecimalError::PrecisionExceeded {
                amount: value,
                max: self.storage_decimals,
            });
        }
        Ok(())
    }
}

impl Default for CurrencyProfile {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Truncates toward zero to `dp` places.
pub fn truncate(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

pub fn approx_eq(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < EPSILON
}

/// a >= b within epsilon.
pub fn gte(a: Decimal, b: Decimal) -> bool {
    a > b || approx_eq(a, b)
}

/// a > b by more than epsilon.
pub fn gt(a: Decimal, b: Decimal) -> bool {
    a > b && !approx_eq(a, b)
}

/// Converts a filler-currency amount into the order currency at the order's
/// fixed price. SELL divides by price, BUY multiplies.
pub fn to_order_currency(
    fill_amount: Decimal,
    price: Decimal,
    order_type: OrderType,
    order_profile: &CurrencyProfile,
) -> Result<Decimal, DecimalError> {
    if price <= Decimal::ZERO {
        return Err(DecimalError::InvalidPrice(price));
    }
    let raw = match order_type {
        OrderType::Sell => fill_amount.checked_div(price),
        OrderType::Buy => fill_amount.checked_mul(price),
    }
    .ok_or(DecimalError::OutOfRange(fill_amount))?;
    Ok(order_profile.to_storage(raw))
}

/// Inverse of [`to_order_currency`].
pub fn to_filler_currency(
    order_amount: Decimal,
    price: Decimal,
    order_type: OrderType,
    filler_profile: &CurrencyProfile,
) -> Result<Decimal, DecimalError> {
    if price <= Decimal::ZERO {
        return Err(DecimalError::InvalidPrice(price));
    }
    let raw = match order_type {
        OrderType::Sell => order_amount.checked_mul(price),
        OrderType::Buy => order_amount.checked_div(price),
    }
    .ok_or(DecimalError::OutOfRange(order_amount))?;
    Ok(filler_profile.to_storage(raw))
}

/// part / whole * 100, truncated to two places. Zero when whole is zero.
pub fn percentage(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    match part.checked_div(whole) {
        Some(ratio) => truncate(ratio * Decimal::ONE_HUNDRED, 2),
        None => Decimal::ZERO,
    }
}
