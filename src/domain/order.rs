//! Standing orders and the fill log written against them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal;

/// OrderType represents which side of the pair the owner is giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// The owner buys base, escrowing quote. Order amounts are in quote.
    Buy,
    /// The owner sells base, escrowing base. Order amounts are in base.
    Sell,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Buy => write!(f, "BUY"),
            OrderType::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderType::Buy),
            "SELL" => Ok(OrderType::Sell),
            _ => Err(format!("Unknown order type: {}", s)),
        }
    }
}

/// OrderStatus represents the current state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Open and accepting fills.
    Open,
    /// Fully processed.
    Closed,
    /// Withdrawn by the owner; remaining escrow released.
    Canceled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "OPEN"),
            OrderStatus::Closed => write!(f, "CLOSED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "CLOSED" => Ok(OrderStatus::Closed),
            "CANCELED" => Ok(OrderStatus::Canceled),
            _ => Err(format!("Unknown order status: {}", s)),
        }
    }
}

/// Order is a standing offer to exchange a fixed amount at a fixed price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier.
    pub id: String,
    /// Owner of the order and of the escrowed funds.
    pub user_id: String,
    /// Base asset code (e.g., "BTC").
    pub base_currency: String,
    /// Quote asset code (e.g., "NGN").
    pub quote_currency: String,
    /// BUY or SELL, from the owner's point of view.
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Tradable amount in the order currency (after fee).
    pub amount: Decimal,
    /// Amount already settled.
    pub amount_processed: Decimal,
    /// Amount claimed by in-flight fills.
    pub amount_reserved: Decimal,
    /// Smallest fill accepted, in the order currency.
    pub amount_minimum: Decimal,
    /// Fixed price in quote per base.
    pub price: Decimal,
    /// Fee deducted at placement, in the order currency.
    pub fee: Decimal,
    /// amount_processed / amount * 100, truncated to two places.
    pub percentage_processed: Decimal,
    pub status: OrderStatus,
    /// Incremented on every accepted settlement or cancellation.
    pub version: i64,
    /// External id of the escrow hold backing the order.
    pub escrow_hold_id: String,
    /// Owner wallet in the order currency; source of the escrow.
    pub wallet_id: String,
    /// Owner wallet in the filler currency; receives fill payments.
    pub proceeds_wallet_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Currency the order amounts and escrow are denominated in.
    pub fn order_currency(&self) -> &str {
        order_currency(self.order_type, &self.base_currency, &self.quote_currency)
    }

    /// Currency fillers pay in.
    pub fn filler_currency(&self) -> &str {
        filler_currency(self.order_type, &self.base_currency, &self.quote_currency)
    }

    /// Capacity not yet settled: amount - amount_processed.
    pub fn remaining(&self) -> Decimal {
        self.amount - self.amount_processed
    }

    /// Capacity neither settled nor reserved.
    pub fn available(&self) -> Decimal {
        (self.amount - self.amount_processed - self.amount_reserved).max(Decimal::ZERO)
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Returns true once the processed amount covers the order amount.
    pub fn is_fully_processed(&self) -> bool {
        decimal::gte(self.amount_processed, self.amount)
    }
}

/// Returns the escrowed currency for an order of the given type.
pub fn order_currency<'a>(order_type: OrderType, base: &'a str, quote: &'a str) -> &'a str {
    match order_type {
        OrderType::Sell => base,
        OrderType::Buy => quote,
    }
}

/// Returns the currency a filler pays with for an order of the given type.
pub fn filler_currency<'a>(order_type: OrderType, base: &'a str, quote: &'a str) -> &'a str {
    match order_type {
        OrderType::Sell => quote,
        OrderType::Buy => base,
    }
}

/// FillRecord is the immutable log row written for every applied fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub order_id: String,
    pub awaiting_id: String,
    /// Amount the filler paid, in the filler currency.
    pub fill_amount: Decimal,
    /// Amount drawn from the order, in the order currency.
    pub order_amount: Decimal,
    pub price: Decimal,
    /// Order version after the fill was applied.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}
