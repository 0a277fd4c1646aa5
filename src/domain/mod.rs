//! Domain models for orders, fills, wallets and transactions.

mod awaiting;
mod currency;
mod order;
mod rejection;
mod transaction;
mod wallet;

pub use awaiting::{Awaiting, AwaitingStatus, DeliveryTarget, Funding, expiry_key};
pub use currency::{Currency, CurrencyCatalog, CurrencyKind, StaticCatalog};
pub use order::{FillRecord, Order, OrderStatus, OrderType, filler_currency, order_currency};
pub use rejection::{RejectReason, Rejection};
pub use transaction::{
    ReconciliationGap, Transaction, TransactionKind, TransactionStatus, TransactionType,
};
pub use wallet::{BalanceChange, Wallet};
