//! Escrow-backed partial-fill settlement for standing orders.
//!
//! The binary in `main.rs` loads configuration and runs [`FillService`].
//! The modules are public so the service can be embedded and driven from
//! integration tests.

pub mod config;
pub mod decimal;
pub mod domain;
pub mod events;
pub mod ledger;
pub mod notification;
pub mod payments;
pub mod reservation;
pub mod scheduler;
pub mod service;
pub mod settlement;
pub mod signature;
pub mod storage;

#[cfg(test)]
mod testkit;

pub use config::{Config, ConfigError};
pub use domain::{DeliveryTarget, Funding, Order, OrderStatus, OrderType, RejectReason, Rejection};
pub use events::{DepositEvent, PaymentCallback, WebhookAck, WebhookError};
pub use reservation::{FillRequest, SlotReservation};
pub use service::{FillService, ServiceError, Stats};
pub use settlement::{DrainReport, FillSummary, OrderRequest, SettleOutcome, SettlementError};
