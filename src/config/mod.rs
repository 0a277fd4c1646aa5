//! Configuration loading and validation for the settlement service.
//!
//! Uses serde_yaml to load YAML configuration files. Credentials and webhook
//! secrets never live in the file; they are read from environment variables.

mod app;
mod currency;
mod duration;
mod error;
mod ledger;
mod notification;
mod payments;
mod settlement;
mod storage;

pub use app::AppConfig;
pub use currency::CurrencyConfig;
pub use error::ConfigError;
pub use ledger::{LedgerConfig, LedgerProvider, RetryConfig};
pub use notification::{DispatcherConfig, NotificationConfig};
pub use payments::{PaymentsConfig, WebhookConfig};
pub use settlement::SettlementConfig;
pub use storage::StorageConfig;

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::{env, fs};

use crate::domain::StaticCatalog;

/// Root configuration structure.
///
/// Required sections: app, ledger.
/// Optional sections: storage, payments, webhooks, notification, settlement, currencies.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Application-level settings like name and environment.
    pub app: AppConfig,
    /// SQLite persistence.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Custody ledger backend.
    pub ledger: LedgerConfig,
    /// Payment gateway for fiat funding and bank payouts (optional).
    pub payments: Option<PaymentsConfig>,
    /// Webhook signature secrets (populated from the environment).
    #[serde(default)]
    pub webhooks: WebhookConfig,
    /// Notification dispatcher (optional).
    pub notification: Option<NotificationConfig>,
    /// Reservation and settlement tuning.
    #[serde(default)]
    pub settlement: SettlementConfig,
    /// Currency catalog.
    #[serde(default)]
    pub currencies: Vec<CurrencyConfig>,
}

impl Config {
    /// Load configuration from a YAML file at the given path.
    ///
    /// First loads environment variables from `.env` file (if exists),
    /// then loads YAML config and credentials from environment variables:
    /// - `LEDGER_API_KEY`, `LEDGER_API_SECRET`
    /// - `PAYMENTS_SECRET_KEY`
    /// - `DEPOSIT_WEBHOOK_SECRET`, `PAYMENT_WEBHOOK_SECRET`
    /// - `NOTIFY_DISPATCHER_TOKEN`
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        config.load_credentials_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Builds the read-only currency catalog from the `currencies` section.
    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::new(self.currencies.iter().map(CurrencyConfig::to_currency))
    }

    /// Load credentials from environment variables.
    fn load_credentials_from_env(&mut self) {
        self.ledger.api_key = env::var("LEDGER_API_KEY").unwrap_or_default();
        self.ledger.api_secret = env::var("LEDGER_API_SECRET").unwrap_or_default();

        if let Some(ref mut payments) = self.payments {
            payments.secret_key = env::var("PAYMENTS_SECRET_KEY").unwrap_or_default();
        }

        self.webhooks.deposit_secret = env::var("DEPOSIT_WEBHOOK_SECRET").unwrap_or_default();
        self.webhooks.payment_secret = env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default();

        if let Some(ref mut notification) = self.notification {
            if let Some(ref mut dispatcher) = notification.dispatcher {
                if dispatcher.enabled {
                    dispatcher.token = env::var("NOTIFY_DISPATCHER_TOKEN").unwrap_or_default();
                }
            }
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.is_empty() {
            return Err(ConfigError::Validation("app.name is required".into()));
        }

        let is_production = self.app.is_production();

        if self.ledger.provider == LedgerProvider::Http {
            if self.ledger.base_url.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Validation(
                    "ledger.base_url is required for the http provider".into(),
                ));
            }
            if is_production && self.ledger.api_key.is_empty() {
                return Err(ConfigError::MissingCredential("LEDGER_API_KEY"));
            }
            if is_production && self.ledger.api_secret.is_empty() {
                return Err(ConfigError::MissingCredential("LEDGER_API_SECRET"));
            }
        } else if is_production {
            return Err(ConfigError::Validation(
                "the memory ledger is for development only".into(),
            ));
        }

        if let Some(ref payments) = self.payments {
            if payments.enabled {
                if payments.base_url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Validation(
                        "payments.base_url is required when payments are enabled".into(),
                    ));
                }
                if is_production && payments.secret_key.is_empty() {
                    return Err(ConfigError::MissingCredential("PAYMENTS_SECRET_KEY"));
                }
                if is_production && self.webhooks.payment_secret.is_empty() {
                    return Err(ConfigError::MissingCredential("PAYMENT_WEBHOOK_SECRET"));
                }
            }
        }

        if is_production && self.webhooks.allow_unsigned {
            return Err(ConfigError::Validation(
                "webhooks.allow_unsigned is for development only".into(),
            ));
        }
        if is_production && self.webhooks.deposit_secret.is_empty() {
            return Err(ConfigError::MissingCredential("DEPOSIT_WEBHOOK_SECRET"));
        }

        let fee_rate = self.settlement.fee_rate();
        if fee_rate < Decimal::ZERO || fee_rate >= Decimal::ONE {
            return Err(ConfigError::Validation(
                "settlement.fee_rate must be in [0, 1)".into(),
            ));
        }
        if fee_rate > Decimal::ZERO && self.settlement.fee_wallets.is_empty() {
            return Err(ConfigError::Validation(
                "settlement.fee_wallets is required when fee_rate is set".into(),
            ));
        }

        let mut codes = HashSet::new();
        for currency in &self.currencies {
            if !codes.insert(currency.code.to_uppercase()) {
                return Err(ConfigError::Validation(format!(
                    "currency {} is listed twice",
                    currency.code
                )));
            }
            if currency.minimum < Decimal::ZERO {
                return Err(ConfigError::Validation(format!(
                    "currency {}: minimum must not be negative",
                    currency.code
                )));
            }
        }

        Ok(())
    }
}
