//! Currency catalog configuration.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::decimal::CurrencyProfile;
use crate::domain::{Currency, CurrencyKind};

/// One catalog entry. Unset decimals fall back to the built-in profile.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    pub code: String,
    pub kind: CurrencyKind,
    /// Minimum order/fill amount (e.g. "0.0001").
    #[serde(default)]
    pub minimum: Decimal,
    pub display_decimals: Option<u32>,
    pub storage_decimals: Option<u32>,
    pub blockchain_decimals: Option<u32>,
}

impl CurrencyConfig {
    pub fn to_currency(&self) -> Currency {
        let builtin = CurrencyProfile::for_currency(&self.code);
        let profile = CurrencyProfile {
            display_decimals: self.display_decimals.unwrap_or(builtin.display_decimals),
            storage_decimals: self.storage_decimals.unwrap_or(builtin.storage_decimals),
            blockchain_decimals: self
                .blockchain_decimals
                .unwrap_or(builtin.blockchain_decimals),
        };
        Currency::new(&self.code, self.kind, self.minimum).with_profile(profile)
    }
}
