//! Currency catalog entries and the read-only lookup over them.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::CurrencyProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyKind {
    Fiat,
    Crypto,
}

/// Currency is one catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Currency {
    pub code: String,
    pub kind: CurrencyKind,
    /// Economic floor for a single order or fill.
    pub minimum_amount: Decimal,
    pub profile: CurrencyProfile,
}

impl Currency {
    /// Builds an entry using the built-in precision profile for the code.
    pub fn new(code: impl Into<String>, kind: CurrencyKind, minimum_amount: Decimal) -> Self {
        let code = code.into().to_uppercase();
        let profile = CurrencyProfile::for_currency(&code);
        Self {
            code,
            kind,
            minimum_amount,
            profile,
        }
    }

    pub fn with_profile(mut self, profile: CurrencyProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// CurrencyCatalog is the read-only currency lookup consumed by the core.
pub trait CurrencyCatalog: Send + Sync {
    fn get(&self, code: &str) -> Option<Currency>;

    /// Precision profile for a code, falling back to the built-in table.
    fn profile(&self, code: &str) -> CurrencyProfile {
        self.get(code)
            .map(|c| c.profile)
            .unwrap_or_else(|| CurrencyProfile::for_currency(code))
    }
}

/// StaticCatalog serves a fixed set of currencies loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    currencies: HashMap<String, Currency>,
}

impl StaticCatalog {
    pub fn new(currencies: impl IntoIterator<Item = Currency>) -> Self {
        Self {
            currencies: currencies
                .into_iter()
                .map(|c| (c.code.to_uppercase(), c))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.currencies.len()
    }
}

impl CurrencyCatalog for StaticCatalog {
    fn get(&self, code: &str) -> Option<Currency> {
        self.currencies.get(&code.to_uppercase()).cloned()
    }
}
