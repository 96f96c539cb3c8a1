//! Credit price per billable category.
//!
//! The table is fixed at construction and shared read-only for the life
//! of the service.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::config::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PricingTable {
    categories: HashMap<String, Decimal>,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::new()
    }

    pub fn get(&self, category: &str) -> Option<Decimal> {
        self.categories.get(category).copied()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    categories: HashMap<String, Decimal>,
}

impl PricingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price(mut self, category: impl Into<String>, credits: Decimal) -> Self {
        self.categories.insert(category.into(), credits);
        self
    }

    pub fn prices<I, S>(mut self, prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        self.categories
            .extend(prices.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Parses a JSON object of `category -> credits`.
    pub fn from_json(self, raw: &str) -> ConfigResult<Self> {
        let parsed: HashMap<String, Decimal> = serde_json::from_str(raw)?;
        Ok(self.prices(parsed))
    }

    pub fn build(self) -> ConfigResult<PricingTable> {
        for (category, credits) in &self.categories {
            if credits.is_sign_negative() && !credits.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: format!("pricing.{}", category),
                    message: format!("price must be non-negative, got {}", credits),
                });
            }
        }
        Ok(PricingTable {
            categories: self.categories,
        })
    }
}
