//! Pending charge aggregation between syncs.
//!
//! Serialized as `{ accountId: { category: [count, credits] } }`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireEntry", into = "WireEntry")]
pub struct ChargeEntry {
    pub count: u64,
    pub credits: Decimal,
}

impl ChargeEntry {
    pub fn new(count: u64, credits: Decimal) -> Self {
        Self { count, credits }
    }

    pub fn add(&mut self, other: ChargeEntry) {
        self.count = self.count.saturating_add(other.count);
        self.credits += other.credits;
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry(u64, #[serde(with = "rust_decimal::serde::float")] Decimal);

impl From<WireEntry> for ChargeEntry {
    fn from(wire: WireEntry) -> Self {
        Self::new(wire.0, wire.1)
    }
}

impl From<ChargeEntry> for WireEntry {
    fn from(entry: ChargeEntry) -> Self {
        WireEntry(entry.count, entry.credits)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingCharges {
    accounts: HashMap<String, HashMap<String, ChargeEntry>>,
}

impl PendingCharges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request against `(account_id, category)`.
    pub fn record(&mut self, account_id: &str, category: &str, credits: Decimal) {
        self.accounts
            .entry(account_id.to_string())
            .or_default()
            .entry(category.to_string())
            .or_default()
            .add(ChargeEntry::new(1, credits));
    }

    /// Adds `other` into `self` entry by entry.
    pub fn merge(&mut self, other: PendingCharges) {
        for (account_id, categories) in other.accounts {
            let target = self.accounts.entry(account_id).or_default();
            for (category, entry) in categories {
                target.entry(category).or_default().add(entry);
            }
        }
    }

    pub fn get(&self, account_id: &str, category: &str) -> Option<ChargeEntry> {
        self.accounts.get(account_id)?.get(category).copied()
    }

    pub fn account_total(&self, account_id: &str) -> Decimal {
        self.accounts
            .get(account_id)
            .map(|c| c.values().map(|e| e.credits).sum())
            .unwrap_or_default()
    }

    pub fn total_credits(&self) -> Decimal {
        self.accounts
            .values()
            .flat_map(|c| c.values())
            .map(|e| e.credits)
            .sum()
    }

    pub fn total_requests(&self) -> u64 {
        self.accounts
            .values()
            .flat_map(|c| c.values())
            .map(|e| e.count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
