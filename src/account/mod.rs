//! Per-customer credit balances.
//!
//! `balance` is the last value the billing server reported. `charged` is
//! what has been charged locally since the last sync and is not yet
//! reflected in `balance`. A charge is admitted only while
//! `balance - charged` covers it.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::origin::OriginMatcher;

/// Inbound account fields accepted from an `accounts-update` message.
///
/// Only the fields named here are applied; anything else in the payload
/// is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
}

impl AccountRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn with_api_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    id: String,
    api_keys: HashSet<String>,
    origins: OriginMatcher,
    balance: Decimal,
    charged: Decimal,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_keys: HashSet::new(),
            origins: OriginMatcher::default(),
            balance: Decimal::ZERO,
            charged: Decimal::ZERO,
        }
    }

    pub fn from_record(record: &AccountRecord) -> Self {
        let mut account = Self::new(record.id.clone());
        account.update(record);
        account
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn charged(&self) -> Decimal {
        self.charged
    }

    pub fn available(&self) -> Decimal {
        self.balance - self.charged
    }

    pub fn has_api_key(&self, key: &str) -> bool {
        self.api_keys.contains(key)
    }

    pub fn matches_origin(&self, origin: &str) -> bool {
        self.origins.matches(origin)
    }

    /// Admits the charge only if the available balance covers it.
    pub fn try_charge(&mut self, amount: Decimal) -> bool {
        debug_assert!(!amount.is_sign_negative(), "charge amount must be non-negative");
        if self.available() < amount {
            return false;
        }
        self.charged += amount;
        true
    }

    /// Applies the allow-listed fields present in `record`. The id is immutable.
    pub fn update(&mut self, record: &AccountRecord) {
        if let Some(keys) = &record.api_keys {
            self.api_keys = keys.iter().cloned().collect();
        }
        if let Some(origins) = &record.origins {
            self.origins = OriginMatcher::new(origins);
        }
        if let Some(balance) = record.balance {
            self.set_balance(balance);
        }
    }

    /// Overwrites the server balance. Negative values are refused.
    pub fn set_balance(&mut self, balance: Decimal) -> bool {
        if balance.is_sign_negative() && !balance.is_zero() {
            tracing::warn!(account_id = %self.id, %balance, "Ignoring negative balance from server");
            return false;
        }
        self.balance = balance;
        true
    }

    /// Returns the unsynced charge total and resets it to zero.
    pub(crate) fn take_charged(&mut self) -> Decimal {
        std::mem::take(&mut self.charged)
    }

    /// Adds back a previously taken charge total.
    pub(crate) fn restore_charged(&mut self, amount: Decimal) {
        self.charged += amount;
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            id: self.id.clone(),
            balance: self.balance,
            charged: self.charged,
            available: self.available(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub balance: Decimal,
    pub charged: Decimal,
    pub available: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn funded(balance: Decimal) -> Account {
        Account::from_record(&AccountRecord::new("acct-1").with_balance(balance))
    }

    #[test]
    fn test_charge_exact_available_succeeds() {
        let mut account = funded(dec!(10));
        assert!(account.try_charge(dec!(4)));
        assert!(account.try_charge(dec!(6)));
        assert_eq!(account.available(), Decimal::ZERO);
        assert_eq!(account.charged(), dec!(10));
    }

    #[test]
    fn test_charge_over_available_leaves_state_unchanged() {
        let mut account = funded(dec!(10));
        assert!(account.try_charge(dec!(7)));
        assert!(!account.try_charge(dec!(3.000001)));
        assert_eq!(account.charged(), dec!(7));
        assert_eq!(account.balance(), dec!(10));
    }

    #[test]
    fn test_zero_charge_on_empty_account() {
        let mut account = Account::new("empty");
        assert!(account.try_charge(Decimal::ZERO));
        assert!(!account.try_charge(dec!(0.01)));
    }

    #[test]
    fn test_update_applies_only_present_fields() {
        let mut account = Account::from_record(
            &AccountRecord::new("acct-1")
                .with_balance(dec!(50))
                .with_api_keys(["key-a"])
                .with_origins(["*.shop.io"]),
        );

        account.update(&AccountRecord::new("acct-1").with_balance(dec!(80)));
        assert_eq!(account.balance(), dec!(80));
        assert!(account.has_api_key("key-a"));
        assert!(account.matches_origin("www.shop.io"));

        account.update(&AccountRecord::new("acct-1").with_api_keys(["key-b"]));
        assert!(!account.has_api_key("key-a"));
        assert!(account.has_api_key("key-b"));
    }

    #[test]
    fn test_negative_balance_rejected() {
        let mut account = funded(dec!(5));
        assert!(!account.set_balance(dec!(-1)));
        assert_eq!(account.balance(), dec!(5));
    }

    #[test]
    fn test_record_ignores_unknown_fields() {
        let record: AccountRecord = serde_json::from_value(serde_json::json!({
            "id": "acct-9",
            "balance": 12.5,
            "apiKeys": ["k"],
            "plan": "enterprise",
            "closed": false
        }))
        .unwrap();
        assert_eq!(record.balance, Some(dec!(12.5)));
        assert_eq!(record.api_keys, Some(vec!["k".to_string()]));
        assert_eq!(record.origins, None);
    }

    #[test]
    fn test_take_and_restore_charged() {
        let mut account = funded(dec!(20));
        account.try_charge(dec!(8));
        let taken = account.take_charged();
        assert_eq!(taken, dec!(8));
        assert_eq!(account.charged(), Decimal::ZERO);

        account.try_charge(dec!(2));
        account.restore_charged(taken);
        assert_eq!(account.charged(), dec!(10));
    }

    proptest! {
        #[test]
        fn prop_charged_never_exceeds_balance(
            balance in 0u32..1_000,
            amounts in proptest::collection::vec(0u32..200, 0..64),
        ) {
            let mut account = funded(Decimal::from(balance));
            for amount in amounts {
                let before = account.charged();
                let amount = Decimal::from(amount);
                if account.try_charge(amount) {
                    prop_assert_eq!(account.charged(), before + amount);
                } else {
                    prop_assert_eq!(account.charged(), before);
                }
                prop_assert!(account.charged() <= account.balance());
                prop_assert!(!account.available().is_sign_negative() || account.available().is_zero());
            }
        }
    }
}
