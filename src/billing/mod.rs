//! Local charge authorization and reconciliation with the billing server.
//!
//! ```rust,no_run
//! use billing_agent::{BillingConfig, BillingService, RequestAttribution};
//! use rust_decimal_macros::dec;
//!
//! # async fn example() -> Result<(), billing_agent::Error> {
//! let config = BillingConfig::builder()
//!     .endpoint("wss://billing.example.com/agent")
//!     .credential("agent-token")
//!     .allowed_origin("console.example.com")
//!     .price("search", dec!(5))
//!     .build()?;
//!
//! let service = BillingService::new(config);
//! service.connect().await;
//!
//! let request = RequestAttribution::new().with_authorization("Bearer sk_live_123");
//! if service.charge(&request, "search").is_allowed() {
//!     // forward the request
//! }
//!
//! service.terminate().await;
//! # Ok(())
//! # }
//! ```

pub mod ledger;
pub mod pricing;
pub mod sync;

pub use ledger::{ChargeEntry, PendingCharges};
pub use pricing::{PricingTable, PricingTableBuilder};
pub use sync::{SyncOutcome, SyncSkip, SyncStats};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::account::{Account, AccountRecord, AccountSnapshot};
use crate::channel::{Channel, ChannelConfig, ChannelStatus, Connector, MessageHandler};
use crate::config::BillingConfig;
use crate::origin::normalize_origin;
use crate::protocol::{ProtocolError, ServerMessage};

/// Attribution data read from an inbound gateway request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttribution {
    pub origin: Option<String>,
    pub authorization: Option<String>,
}

impl RequestAttribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        let (scheme, token) = self.authorization.as_deref()?.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountMatch {
    /// The request came from one of the service's own origins and is not charged.
    SelfOrigin,
    Account(String),
    Unresolved,
}

#[derive(Debug, Clone, Copy)]
pub enum ChargeSource<'a> {
    Account(&'a str),
    Request(&'a RequestAttribution),
}

impl<'a> From<&'a str> for ChargeSource<'a> {
    fn from(id: &'a str) -> Self {
        Self::Account(id)
    }
}

impl<'a> From<&'a String> for ChargeSource<'a> {
    fn from(id: &'a String) -> Self {
        Self::Account(id.as_str())
    }
}

impl<'a> From<&'a RequestAttribution> for ChargeSource<'a> {
    fn from(request: &'a RequestAttribution) -> Self {
        Self::Request(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownAccount,
    UnknownCategory,
    InsufficientBalance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// Self-originated request, allowed without a charge.
    Allowed,
    Charged { account_id: String, credits: Decimal },
    Denied(DenyReason),
}

impl ChargeOutcome {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Book {
    pub(crate) accounts: HashMap<String, Account>,
    pub(crate) pending: PendingCharges,
    pub(crate) accounts_loaded: bool,
}

impl Book {
    fn resolve(&self, self_origins: &HashSet<String>, request: &RequestAttribution) -> AccountMatch {
        let origin = request.origin.as_deref().map(normalize_origin);
        if origin.as_ref().is_some_and(|o| self_origins.contains(o)) {
            return AccountMatch::SelfOrigin;
        }

        if self.accounts_loaded
            && let Some(origin) = origin.as_deref().filter(|o| !o.is_empty())
            && let Some(account) = self.accounts.values().find(|a| a.matches_origin(origin))
        {
            return AccountMatch::Account(account.id().to_string());
        }

        if let Some(key) = request.bearer_token()
            && let Some(account) = self.accounts.values().find(|a| a.has_api_key(key))
        {
            return AccountMatch::Account(account.id().to_string());
        }

        AccountMatch::Unresolved
    }

    fn apply_records(&mut self, records: Vec<AccountRecord>) {
        for record in records {
            self.accounts
                .entry(record.id.clone())
                .and_modify(|account| account.update(&record))
                .or_insert_with(|| Account::from_record(&record));
        }
        self.accounts_loaded = true;
    }

    fn apply_balances(&mut self, balances: HashMap<String, Decimal>) {
        for (id, balance) in balances {
            match self.accounts.get_mut(&id) {
                Some(account) => {
                    account.set_balance(balance);
                }
                None => tracing::debug!(account_id = %id, "Balance update for unknown account"),
            }
        }
    }
}

/// The service's own origins, compared exactly after normalization.
/// Wildcards are not expanded here.
pub(crate) fn self_origin_set<I, S>(origins: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    origins
        .into_iter()
        .map(|o| normalize_origin(o.as_ref()))
        .filter(|o| !o.is_empty())
        .collect()
}

pub(crate) struct BillingState {
    book: Mutex<Book>,
    pricing: PricingTable,
    self_origins: HashSet<String>,
    sync_in_progress: AtomicBool,
    stats: Mutex<SyncStats>,
}

impl BillingState {
    pub(crate) fn new(pricing: PricingTable, self_origins: HashSet<String>) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            pricing,
            self_origins,
            sync_in_progress: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub(crate) fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn charge(&self, from: ChargeSource<'_>, category: &str) -> ChargeOutcome {
        let mut book = self.book();
        let account_id = match from {
            ChargeSource::Account(id) => id.to_string(),
            ChargeSource::Request(request) => match book.resolve(&self.self_origins, request) {
                AccountMatch::SelfOrigin => return ChargeOutcome::Allowed,
                AccountMatch::Account(id) => id,
                AccountMatch::Unresolved => {
                    return ChargeOutcome::Denied(DenyReason::UnknownAccount);
                }
            },
        };

        let Some(credits) = self.pricing.get(category) else {
            tracing::error!(%category, "No price configured for category");
            return ChargeOutcome::Denied(DenyReason::UnknownCategory);
        };

        let Some(account) = book.accounts.get_mut(&account_id) else {
            return ChargeOutcome::Denied(DenyReason::UnknownAccount);
        };
        if !account.try_charge(credits) {
            tracing::debug!(account_id = %account_id, %category, "Insufficient balance");
            return ChargeOutcome::Denied(DenyReason::InsufficientBalance);
        }
        book.pending.record(&account_id, category, credits);

        ChargeOutcome::Charged {
            account_id,
            credits,
        }
    }

    /// Unknown message kinds are logged and accepted.
    pub(crate) fn apply_message(&self, message: serde_json::Value) -> Result<(), ProtocolError> {
        match ServerMessage::parse(message)? {
            ServerMessage::AccountsUpdate(records) => {
                let count = records.len();
                self.book().apply_records(records);
                tracing::debug!(count, "Applied accounts update");
            }
            ServerMessage::BalanceUpdate(balances) => {
                self.book().apply_balances(balances);
            }
            ServerMessage::Unknown(kind) => {
                tracing::warn!(%kind, "Ignoring unknown message from billing server");
            }
        }
        Ok(())
    }

    pub(crate) fn handle_message(&self, message: serde_json::Value) {
        if let Err(e) = self.apply_message(message) {
            tracing::warn!(error = %e, "Dropping invalid message from billing server");
        }
    }
}

impl MessageHandler for BillingState {
    fn on_message(&self, message: serde_json::Value) {
        self.handle_message(message);
    }
}

struct SyncTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the account table, the pending ledger and the billing connection.
pub struct BillingService {
    state: Arc<BillingState>,
    channel: Channel,
    sync_interval: Duration,
    timer: tokio::sync::Mutex<Option<SyncTimer>>,
}

impl std::fmt::Debug for BillingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingService")
            .field("channel", &self.channel)
            .field("sync_interval", &self.sync_interval)
            .finish_non_exhaustive()
    }
}

impl BillingService {
    /// Connects over WebSocket to the configured endpoint.
    #[cfg(feature = "websocket")]
    pub fn new(config: BillingConfig) -> Self {
        Self::with_connector(config, Arc::new(crate::channel::WebSocketConnector::new()))
    }

    pub fn with_connector(config: BillingConfig, connector: Arc<dyn Connector>) -> Self {
        let channel_config: ChannelConfig = config.channel_config();
        tracing::debug!(
            endpoint = %config.endpoint,
            categories = config.pricing.len(),
            sync_interval_secs = config.sync_interval.as_secs(),
            "Billing service configured"
        );
        let state = Arc::new(BillingState::new(
            config.pricing,
            self_origin_set(&config.allowed_origins),
        ));
        let channel = Channel::new(channel_config, connector, state.clone());
        Self {
            state,
            channel,
            sync_interval: config.sync_interval,
            timer: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the channel and starts the sync timer. Calling it again while
    /// running has no effect.
    pub async fn connect(&self) {
        self.channel.connect().await;

        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sync_timer(
            Arc::clone(&self.state),
            self.channel.clone(),
            self.sync_interval,
            cancel.clone(),
        ));
        *timer = Some(SyncTimer { cancel, task });
    }

    /// Stops the sync timer and closes the channel. No tick runs after this
    /// returns.
    pub async fn terminate(&self) {
        let timer = self.timer.lock().await.take();
        if let Some(timer) = &timer {
            timer.cancel.cancel();
        }
        self.channel.close().await;
        if let Some(timer) = timer
            && let Err(e) = timer.task.await
        {
            tracing::error!(error = %e, "Sync timer panicked");
        }
    }

    pub fn match_account(&self, request: &RequestAttribution) -> AccountMatch {
        self.state.book().resolve(&self.state.self_origins, request)
    }

    /// Authorizes one request in `category` and records the charge.
    pub fn charge<'a>(&self, from: impl Into<ChargeSource<'a>>, category: &str) -> ChargeOutcome {
        self.state.charge(from.into(), category)
    }

    /// Applies one inbound server message, as if it had arrived on the
    /// channel.
    pub fn on_message(&self, message: serde_json::Value) -> crate::Result<()> {
        self.state.apply_message(message)?;
        Ok(())
    }

    /// Ok while connected. Otherwise reports the fault that stopped the
    /// channel, or [`Error::NotConnected`](crate::Error::NotConnected) if
    /// it is only between attempts.
    pub fn check_connection(&self) -> crate::Result<()> {
        if self.channel.is_connected() {
            return Ok(());
        }
        match self.channel.fault() {
            Some(fault) => Err(fault.into()),
            None => Err(crate::Error::NotConnected),
        }
    }

    /// Runs one sync attempt now, sharing the in-flight guard with the timer.
    pub async fn sync_now(&self) -> SyncOutcome {
        sync::sync_charges(&self.state, &self.channel).await
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.state.stats()
    }

    pub fn account(&self, id: &str) -> Option<AccountSnapshot> {
        self.state.book().accounts.get(id).map(Account::snapshot)
    }

    pub fn accounts_loaded(&self) -> bool {
        self.state.book().accounts_loaded
    }

    pub fn pending_charges(&self) -> PendingCharges {
        self.state.book().pending.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.channel.subscribe()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

async fn run_sync_timer(
    state: Arc<BillingState>,
    channel: Channel,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut attempts = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        while attempts.try_join_next().is_some() {}

        let state = Arc::clone(&state);
        let channel = channel.clone();
        attempts.spawn(async move { sync::sync_charges(&state, &channel).await });
    }
    while attempts.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn state() -> BillingState {
        let pricing = PricingTable::builder()
            .price("search", dec!(5))
            .price("free", Decimal::ZERO)
            .build()
            .unwrap();
        let state = BillingState::new(pricing, self_origin_set(["console.billing.io"]));
        state.handle_message(json!({
            "type": "accounts-update",
            "data": [
                { "id": "acme", "balance": 100, "apiKeys": ["key-acme"], "origins": ["*.acme.com"] },
                { "id": "globex", "balance": 10, "apiKeys": ["key-globex"], "origins": ["app.globex.io"] }
            ]
        }));
        state
    }

    #[test]
    fn test_bearer_token_parsing() {
        let request = RequestAttribution::new().with_authorization("Bearer abc123");
        assert_eq!(request.bearer_token(), Some("abc123"));
        let request = RequestAttribution::new().with_authorization("bearer   xyz ");
        assert_eq!(request.bearer_token(), Some("xyz"));
        let request = RequestAttribution::new().with_authorization("Basic abc");
        assert_eq!(request.bearer_token(), None);
        let request = RequestAttribution::new().with_authorization("Bearer ");
        assert_eq!(request.bearer_token(), None);
        assert_eq!(RequestAttribution::new().bearer_token(), None);
    }

    #[test]
    fn test_resolution_order() {
        let state = state();
        let book = state.book();
        let own = &state.self_origins;

        let request = RequestAttribution::new().with_origin("https://console.billing.io");
        assert_eq!(book.resolve(own, &request), AccountMatch::SelfOrigin);

        let request = RequestAttribution::new()
            .with_origin("https://Shop.Acme.com")
            .with_authorization("Bearer key-globex");
        assert_eq!(book.resolve(own, &request), AccountMatch::Account("acme".into()));

        let request = RequestAttribution::new()
            .with_origin("https://unknown.net")
            .with_authorization("Bearer key-globex");
        assert_eq!(book.resolve(own, &request), AccountMatch::Account("globex".into()));

        let request = RequestAttribution::new().with_authorization("Bearer nope");
        assert_eq!(book.resolve(own, &request), AccountMatch::Unresolved);
        assert_eq!(
            book.resolve(own, &RequestAttribution::new()),
            AccountMatch::Unresolved
        );
    }

    #[test]
    fn test_self_origin_requires_exact_match() {
        let own = self_origin_set(["https://Console.Billing.io", "*.billing.io", ""]);
        assert_eq!(own.len(), 2);
        let book = Book::default();

        let request = RequestAttribution::new().with_origin("console.billing.io");
        assert_eq!(book.resolve(&own, &request), AccountMatch::SelfOrigin);

        for origin in ["https://eu.console.billing.io", "https://api.billing.io", "billing.io"] {
            let request = RequestAttribution::new().with_origin(origin);
            assert_eq!(book.resolve(&own, &request), AccountMatch::Unresolved, "{origin}");
        }
    }

    #[test]
    fn test_origin_resolution_requires_loaded_accounts() {
        let pricing = PricingTable::builder().build().unwrap();
        let state = BillingState::new(pricing, HashSet::new());
        let request = RequestAttribution::new().with_origin("https://shop.acme.com");
        assert_eq!(
            state.book().resolve(&state.self_origins, &request),
            AccountMatch::Unresolved
        );
    }

    #[test]
    fn test_charge_by_id_records_pending() {
        let state = state();
        let outcome = state.charge(ChargeSource::Account("acme"), "search");
        assert_eq!(
            outcome,
            ChargeOutcome::Charged {
                account_id: "acme".into(),
                credits: dec!(5)
            }
        );
        let book = state.book();
        assert_eq!(book.pending.get("acme", "search"), Some(ChargeEntry::new(1, dec!(5))));
        assert_eq!(book.accounts["acme"].charged(), dec!(5));
    }

    #[test]
    fn test_self_origin_is_not_charged() {
        let state = state();
        let request = RequestAttribution::new().with_origin("http://console.billing.io");
        let outcome = state.charge(ChargeSource::Request(&request), "search");
        assert_eq!(outcome, ChargeOutcome::Allowed);
        assert!(outcome.is_allowed());
        assert!(state.book().pending.is_empty());
    }

    #[test]
    fn test_denials() {
        let state = state();
        assert_eq!(
            state.charge(ChargeSource::Account("missing"), "search"),
            ChargeOutcome::Denied(DenyReason::UnknownAccount)
        );
        assert_eq!(
            state.charge(ChargeSource::Account("acme"), "teleport"),
            ChargeOutcome::Denied(DenyReason::UnknownCategory)
        );

        assert!(state.charge(ChargeSource::Account("globex"), "search").is_allowed());
        assert!(state.charge(ChargeSource::Account("globex"), "search").is_allowed());
        assert_eq!(
            state.charge(ChargeSource::Account("globex"), "search"),
            ChargeOutcome::Denied(DenyReason::InsufficientBalance)
        );
        assert_eq!(state.book().pending.get("globex", "search"), Some(ChargeEntry::new(2, dec!(10))));
    }

    #[test]
    fn test_zero_price_counts_requests() {
        let state = state();
        state.charge(ChargeSource::Account("acme"), "free");
        state.charge(ChargeSource::Account("acme"), "free");
        let book = state.book();
        assert_eq!(book.pending.get("acme", "free"), Some(ChargeEntry::new(2, Decimal::ZERO)));
        assert_eq!(book.accounts["acme"].charged(), Decimal::ZERO);
    }

    #[test]
    fn test_accounts_update_refreshes_in_place() {
        let state = state();
        state.charge(ChargeSource::Account("acme"), "search");
        state.handle_message(json!({
            "type": "accounts-update",
            "data": [{ "id": "acme", "balance": 40, "unexpected": true }]
        }));

        let book = state.book();
        let acme = &book.accounts["acme"];
        assert_eq!(acme.balance(), dec!(40));
        assert_eq!(acme.charged(), dec!(5));
        assert!(acme.has_api_key("key-acme"));
    }

    #[test]
    fn test_balance_update_keeps_charged() {
        let state = state();
        state.charge(ChargeSource::Account("acme"), "search");
        state.handle_message(json!({
            "type": "balance-update",
            "data": { "acme": 70, "ghost": 5 }
        }));

        let book = state.book();
        assert_eq!(book.accounts["acme"].balance(), dec!(70));
        assert_eq!(book.accounts["acme"].charged(), dec!(5));
        assert!(!book.accounts.contains_key("ghost"));
    }

    #[test]
    fn test_unknown_and_invalid_messages_are_ignored() {
        let state = state();
        state.handle_message(json!({ "type": "ping" }));
        state.handle_message(json!({ "type": "balance-update", "data": [1, 2] }));
        state.handle_message(json!("just a string"));
        assert_eq!(state.book().accounts.len(), 2);
    }
}
