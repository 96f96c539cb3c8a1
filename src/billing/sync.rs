//! Batched reconciliation of pending charges.
//!
//! An attempt rotates the pending ledger and every account's `charged`
//! total out under the book lock, then sends the rotated snapshot. New
//! charges keep landing on the fresh state while the send is in flight.
//! If the send fails, the snapshot is added back on top of whatever
//! accrued in the meantime, so repeated failures never lose or duplicate
//! a charge.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{BillingState, PendingCharges};
use crate::channel::Channel;
use crate::protocol::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSkip {
    Disconnected,
    InProgress,
    AccountsNotLoaded,
    NothingPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Sent { requests: u64, credits: Decimal },
    Failed { error: String },
    Skipped(SyncSkip),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct SyncSnapshot {
    pub(crate) charges: PendingCharges,
    pub(crate) charged: Vec<(String, Decimal)>,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BillingState {
    /// Rotates pending charges and per-account `charged` totals out of the book.
    pub(crate) fn take_snapshot(&self) -> Result<SyncSnapshot, SyncSkip> {
        let mut book = self.book();
        if !book.accounts_loaded {
            return Err(SyncSkip::AccountsNotLoaded);
        }
        if book.pending.is_empty() {
            return Err(SyncSkip::NothingPending);
        }

        let charges = std::mem::take(&mut book.pending);
        let charged = book
            .accounts
            .values_mut()
            .filter_map(|account| {
                let amount = account.take_charged();
                (!amount.is_zero()).then(|| (account.id().to_string(), amount))
            })
            .collect();
        Ok(SyncSnapshot { charges, charged })
    }

    /// Adds an unsent snapshot back onto the live book.
    pub(crate) fn restore_snapshot(&self, snapshot: SyncSnapshot) {
        let mut book = self.book();
        book.pending.merge(snapshot.charges);
        for (id, amount) in snapshot.charged {
            match book.accounts.get_mut(&id) {
                Some(account) => account.restore_charged(amount),
                None => tracing::warn!(account_id = %id, %amount, "Account vanished during sync"),
            }
        }
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_outcome(&self, outcome: &SyncOutcome) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            SyncOutcome::Sent { .. } => {
                stats.sent += 1;
                stats.consecutive_failures = 0;
                stats.last_success_at = Some(Utc::now());
            }
            SyncOutcome::Failed { .. } => {
                stats.failed += 1;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                stats.last_failure_at = Some(Utc::now());
            }
            SyncOutcome::Skipped(_) => stats.skipped += 1,
        }
    }
}

pub(crate) async fn sync_charges(state: &BillingState, channel: &Channel) -> SyncOutcome {
    let outcome = attempt(state, channel).await;
    state.record_outcome(&outcome);
    outcome
}

async fn attempt(state: &BillingState, channel: &Channel) -> SyncOutcome {
    if !channel.is_connected() {
        return SyncOutcome::Skipped(SyncSkip::Disconnected);
    }
    let Some(_in_flight) = InFlight::acquire(&state.sync_in_progress) else {
        return SyncOutcome::Skipped(SyncSkip::InProgress);
    };
    let snapshot = match state.take_snapshot() {
        Ok(snapshot) => snapshot,
        Err(skip) => return SyncOutcome::Skipped(skip),
    };

    let requests = snapshot.charges.total_requests();
    let credits = snapshot.charges.total_credits();
    match channel.send(&ClientMessage::Charge(&snapshot.charges)).await {
        Ok(()) => {
            tracing::debug!(requests, %credits, "Synced pending charges");
            SyncOutcome::Sent { requests, credits }
        }
        Err(e) => {
            tracing::warn!(error = %e, requests, %credits, "Charge sync failed; keeping charges for retry");
            state.restore_snapshot(snapshot);
            SyncOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
