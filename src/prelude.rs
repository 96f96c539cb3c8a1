//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust
//! use billing_agent::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::Result;

// Service
pub use crate::BillingConfig;
pub use crate::BillingService;
pub use crate::RequestAttribution;
pub use crate::billing::{ChargeOutcome, DenyReason, SyncOutcome};

// Accounts
pub use crate::account::{AccountRecord, AccountSnapshot};
pub use crate::origin::OriginMatcher;

// Channel
pub use crate::channel::{ChannelStatus, Connection, Connector, MessageHandler};
