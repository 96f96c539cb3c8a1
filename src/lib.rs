//! # billing-agent
//!
//! Embedded metering agent for API gateways.
//!
//! The agent keeps a local copy of every customer account pushed by the
//! billing server, authorizes each inbound request against the account's
//! remaining credits without a network round trip, and periodically sends
//! the accumulated charges back over a persistent connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use billing_agent::{BillingConfig, BillingService, RequestAttribution};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), billing_agent::Error> {
//!     let service = BillingService::new(BillingConfig::from_env()?);
//!     service.connect().await;
//!
//!     let request = RequestAttribution::new()
//!         .with_origin("https://shop.customer.com")
//!         .with_authorization("Bearer sk_live_123");
//!     let outcome = service.charge(&request, "search");
//!     println!("allowed: {}", outcome.is_allowed());
//!
//!     service.terminate().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod account;
pub mod billing;
pub mod channel;
pub mod config;
pub mod origin;
pub mod prelude;
pub mod protocol;

// Re-exports for convenience
pub use account::{Account, AccountRecord, AccountSnapshot};
pub use billing::{
    AccountMatch, BillingService, ChargeEntry, ChargeOutcome, ChargeSource, DenyReason,
    PendingCharges, PricingTable, PricingTableBuilder, RequestAttribution, SyncOutcome, SyncSkip,
    SyncStats,
};
#[cfg(feature = "websocket")]
pub use channel::WebSocketConnector;
pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelFault, ChannelStatus, Connection, Connector,
    MessageHandler, memory_transport,
};
pub use config::{BillingConfig, BillingConfigBuilder, ConfigError, ConfigResult};
pub use origin::{OriginMatcher, normalize_origin};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Error type for billing-agent operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The billing server refused the agent credential.
    #[error("Credential rejected: {reason}")]
    CredentialRejected { reason: String },

    /// No open connection to the billing server.
    #[error("Not connected to billing server")]
    NotConnected,

    /// Connection-level failure that may clear on reconnect.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound message could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration or setup errors, fixed by changing the configuration
    Configuration,
    /// Connection errors that may succeed after reconnect
    Transient,
    /// The billing server refused the agent
    Rejected,
    /// Internal errors (JSON, unexpected payloads)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Configuration,
            Error::NotConnected | Error::Transport(_) => ErrorCategory::Transient,
            Error::CredentialRejected { .. } => ErrorCategory::Rejected,
            Error::Protocol(_) | Error::Json(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::Serialization(e) => Error::Json(e),
            other => Error::Config(other.to_string()),
        }
    }
}

impl From<channel::ChannelError> for Error {
    fn from(err: channel::ChannelError) -> Self {
        match err {
            channel::ChannelError::NotConnected | channel::ChannelError::Closed => {
                Error::NotConnected
            }
            channel::ChannelError::Transport(channel::TransportError::Rejected(reason)) => {
                Error::CredentialRejected { reason }
            }
            channel::ChannelError::Transport(e) => Error::Transport(e.to_string()),
            channel::ChannelError::Json(e) => Error::Json(e),
        }
    }
}

impl From<channel::ChannelFault> for Error {
    fn from(fault: channel::ChannelFault) -> Self {
        match fault {
            channel::ChannelFault::CredentialRejected { reason } => {
                Error::CredentialRejected { reason }
            }
            channel::ChannelFault::TransportNotReady => {
                Error::Transport("transport opened in an unexpected state".into())
            }
        }
    }
}

impl From<protocol::ProtocolError> for Error {
    fn from(err: protocol::ProtocolError) -> Self {
        match err {
            protocol::ProtocolError::Malformed(e) => Error::Json(e),
            other => Error::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
