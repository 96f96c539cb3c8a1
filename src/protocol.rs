//! Wire messages exchanged with the billing server.
//!
//! Every frame is a JSON document tagged by `type`:
//!
//! ```json
//! {"type": "charge", "data": {"acct_1": {"search": [3, 15]}}}
//! {"type": "accounts-update", "data": [{"id": "acct_1", "balance": 100}]}
//! {"type": "balance-update", "data": {"acct_1": 85}}
//! ```

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::AccountRecord;
use crate::billing::PendingCharges;

pub const CHARGE: &str = "charge";
pub const ACCOUNTS_UPDATE: &str = "accounts-update";
pub const BALANCE_UPDATE: &str = "balance-update";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage<'a> {
    Charge(&'a PendingCharges),
}

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AccountsUpdate(Vec<AccountRecord>),
    BalanceUpdate(HashMap<String, Decimal>),
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid payload for '{kind}': {message}")]
    InvalidPayload { kind: String, message: String },
}

impl ServerMessage {
    /// Decodes an inbound document. Malformed account records are dropped
    /// individually so one bad entry does not discard the batch.
    pub fn parse(value: serde_json::Value) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_value(value)?;
        match envelope.kind.as_str() {
            ACCOUNTS_UPDATE => {
                let serde_json::Value::Array(items) = envelope.data else {
                    return Err(ProtocolError::InvalidPayload {
                        kind: envelope.kind,
                        message: "expected an array of account records".into(),
                    });
                };
                let records = items
                    .into_iter()
                    .filter_map(|item| match serde_json::from_value::<AccountRecord>(item) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping malformed account record");
                            None
                        }
                    })
                    .collect();
                Ok(Self::AccountsUpdate(records))
            }
            BALANCE_UPDATE => serde_json::from_value(envelope.data)
                .map(Self::BalanceUpdate)
                .map_err(|e| ProtocolError::InvalidPayload {
                    kind: envelope.kind,
                    message: e.to_string(),
                }),
            _ => Ok(Self::Unknown(envelope.kind)),
        }
    }
}
