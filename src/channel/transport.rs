//! Transport seam for the billing connection.
//!
//! The channel only needs connect, send, receive and close. Any
//! bidirectional message transport can back it by implementing
//! [`Connector`] and [`Connection`].

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use url::Url;

/// Close code the server uses to reject the presented credential.
pub const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_policy_violation(&self) -> bool {
        self.code == POLICY_VIOLATION
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    Closed(Option<CloseReason>),
    Error(TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Transport IO failed: {0}")]
    Io(String),

    #[error("Transport closed")]
    Closed,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &Url,
        credential: &SecretString,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send {
    /// Whether the underlying transport reports the open state.
    fn is_ready(&self) -> bool;

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel safe: the driver polls it inside
    /// `select!` alongside the outbound queue.
    async fn recv(&mut self) -> TransportEvent;

    async fn close(&mut self);
}
