//! Persistent connection to the billing server.
//!
//! A [`Channel`] owns at most one live transport at a time. A supervisor
//! task opens the transport, drives it until it closes, and reconnects
//! after a fixed delay. The status only becomes
//! [`ChannelStatus::Connected`] once the first valid inbound message has
//! been handled, so a transport that opens but never speaks stays
//! disconnected.
//!
//! Reconnect rules:
//!
//! - close with [`POLICY_VIOLATION`]: credential rejected, never reconnect
//! - any other close: reconnect if auto-reconnect is still enabled
//! - transport error: always reconnect
//! - [`Channel::close`]: cancels the supervisor, including a pending
//!   reconnect

pub mod memory;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnector, MemoryPeer, MemoryServer, memory_transport};
pub use transport::{
    CloseReason, Connection, Connector, Frame, POLICY_VIOLATION, TransportError, TransportEvent,
};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const OUTBOUND_QUEUE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Disconnected,
    Connected,
}

/// Conditions that stop the channel from reconnecting on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelFault {
    CredentialRejected { reason: String },
    TransportNotReady,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Channel closed before the send completed")]
    Closed,

    #[error("Send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receives every inbound JSON document in arrival order.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: serde_json::Value);
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub credential: SecretString,
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(endpoint: Url, credential: SecretString) -> Self {
        Self {
            endpoint,
            credential,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

struct Outbound {
    frame: Frame,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reconnect {
    Stop,
    IfEnabled,
    Always,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    status: watch::Sender<ChannelStatus>,
    auto_reconnect: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    fault: Mutex<Option<ChannelFault>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.inner.config.endpoint.as_str())
            .field("status", &self.status())
            .field("auto_reconnect", &self.auto_reconnect())
            .finish()
    }
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                handler,
                status,
                auto_reconnect: AtomicBool::new(false),
                outbound: Mutex::new(None),
                fault: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn fault(&self) -> Option<ChannelFault> {
        self.inner
            .fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Starts the connection supervisor. No-op while one is already running.
    pub async fn connect(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);
        if lifecycle.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        *self.inner.fault.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).supervise(cancel.clone()));
        lifecycle.cancel = Some(cancel);
        lifecycle.task = Some(task);
    }

    /// Stops the supervisor and closes the transport. Returns once no
    /// further reconnect can happen.
    pub async fn close(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        let (cancel, task) = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            (lifecycle.cancel.take(), lifecycle.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Billing connection supervisor panicked");
        }
        self.inner.mark_disconnected();
    }

    /// Sends one JSON message. Fails with [`ChannelError::NotConnected`]
    /// instead of queueing when there is no live connection.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let sender = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        let frame = Frame::Text(serde_json::to_string(message)?);
        let (reply, response) = oneshot::channel();
        sender
            .send(Outbound { frame, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;
        response.await.map_err(|_| ChannelError::Closed)??;
        Ok(())
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect(&self.config.endpoint, &self.config.credential) => result,
            };

            let next = match opened {
                Ok(connection) => self.run_connection(connection, &cancel).await,
                Err(TransportError::Rejected(reason)) => {
                    self.reject_credential(reason);
                    Reconnect::Stop
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to open billing connection");
                    Reconnect::Always
                }
            };
            self.mark_disconnected();

            let retry = match next {
                Reconnect::Stop => false,
                Reconnect::IfEnabled => self.auto_reconnect.load(Ordering::SeqCst),
                Reconnect::Always => true,
            };
            if !retry || cancel.is_cancelled() {
                break;
            }

            tracing::info!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Reconnecting to billing server"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.mark_disconnected();
    }

    async fn run_connection(
        &self,
        mut connection: Box<dyn Connection>,
        cancel: &CancellationToken,
    ) -> Reconnect {
        if !connection.is_ready() {
            tracing::error!(
                endpoint = %self.config.endpoint,
                "Billing transport opened in an unexpected state; giving up"
            );
            self.auto_reconnect.store(false, Ordering::SeqCst);
            self.set_fault(ChannelFault::TransportNotReady);
            connection.close().await;
            return Reconnect::Stop;
        }
        tracing::debug!(endpoint = %self.config.endpoint, "Billing transport open");

        let (sender, mut queue) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);

        let next = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    connection.close().await;
                    break Reconnect::Stop;
                }
                Some(outbound) = queue.recv() => {
                    let result = tokio::select! {
                        result = connection.send(outbound.frame) => result,
                        _ = cancel.cancelled() => Err(TransportError::Closed),
                    };
                    let _ = outbound.reply.send(result);
                }
                event = connection.recv() => match event {
                    TransportEvent::Frame(frame) => self.dispatch(frame),
                    TransportEvent::Closed(reason) => break self.on_close(reason),
                    TransportEvent::Error(e) => {
                        tracing::warn!(error = %e, "Billing transport error");
                        self.mark_disconnected();
                        connection.close().await;
                        break Reconnect::Always;
                    }
                },
            }
        };

        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        next
    }

    fn dispatch(&self, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => {
                tracing::warn!(len = bytes.len(), "Dropping non-text frame from billing server");
                return;
            }
        };
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(message) => {
                self.handler.on_message(message);
                self.set_status(ChannelStatus::Connected);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame from billing server");
            }
        }
    }

    fn on_close(&self, reason: Option<CloseReason>) -> Reconnect {
        match reason {
            Some(reason) if reason.is_policy_violation() => {
                self.reject_credential(reason.reason);
                Reconnect::Stop
            }
            reason => {
                tracing::debug!(
                    code = reason.as_ref().map(|r| r.code),
                    "Billing connection closed"
                );
                Reconnect::IfEnabled
            }
        }
    }

    fn reject_credential(&self, reason: String) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        tracing::error!(
            endpoint = %self.config.endpoint,
            %reason,
            "Billing server rejected the credential; reconnect disabled"
        );
        self.set_fault(ChannelFault::CredentialRejected { reason });
    }

    fn set_fault(&self, fault: ChannelFault) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(fault);
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn mark_disconnected(&self) {
        self.set_status(ChannelStatus::Disconnected);
    }
}
