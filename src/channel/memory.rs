//! In-process transport for tests and local development.
//!
//! [`memory_transport`] returns a connector for the [`Channel`](super::Channel)
//! and a [`MemoryServer`] that plays the billing server. Each connection
//! attempt shows up on the server as a [`MemoryPeer`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use url::Url;

use super::transport::{CloseReason, Connection, Connector, Frame, TransportError, TransportEvent};

#[derive(Default)]
struct Shared {
    attempts: AtomicUsize,
    not_ready: AtomicBool,
    connect_failure: Mutex<Option<TransportError>>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryConnector {
            peers: peers_tx,
            shared: Arc::clone(&shared),
        },
        MemoryServer {
            peers: peers_rx,
            shared,
        },
    )
}

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _endpoint: &Url,
        credential: &SecretString,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .shared
            .connect_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let reject_sends = Arc::new(AtomicBool::new(false));
        let hold_sends = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            events: events_tx,
            frames: frames_rx,
            reject_sends: Arc::clone(&reject_sends),
            hold_sends: Arc::clone(&hold_sends),
            credential: credential.expose_secret().to_string(),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Handshake("memory server dropped".into()))?;

        Ok(Box::new(MemoryConnection {
            events: events_rx,
            frames: frames_tx,
            reject_sends,
            hold_sends,
            ready: !self.shared.not_ready.load(Ordering::SeqCst),
        }))
    }
}

pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryServer {
    /// Waits for the next connection attempt.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Makes new connections report a transport that is not open.
    pub fn set_ready(&self, ready: bool) {
        self.shared.not_ready.store(!ready, Ordering::SeqCst);
    }

    /// Fails every connection attempt with `err` until cleared.
    pub fn fail_connects(&self, err: Option<TransportError>) {
        *self
            .shared
            .connect_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = err;
    }
}

/// Server side of one memory connection.
pub struct MemoryPeer {
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: mpsc::UnboundedReceiver<Frame>,
    reject_sends: Arc<AtomicBool>,
    hold_sends: Arc<AtomicBool>,
    credential: String,
}

impl MemoryPeer {
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Frame(Frame::Text(text.into())));
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Frame(Frame::Binary(bytes)));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(Some(CloseReason::new(code, reason))));
    }

    pub fn error(&self, message: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error(TransportError::Io(message.to_string())));
    }

    /// Makes the client's sends on this connection fail.
    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// Makes the client's next sends on this connection never complete.
    pub fn set_hold_sends(&self, hold: bool) {
        self.hold_sends.store(hold, Ordering::SeqCst);
    }

    /// Next frame the client sent, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }
}

struct MemoryConnection {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    frames: mpsc::UnboundedSender<Frame>,
    reject_sends: Arc<AtomicBool>,
    hold_sends: Arc<AtomicBool>,
    ready: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.hold_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io("send rejected by peer".into()));
        }
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(None))
    }

    async fn close(&mut self) {
        self.events.close();
    }
}
