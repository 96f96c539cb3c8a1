//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! The credential is presented as `Authorization: Bearer <token>` on the
//! upgrade request. An upgrade refused with 401/403 is reported as
//! [`TransportError::Rejected`]. `http`/`https` endpoints are dialed as
//! `ws`/`wss`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::transport::{CloseReason, Connection, Connector, Frame, TransportError, TransportEvent};

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &Url,
        credential: &SecretString,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = websocket_url(endpoint)?
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose_secret()))
            .map_err(|e| TransportError::Handshake(format!("invalid credential header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_handshake_error)?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

fn websocket_url(endpoint: &Url) -> Result<Url, TransportError> {
    let scheme = match endpoint.scheme() {
        "ws" | "wss" => return Ok(endpoint.clone()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::Handshake(format!(
                "unsupported endpoint scheme '{}'",
                other
            )));
        }
    };
    let mut url = endpoint.clone();
    url.set_scheme(scheme).map_err(|()| {
        TransportError::Handshake(format!("cannot dial {} over WebSocket", endpoint))
    })?;
    Ok(url)
}

fn map_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            TransportError::Rejected(format!("HTTP {}", response.status()))
        }
        other => TransportError::Handshake(other.to_string()),
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn is_ready(&self) -> bool {
        // connect_async only resolves after the upgrade completes
        true
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Frame(Frame::Binary(bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    return TransportEvent::Closed(
                        frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.into_owned())),
                    );
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return TransportEvent::Error(TransportError::Io(e.to_string())),
                None => return TransportEvent::Closed(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}
