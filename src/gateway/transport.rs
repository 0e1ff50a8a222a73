use crate::error::{Result, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Raw payload delivered by the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Observable socket events; `open` is implied by a successful connect.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(Payload),
    Closed { code: u16, reason: String },
}

/// Emission and read primitives the session engine needs from a socket.
///
/// The production implementation wraps `tokio-tungstenite`; tests drive the
/// engine through scripted implementations.
pub trait GatewaySocket: Send {
    /// Next event; `None` once the stream is exhausted (EOF).
    fn recv(&mut self) -> impl Future<Output = Result<Option<SocketEvent>>> + Send;
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;
    fn send_binary(&mut self, bytes: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
    /// Graceful teardown: send a close frame and let the handshake finish.
    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = Result<()>> + Send;
    /// Impolite teardown: drop the connection without a close handshake.
    fn abort(&mut self);
}

/// Dials a gateway URL and yields a connected socket.
pub trait Connector: Send + Sync {
    type Socket: GatewaySocket;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Socket>> + Send;
}

/// WebSocket over TCP, with TLS for `wss` established before the handshake.
///
/// The stream slot empties on [`GatewaySocket::abort`]; dropping the stream
/// tears the TCP connection down without a websocket close frame.
pub struct WsSocket {
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl GatewaySocket for WsSocket {
    async fn recv(&mut self) -> Result<Option<SocketEvent>> {
        let Some(ws) = self.ws.as_mut() else {
            return Ok(None);
        };
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return Ok(Some(SocketEvent::Message(Payload::Text(text))));
                }
                Ok(Message::Binary(data)) => {
                    return Ok(Some(SocketEvent::Message(Payload::Binary(data))));
                }
                Ok(Message::Close(close)) => {
                    let (code, reason) = match close {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (1005, String::new()),
                    };
                    return Ok(Some(SocketEvent::Closed { code, reason }));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Err(TransportError::WebSocket(e.to_string()).into()),
            }
        }
        Ok(None)
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let Some(ws) = self.ws.as_mut() else {
            return Err(TransportError::Other("socket aborted".to_owned()).into());
        };
        ws.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()).into())
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        let Some(ws) = self.ws.as_mut() else {
            return Err(TransportError::Other("socket aborted".to_owned()).into());
        };
        ws.send(Message::Binary(bytes))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()).into())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let Some(ws) = self.ws.as_mut() else {
            return Ok(());
        };
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_owned().into(),
        };
        // Closing an already-dead socket is not an error worth surfacing.
        if let Err(e) = ws.close(Some(frame)).await {
            debug!(code, "close on finished socket: {e}");
        }
        Ok(())
    }

    fn abort(&mut self) {
        if self.ws.take().is_some() {
            debug!("socket aborted without close handshake");
        }
    }
}

/// Default connector: `ws`/`wss` only, TLS 1.2+ through the native-tls
/// backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnector;

impl Connector for TlsConnector {
    type Socket = WsSocket;

    async fn connect(&self, url: &Url) -> Result<WsSocket> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::Scheme(other.to_owned()).into()),
        }
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!(%url, "websocket connected");
        Ok(WsSocket { ws: Some(ws) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let url = Url::parse("https://gateway.accord.chat").expect("url");
        match TlsConnector.connect(&url).await {
            Err(crate::error::Error::Transport(TransportError::Scheme(scheme))) => {
                assert_eq!(scheme, "https");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
