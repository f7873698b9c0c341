//! Signaling channel adapters
//!
//! A channel carries whole [`SignalingEnvelope`]s to and from the relay. The
//! relay itself is opaque: it is expected to rebroadcast every message to the
//! other connected clients.

use crate::config::MeshConfig;
use crate::error::ChannelError;
use crate::protocol::SignalingEnvelope;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

/// Duplex message channel to the relay
#[async_trait]
pub trait SignalingChannel: Send {
    async fn send(&mut self, envelope: &SignalingEnvelope) -> Result<(), ChannelError>;

    /// Next envelope from the relay. Must be cancel-safe: dropping the
    /// returned future loses no message.
    async fn recv(&mut self) -> Result<SignalingEnvelope, ChannelError>;
}

/// WebSocket connection to the relay, one JSON envelope per text frame
pub struct WebSocketChannel<S = MaybeTlsStream<TcpStream>> {
    stream: WebSocketStream<S>,
}

impl WebSocketChannel {
    /// Connect to a relay endpoint such as `ws://host:8888/ws`
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))?;
        info!("Connected to relay {}", url);
        Ok(Self { stream })
    }

    /// Connect to the relay named by [`MeshConfig::relay_url`]
    pub async fn from_config(config: &MeshConfig) -> Result<Self, ChannelError> {
        Self::connect(&config.relay_url).await
    }
}

impl<S> WebSocketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already negotiated WebSocket stream
    pub fn from_stream(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.stream.close(None).await.map_err(map_ws_error)
    }
}

#[async_trait]
impl<S> SignalingChannel for WebSocketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &SignalingEnvelope) -> Result<(), ChannelError> {
        let text = envelope.to_json()?;
        self.stream.send(Message::text(text)).await.map_err(map_ws_error)
    }

    async fn recv(&mut self) -> Result<SignalingEnvelope, ChannelError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().parse(),
                Some(Ok(Message::Binary(data))) => {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| ChannelError::WebSocket(e.to_string()))?;
                    return text.parse();
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay sent close frame: {:?}", frame);
                    return Err(ChannelError::Close);
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Err(ChannelError::Close),
            }
        }
    }
}

fn map_ws_error(err: WsError) -> ChannelError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Close,
        other => ChannelError::WebSocket(other.to_string()),
    }
}
