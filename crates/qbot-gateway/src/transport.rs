//! Connection transport for the gateway session.
//!
//! The session is written against [`GatewayTransport`] so tests can drive it
//! with an in-process fake; [`WsTransport`] is the production implementation
//! over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use qbot_core::{Error, Result};

use crate::protocol::GatewayFrame;

/// What the reader saw.
#[derive(Debug)]
pub enum Inbound {
    Frame(GatewayFrame),
    /// Peer sent a close frame, or the stream ended (code 1006).
    Closed { code: u16, reason: String },
}

/// Typed frame transport for one gateway connection.
#[async_trait]
pub trait GatewayTransport: Send {
    async fn send(&mut self, frame: &GatewayFrame) -> Result<()>;

    /// Receive the next inbound frame or close notification.
    ///
    /// An unparsable frame at this level is a transport-grade failure and is
    /// returned as an error; the session treats it as a close.
    async fn recv(&mut self) -> Result<Inbound>;

    /// Send a close frame; best effort.
    async fn close(&mut self) -> Result<()>;
}

/// Opens a transport to a resolved gateway URL. Seam the supervisor uses so
/// tests can hand out in-process transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewayTransport>>;
}

/// Production connector: one `wss://` connection per call.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewayTransport>> {
        Ok(Box::new(WsTransport::connect(url).await?))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport over a `tokio-tungstenite` stream.
pub struct WsTransport {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

impl WsTransport {
    /// Connect to the given gateway URL (`wss://…?v=9&encoding=json`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;
        let (writer, reader) = ws.split();
        Ok(Self { writer, reader })
    }
}

#[async_trait]
impl GatewayTransport for WsTransport {
    async fn send(&mut self, frame: &GatewayFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.writer
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::Transport(format!("websocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Inbound> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: GatewayFrame = serde_json::from_str(&text)
                        .map_err(|e| Error::Transport(format!("unparsable frame: {e}")))?;
                    return Ok(Inbound::Frame(frame));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code.into(), f.reason.into_owned()))
                        .unwrap_or((1000, String::new()));
                    return Ok(Inbound::Closed { code, reason });
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                    // Ping/pong handled by tungstenite; binary skipped.
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return Err(Error::Transport(format!("websocket error: {e}")));
                }
                None => {
                    return Ok(Inbound::Closed {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: 1000.into(),
            reason: "closing".into(),
        };
        self.writer
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| Error::Transport(format!("websocket close failed: {e}")))
    }
}
