//! WebSocket link to a relay broker
//!
//! Frames travel as JSON text messages. The socket is split so the
//! transport driver can read and write concurrently.

use super::{Connector, FrameSink, FrameSource, Link, TransportError, TransportResult};
use crate::protocol::Frame;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket links to a broker URL
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Connector for `url` (`ws://` or `wss://`)
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Broker URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> TransportResult<Link> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(url = %self.url, "websocket open");

        let (write, read) = ws.split();
        Ok(Link {
            sink: Box::new(WebSocketSink { write }),
            source: Box::new(WebSocketSource { read }),
        })
    }
}

struct WebSocketSink {
    write: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        let json = frame
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.write
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

struct WebSocketSource {
    read: SplitStream<Socket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(
                        Frame::from_json(&text).map_err(|e| TransportError::InvalidData(e.to_string())),
                    );
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
                // Pings are answered by tungstenite on the next write
                _ => continue,
            }
        }
    }
}
