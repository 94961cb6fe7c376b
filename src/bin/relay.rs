//! Whisperline Relay Server
//!
//! A WebSocket message broker for Whisperline clients.
//! The server provides:
//! - Per-user inbox and receipt queues
//! - Group topics
//! - Zero-knowledge routing of direct messages (bodies stay encrypted)
//!
//! Usage:
//!   whisperline-relay [--port 8765] [--host 0.0.0.0]

use anyhow::Context;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};
use whisperline::broker::Broker;
use whisperline::protocol::Frame;

/// Whisperline Relay Server
#[derive(Parser)]
#[command(name = "whisperline-relay")]
#[command(about = "WebSocket message broker for Whisperline chat clients")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

/// Serve one WebSocket connection until either side closes it
async fn handle_connection(stream: TcpStream, addr: SocketAddr, broker: Arc<Broker>) {
    info!(%addr, "new connection");

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (id, mut outbox) = match broker.register() {
        Ok(registered) => registered,
        Err(e) => {
            warn!(%addr, error = %e, "connection refused");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => {
                            if broker.handle(id, frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%addr, error = %e, "invalid frame");
                            let reply = Frame::Error { message: "Invalid frame".to_string() };
                            if let Ok(json) = reply.to_json() {
                                let _ = write.send(Message::Text(json)).await;
                            }
                        }
                    },

                    Some(Ok(Message::Close(_))) | None => {
                        info!(%addr, "client disconnected");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }

                    Some(Err(e)) => {
                        error!(%addr, error = %e, "websocket error");
                        break;
                    }

                    _ => {}
                }
            }

            outbound = outbox.recv() => {
                match outbound {
                    Some(frame) => match frame.to_json() {
                        Ok(json) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!(%addr, error = %e, "write failed");
                                break;
                            }
                        }
                        Err(e) => warn!(%addr, error = %e, "could not encode frame"),
                    },
                    // The broker dropped this connection
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    broker.drop_connection(id);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("whisperline_relay=info,whisperline=info")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Whisperline relay listening on ws://{}", addr);

    let broker = Arc::new(Broker::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                tokio::spawn(handle_connection(stream, peer, Arc::clone(&broker)));
            }
            _ = tokio::signal::ctrl_c() => {
                info!(connections = broker.connection_count(), "shutting down");
                return Ok(());
            }
        }
    }
}
