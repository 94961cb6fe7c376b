//! In-process link to a [`Broker`]
//!
//! Used by tests and demos; behaves like a WebSocket link, including
//! connection loss when the broker kicks the connection or goes offline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, FrameSink, FrameSource, Link, TransportError, TransportResult};
use crate::broker::{Broker, ConnectionId};
use crate::protocol::Frame;

/// Opens links to an in-process broker
#[derive(Clone)]
pub struct MemoryConnector {
    broker: Arc<Broker>,
}

impl MemoryConnector {
    /// Connector for `broker`
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> TransportResult<Link> {
        let (id, outbox) = self
            .broker
            .register()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Link {
            sink: Box::new(MemorySink {
                broker: Arc::clone(&self.broker),
                id,
            }),
            source: Box::new(MemorySource { outbox }),
        })
    }
}

struct MemorySink {
    broker: Arc<Broker>,
    id: ConnectionId,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        self.broker
            .handle(self.id, frame)
            .map_err(|_| TransportError::Disconnected)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.broker.drop_connection(self.id);
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.broker.drop_connection(self.id);
    }
}

struct MemorySource {
    outbox: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
        self.outbox.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_handshake() {
        let broker = Arc::new(Broker::new());
        let mut link = MemoryConnector::new(Arc::clone(&broker)).open().await.unwrap();

        link.sink.send(Frame::Connect { identity: "alice".into() }).await.unwrap();
        assert_eq!(
            link.source.next_frame().await.unwrap().unwrap(),
            Frame::Connected { identity: "alice".into() }
        );
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_link_close() {
        let broker = Arc::new(Broker::new());
        let mut link = MemoryConnector::new(Arc::clone(&broker)).open().await.unwrap();

        link.sink.close().await.unwrap();
        assert_eq!(broker.connection_count(), 0);
        assert!(link.source.next_frame().await.is_none());
        assert!(link.sink.send(Frame::Ping).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_link_unregisters() {
        let broker = Arc::new(Broker::new());
        let link = MemoryConnector::new(Arc::clone(&broker)).open().await.unwrap();
        drop(link);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_links() {
        let broker = Arc::new(Broker::new());
        broker.set_offline(true);
        assert!(matches!(
            MemoryConnector::new(broker).open().await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
