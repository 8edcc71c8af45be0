//! In-process loopback backend.
//!
//! `loopback(capacity)` returns a connector for a [`FlowTransport`](super::FlowTransport)
//! and a listener that yields the peer end of every connection made. Both
//! directions are bounded channels of `capacity` messages, so a peer that
//! stops reading produces real backpressure on the transport's writer.

use std::time::Duration;

use tokio::sync::mpsc;
use wamp_core::transport::BoxFuture;
use wamp_core::{Connector, FrameSink, FrameSource, Link, Message, WampError, WampResult};

/// Create a connector/listener pair.
pub fn loopback(capacity: usize) -> (LoopbackConnector, LoopbackListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        LoopbackConnector {
            capacity: capacity.max(1),
            accept_tx,
            refuse: false,
            delay: None,
        },
        LoopbackListener { rx: accept_rx },
    )
}

pub struct LoopbackConnector {
    capacity: usize,
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    refuse: bool,
    delay: Option<Duration>,
}

impl LoopbackConnector {
    /// Fail every connection attempt.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Wait `delay` before each connection attempt completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self) -> BoxFuture<'_, WampResult<Link>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.refuse {
                return Err(WampError::Connection("loopback connection refused".into()));
            }

            let (to_peer_tx, to_peer_rx) = mpsc::channel(self.capacity);
            let (to_client_tx, to_client_rx) = mpsc::channel(self.capacity);
            let peer = LoopbackPeer {
                tx: to_client_tx,
                rx: to_peer_rx,
            };
            self.accept_tx
                .send(peer)
                .map_err(|_| WampError::Connection("loopback listener is gone".into()))?;

            Ok(Link::new(
                LoopbackSink { tx: to_peer_tx },
                LoopbackSource { rx: to_client_rx },
            ))
        })
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

/// Yields the peer end of each loopback connection.
pub struct LoopbackListener {
    rx: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackListener {
    /// Wait for the next connection. `None` once the connector is dropped.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.rx.recv().await
    }
}

/// The remote end of a loopback connection, standing in for a router.
pub struct LoopbackPeer {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl LoopbackPeer {
    /// Send a message to the transport. Waits while the channel is full.
    pub async fn send(&self, message: Message) -> WampResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| WampError::Transport("loopback transport side is gone".into()))
    }

    /// Receive the next message from the transport; `None` once it closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Drop the connection, as a router going away would.
    pub fn close(self) {}
}

struct LoopbackSink {
    tx: mpsc::Sender<Message>,
}

impl FrameSink for LoopbackSink {
    fn send(&mut self, message: Message) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async move {
            self.tx
                .send(message)
                .await
                .map_err(|_| WampError::Transport("loopback peer is gone".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WampResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct LoopbackSource {
    rx: mpsc::Receiver<Message>,
}

impl FrameSource for LoopbackSource {
    fn recv(&mut self) -> BoxFuture<'_, WampResult<Option<Message>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_carries_both_directions() {
        let (connector, mut listener) = loopback(4);
        let mut link = connector.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        link.sink.send(Message::from("ping")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_bytes(), b"ping");

        peer.send(Message::from("pong")).await.unwrap();
        assert_eq!(link.source.recv().await.unwrap().unwrap().as_bytes(), b"pong");

        peer.close();
        assert!(link.source.recv().await.unwrap().is_none());
        assert!(link.sink.send(Message::from("late")).await.is_err());
    }

    #[tokio::test]
    async fn refusing_connector_fails() {
        let (connector, _listener) = loopback(4);
        let connector = connector.refusing();
        assert!(matches!(
            connector.connect().await,
            Err(WampError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn dropped_listener_fails_connect() {
        let (connector, listener) = loopback(4);
        drop(listener);
        assert!(connector.connect().await.is_err());
    }
}
