//! In-process loopback transport.
//!
//! Frames cross a pair of unbounded channels instead of a socket. Used by the
//! relay's tests to run full connect/chat/disconnect scenarios without
//! network I/O, and usable for embedding a broker and client in one process.

use async_trait::async_trait;
use parley_protocol::Frame;
use tokio::sync::{mpsc, Mutex};

use crate::traits::{Endpoint, FrameSink, FrameSource, Listener, TransportError};

/// Create a connected pair of loopback endpoints.
#[must_use]
pub fn pair() -> (MemEndpoint, MemEndpoint) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (
        MemEndpoint { tx: tx_a, rx: rx_a },
        MemEndpoint { tx: tx_b, rx: rx_b },
    )
}

/// Create a loopback listener and a cloneable connector for it.
#[must_use]
pub fn listener() -> (MemListener, MemConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemListener {
            incoming: Mutex::new(rx),
        },
        MemConnector { tx },
    )
}

/// One side of a loopback connection.
pub struct MemEndpoint {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Endpoint for MemEndpoint {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (
            Box::new(MemSource { rx: self.rx }),
            Box::new(MemSink { tx: Some(self.tx) }),
        )
    }

    fn peer_addr(&self) -> Option<String> {
        Some("mem:local".to_string())
    }
}

/// Read half of a split loopback endpoint.
pub struct MemSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for MemSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Write half of a split loopback endpoint.
pub struct MemSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for MemSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Loopback listener: accepts connections made through a [`MemConnector`].
pub struct MemListener {
    incoming: Mutex<mpsc::UnboundedReceiver<MemEndpoint>>,
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&self) -> Result<Box<dyn Endpoint>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(endpoint) => Ok(Box::new(endpoint)),
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<String> {
        Some("mem:listener".to_string())
    }

    fn name(&self) -> &'static str {
        "mem"
    }
}

/// Connects new loopback endpoints to a [`MemListener`].
#[derive(Clone)]
pub struct MemConnector {
    tx: mpsc::UnboundedSender<MemEndpoint>,
}

impl MemConnector {
    /// Open a new connection to the listener.
    ///
    /// # Errors
    ///
    /// Fails if the listener has been dropped.
    pub fn connect(&self) -> Result<MemEndpoint, TransportError> {
        let (local, remote) = pair();
        self.tx.send(remote).map_err(|_| TransportError::Closed)?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut a, mut b) = pair();

        a.send(Frame::chat(b"ping".to_vec())).await.unwrap();
        assert_eq!(
            b.recv().await.unwrap().unwrap(),
            Frame::chat(b"ping".to_vec())
        );

        b.send(Frame::Bye).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), Frame::Bye);
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_accepts_connections() {
        let (listener, connector) = listener();

        let mut client = connector.connect().unwrap();
        let mut server_side = listener.accept().await.unwrap();

        client.send(Frame::hello(None)).await.unwrap();
        assert_eq!(
            server_side.recv().await.unwrap().unwrap(),
            Frame::hello(None)
        );
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_sends() {
        let (a, _b) = pair();
        let (_source, mut sink) = (Box::new(a) as Box<dyn Endpoint>).split();

        sink.close().await.unwrap();
        assert!(matches!(
            sink.send(Frame::Bye).await,
            Err(TransportError::Closed)
        ));
    }
}
