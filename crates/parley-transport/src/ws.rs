//! WebSocket transport built on tokio-tungstenite.
//!
//! Codec frames travel inside binary WebSocket messages. WebSocket-level
//! ping/pong is handled here and never surfaces to the broker; the protocol
//! has its own keepalive frames for end-to-end liveness.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec::WireCodec, Frame, WireError, DEFAULT_MAX_FRAME};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Endpoint, FrameSink, FrameSource, Listener, TransportError};

/// WebSocket listener configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum incoming message size in bytes.
    pub max_message_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".parse().unwrap(),
            max_message_size: DEFAULT_MAX_FRAME,
        }
    }
}

/// WebSocket listener.
pub struct WsListener {
    listener: TcpListener,
    config: WsConfig,
}

impl WsListener {
    /// Bind a listener with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WsConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        debug!("WebSocket listener bound on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Bind a listener with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WsConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// The bound socket address.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&self) -> Result<Box<dyn Endpoint>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!("WebSocket handshake completed with {}", addr);

        Ok(Box::new(WsEndpoint::new(
            ws_stream,
            Some(addr),
            self.config.max_message_size,
        )))
    }

    fn local_addr(&self) -> Option<String> {
        self.socket_addr().map(|a| a.to_string())
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Connect to a Parley broker over WebSocket.
///
/// # Errors
///
/// Returns an error if the connection or WebSocket handshake fails.
pub async fn connect(
    url: &str,
) -> Result<WsEndpoint<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::Other(format!("Connect failed: {}", e)))?;

    debug!("Connected to {}", url);
    Ok(WsEndpoint::new(ws_stream, None, DEFAULT_MAX_FRAME))
}

/// A WebSocket endpoint.
pub struct WsEndpoint<S> {
    stream: WebSocketStream<S>,
    peer: Option<SocketAddr>,
    codec: WireCodec,
    read_buffer: BytesMut,
}

impl<S> WsEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(stream: WebSocketStream<S>, peer: Option<SocketAddr>, max_message_size: usize) -> Self {
        Self {
            stream,
            peer,
            codec: WireCodec::with_max_frame(max_message_size),
            read_buffer: BytesMut::with_capacity(4096),
        }
    }
}

/// Append one incoming WebSocket payload to the decode buffer, enforcing the
/// size limit.
fn buffer_payload(
    buffer: &mut BytesMut,
    data: &[u8],
    max_message_size: usize,
) -> Result<(), TransportError> {
    if data.len() > max_message_size {
        warn!(
            "Incoming message of {} bytes exceeds limit {}",
            data.len(),
            max_message_size
        );
        return Err(TransportError::Wire(WireError::FrameTooLarge {
            size: data.len(),
            max: max_message_size,
        }));
    }
    buffer.extend_from_slice(data);
    Ok(())
}

#[async_trait]
impl<S> Endpoint for WsEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    buffer_payload(&mut self.read_buffer, &data, self.codec.max_frame())?;
                    if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    buffer_payload(&mut self.read_buffer, text.as_bytes(), self.codec.max_frame())?;
                    if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = self.codec.encode(&frame)?;
        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsSource {
                stream,
                codec: self.codec,
                read_buffer: self.read_buffer,
            }),
            Box::new(WsSink {
                sink,
                codec: self.codec,
            }),
        )
    }

    fn peer_addr(&self) -> Option<String> {
        self.peer.map(|a| a.to_string())
    }
}

/// Read half of a split WebSocket endpoint.
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    codec: WireCodec,
    read_buffer: BytesMut,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    buffer_payload(&mut self.read_buffer, &data, self.codec.max_frame())?;
                    if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    buffer_payload(&mut self.read_buffer, text.as_bytes(), self.codec.max_frame())?;
                    if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                // Pongs for these are queued by tungstenite and flushed by
                // the write half.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}

/// Write half of a split WebSocket endpoint.
pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    codec: WireCodec,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = self.codec.encode(&frame)?;
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_config_default() {
        let config = WsConfig::default();
        assert_eq!(config.bind_addr.port(), 7400);
        assert_eq!(config.max_message_size, DEFAULT_MAX_FRAME);
    }

    #[tokio::test]
    async fn test_ws_roundtrip() {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.socket_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut endpoint = listener.accept().await.unwrap();
            let frame = endpoint.recv().await.unwrap().unwrap();
            assert_eq!(frame, Frame::chat(b"over the wire".to_vec()));
            endpoint.send(Frame::welcome("peer-1", 30_000)).await.unwrap();
        });

        let mut client = connect(&format!("ws://{}", addr)).await.unwrap();
        client.send(Frame::chat(b"over the wire".to_vec())).await.unwrap();

        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply, Frame::welcome("peer-1", 30_000));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_split_roundtrip() {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.socket_addr().unwrap();

        let server = tokio::spawn(async move {
            let endpoint = listener.accept().await.unwrap();
            let (mut source, mut sink) = endpoint.split();
            while let Some(frame) = source.recv().await.unwrap() {
                if frame == Frame::Bye {
                    break;
                }
                sink.send(frame).await.unwrap();
            }
            sink.close().await.unwrap();
        });

        let client = Box::new(connect(&format!("ws://{}", addr)).await.unwrap());
        let (mut source, mut sink) = (client as Box<dyn Endpoint>).split();

        sink.send(Frame::chat(b"echo me".to_vec())).await.unwrap();
        let echoed = source.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Frame::chat(b"echo me".to_vec()));

        sink.send(Frame::Bye).await.unwrap();
        assert!(source.recv().await.unwrap().is_none());

        server.await.unwrap();
    }
}
