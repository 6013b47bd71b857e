//! The broker's event loop.
//!
//! One accept loop plus a reader and a writer task per connection. All
//! registry mutation funnels through `parley-core`, so this module only
//! drives lifecycle transitions: accept, handshake, read, dispatch, remove.
//!
//! Failure containment: an I/O error on the listening socket is fatal and
//! ends service; any error on a single connection tears down that connection
//! only. A dead fan-out target is removed inside the dispatch call and never
//! stalls delivery to the remaining targets.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use parley_core::registry::validate_peer_name;
use parley_core::{Broker, ConnectionId, Message, MessageKind, RegistryConfig, RegistryError};
use parley_protocol::frames::{
    ERR_BAD_FRAME, ERR_INVALID_NAME, ERR_SERVER_FULL, ERR_UNSUPPORTED_VERSION,
};
use parley_protocol::{Frame, SystemEvent};
use parley_transport::{Endpoint, FrameSink, FrameSource, Listener, TransportError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The relay: a broker plus the event loop that feeds it.
pub struct Relay {
    broker: Arc<Broker>,
    config: Config,
}

/// Why a session's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The peer sent `Bye`.
    Left,
    /// End-of-stream.
    Closed,
    /// A receive error.
    ReadError,
    /// Nothing heard within the idle deadline.
    Idle,
    /// The relay is shutting down.
    Shutdown,
}

/// Everything a session needs once the handshake completes.
struct SessionStart {
    id: ConnectionId,
    label: String,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    outbox: mpsc::UnboundedReceiver<Arc<Message>>,
}

impl Relay {
    /// Create a relay from broker configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker = Broker::with_config(RegistryConfig {
            max_connections: config.limits.max_connections,
        });
        Self {
            broker: Arc::new(broker),
            config,
        }
    }

    /// The underlying broker, for inspection.
    #[must_use]
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Accept and serve connections until `shutdown` completes.
    ///
    /// On shutdown every live connection is told the relay is going away,
    /// queued deliveries are flushed, and endpoints close before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns an error only when the listening socket itself fails; that is
    /// the one condition the loop cannot recover from.
    pub async fn serve<F>(self, listener: Box<dyn Listener>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        info!(
            transport = listener.name(),
            addr = listener.local_addr().as_deref().unwrap_or("unknown"),
            "Relay accepting connections"
        );

        let fatal = loop {
            tokio::select! {
                _ = &mut shutdown => break None,

                accepted = listener.accept() => match accepted {
                    Ok(endpoint) => {
                        let broker = Arc::clone(&self.broker);
                        let config = self.config.clone();
                        let stop = stop_rx.clone();
                        tokio::spawn(handle_session(endpoint, broker, config, stop));
                    }
                    Err(TransportError::Io(e)) => {
                        error!(error = %e, "Listener failed");
                        break Some(anyhow::Error::new(e).context("listener failed"));
                    }
                    Err(TransportError::Closed) => {
                        info!("Listener closed");
                        break None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        metrics::record_error("accept");
                    }
                },
            }
        };

        info!(peers = self.broker.registry().len(), "Relay shutting down");

        // Queue the shutdown notice, then close every outbox. Writers flush
        // what is queued (the notice included) before closing endpoints.
        self.broker.announce(MessageKind::Shutdown, "server");
        let _ = stop_tx.send(true);
        drop(self.broker.registry().drain());

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Serve until ctrl-c.
    ///
    /// # Errors
    ///
    /// Same as [`serve`](Relay::serve).
    pub async fn serve_until_ctrl_c(self, listener: Box<dyn Listener>) -> Result<()> {
        self.serve(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "Failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Drive one connection from handshake to teardown.
async fn handle_session(
    endpoint: Box<dyn Endpoint>,
    broker: Arc<Broker>,
    config: Config,
    mut stop: watch::Receiver<bool>,
) {
    let peer_addr = endpoint.peer_addr();

    let Some(session) = handshake(endpoint, &broker, &config).await else {
        return;
    };
    let SessionStart {
        id,
        label,
        mut source,
        sink,
        outbox,
    } = session;

    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(peer = %id, label = %label, addr = peer_addr.as_deref().unwrap_or("unknown"), "Session established");

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbox, control_rx));

    if config.notices.joined {
        broker.dispatch(Message::peer_notice(
            MessageKind::PeerJoined,
            id,
            label.clone(),
        ));
    }

    let end = read_loop(
        id,
        &label,
        source.as_mut(),
        &broker,
        &config,
        &control_tx,
        &mut stop,
    )
    .await;
    drop(control_tx);

    if let Some(conn) = broker.part(id) {
        // On shutdown the relay itself notifies everyone; a per-peer
        // leave notice would be noise.
        if config.notices.left && end != SessionEnd::Shutdown {
            broker.dispatch(Message::peer_notice(
                MessageKind::PeerLeft,
                conn.id,
                conn.label,
            ));
        }
    }

    let _ = writer.await;
    debug!(peer = %id, end = ?end, "Session ended");
}

/// Run the handshake: expect a compatible `Hello`, register the peer, send
/// `Welcome`. Returns `None` when the connection was rejected or lost; the
/// rejection frame has already been sent.
async fn handshake(
    mut endpoint: Box<dyn Endpoint>,
    broker: &Broker,
    config: &Config,
) -> Option<SessionStart> {
    let first = match timeout(config.handshake_timeout(), endpoint.recv()).await {
        Err(_) => {
            debug!("Handshake timed out");
            metrics::record_error("handshake");
            return None;
        }
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => {
            debug!(error = %e, "Handshake read failed");
            metrics::record_error("handshake");
            return None;
        }
    };

    let (version, name) = match first {
        Frame::Hello { version, name } => (version, name),
        other => {
            debug!(frame = ?other.frame_type(), "Expected hello");
            let _ = endpoint
                .send(Frame::error(ERR_BAD_FRAME, "expected hello"))
                .await;
            return None;
        }
    };

    if !Frame::version_compatible(version) {
        let _ = endpoint
            .send(Frame::error(
                ERR_UNSUPPORTED_VERSION,
                format!("unsupported protocol version {version}"),
            ))
            .await;
        return None;
    }

    if let Some(name) = &name {
        if let Err(reason) = validate_peer_name(name) {
            let _ = endpoint.send(Frame::error(ERR_INVALID_NAME, reason)).await;
            return None;
        }
    }

    let (id, outbox) = match broker.join_with(name) {
        Ok(joined) => joined,
        Err(RegistryError::ResourceExhausted) => {
            warn!("Connection rejected: at capacity");
            metrics::record_error("capacity");
            let _ = endpoint
                .send(Frame::error(ERR_SERVER_FULL, "server full"))
                .await;
            return None;
        }
    };

    let label = broker
        .registry()
        .get(id)
        .map(|c| c.label)
        .unwrap_or_else(|| id.to_string());

    let welcome = Frame::welcome(id.to_string(), config.heartbeat.interval_ms as u32);
    if let Err(e) = endpoint.send(welcome).await {
        debug!(peer = %id, error = %e, "Failed to send welcome");
        broker.part(id);
        return None;
    }

    let (source, sink) = endpoint.split();
    Some(SessionStart {
        id,
        label,
        source,
        sink,
        outbox,
    })
}

/// Read frames from one peer and feed the broker until the session ends.
async fn read_loop(
    id: ConnectionId,
    label: &str,
    source: &mut dyn FrameSource,
    broker: &Broker,
    config: &Config,
    control: &mpsc::UnboundedSender<Frame>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        if *stop.borrow() {
            return SessionEnd::Shutdown;
        }

        let frame = tokio::select! {
            _ = stop.changed() => return SessionEnd::Shutdown,

            received = timeout(config.idle_timeout(), source.recv()) => match received {
                Err(_) => {
                    debug!(peer = %id, "Idle timeout");
                    return SessionEnd::Idle;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return SessionEnd::Closed,
                Ok(Err(e)) => {
                    warn!(peer = %id, error = %e, "Read failed");
                    metrics::record_error("read");
                    return SessionEnd::ReadError;
                }
            },
        };

        match frame {
            Frame::Chat { body } => {
                metrics::record_message(body.len(), "inbound");

                let report = broker.dispatch(Message::chat(id, label, body));
                metrics::record_fanout(report.delivered);

                for dead in report.failed {
                    metrics::record_dropped_peer();
                    if config.notices.left {
                        broker.dispatch(Message::peer_notice(
                            MessageKind::PeerLeft,
                            dead.id,
                            dead.label,
                        ));
                    }
                }
            }
            Frame::Ping { timestamp } => {
                if control.send(Frame::pong(timestamp)).is_err() {
                    return SessionEnd::Closed;
                }
            }
            Frame::Pong { .. } => {}
            Frame::Bye => return SessionEnd::Left,
            other => {
                warn!(peer = %id, frame = ?other.frame_type(), "Unexpected frame");
            }
        }
    }
}

/// Drain a session's delivery queue and control frames into its endpoint.
///
/// Ends when the registry entry is removed (the outbox closes) or a send
/// fails; either way the endpoint is closed after flushing what was queued.
async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut outbox: mpsc::UnboundedReceiver<Arc<Message>>,
    mut control: mpsc::UnboundedReceiver<Frame>,
) {
    let mut control_open = true;
    loop {
        let frame = if control_open {
            tokio::select! {
                biased;

                ctl = control.recv() => match ctl {
                    Some(frame) => Some(frame),
                    None => {
                        control_open = false;
                        continue;
                    }
                },
                msg = outbox.recv() => msg.map(|m| frame_for(&m)),
            }
        } else {
            outbox.recv().await.map(|m| frame_for(&m))
        };

        let Some(frame) = frame else { break };

        if let Frame::Relay { body, .. } = &frame {
            metrics::record_message(body.len(), "outbound");
        }

        if sink.send(frame).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Map a routed message to its wire frame.
fn frame_for(message: &Message) -> Frame {
    match message.kind {
        MessageKind::Chat => Frame::Relay {
            sender: message.label.clone(),
            body: message.body.to_vec(),
            timestamp: message.timestamp,
        },
        MessageKind::PeerJoined => Frame::system(SystemEvent::Joined, message.label.clone()),
        MessageKind::PeerLeft => Frame::system(SystemEvent::Left, message.label.clone()),
        MessageKind::Shutdown => Frame::System {
            event: SystemEvent::Shutdown,
            peer: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_transport::mem::{self, MemConnector};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config
    }

    struct TestClient {
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        id: String,
    }

    impl TestClient {
        async fn next(&mut self) -> Frame {
            self.source
                .recv()
                .await
                .unwrap()
                .expect("stream ended unexpectedly")
        }

        async fn say(&mut self, body: &[u8]) {
            self.sink.send(Frame::chat(body.to_vec())).await.unwrap();
        }

        async fn expect_relay(&mut self, sender: &str, body: &[u8]) {
            match self.next().await {
                Frame::Relay {
                    sender: s, body: b, ..
                } => {
                    assert_eq!(s, sender);
                    assert_eq!(b, body);
                }
                other => panic!("expected relay, got {other:?}"),
            }
        }
    }

    async fn start_relay(
        config: Config,
    ) -> (MemConnector, oneshot::Sender<()>, JoinHandle<Result<()>>) {
        let (listener, connector) = mem::listener();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let relay = Relay::new(config);
        let handle = tokio::spawn(relay.serve(Box::new(listener), async move {
            let _ = stop_rx.await;
        }));
        (connector, stop_tx, handle)
    }

    async fn connect(connector: &MemConnector, name: Option<&str>) -> TestClient {
        let mut endpoint: Box<dyn Endpoint> = Box::new(connector.connect().unwrap());
        endpoint
            .send(Frame::hello(name.map(str::to_string)))
            .await
            .unwrap();
        let Some(Frame::Welcome { connection_id, .. }) = endpoint.recv().await.unwrap() else {
            panic!("expected welcome");
        };
        let (source, sink) = endpoint.split();
        TestClient {
            source,
            sink,
            id: connection_id,
        }
    }

    /// Connect and expect the handshake to be rejected with `code`.
    async fn expect_rejection(connector: &MemConnector, hello: Frame, code: u16) {
        let mut endpoint: Box<dyn Endpoint> = Box::new(connector.connect().unwrap());
        endpoint.send(hello).await.unwrap();
        match endpoint.recv().await.unwrap().unwrap() {
            Frame::Error { code: c, .. } => assert_eq!(c, code),
            other => panic!("expected error {code}, got {other:?}"),
        }
        // The broker hangs up after a rejection.
        assert!(endpoint.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_three_client_broadcast() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        let mut a = connect(&connector, Some("A")).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "B"));

        let mut c = connect(&connector, Some("C")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "C"));
        assert_eq!(b.next().await, Frame::system(SystemEvent::Joined, "C"));

        a.say(b"hi").await;
        b.expect_relay("A", b"hi").await;
        c.expect_relay("A", b"hi").await;

        // A never sees its own message: the next thing it receives is B's.
        b.say(b"hello A").await;
        a.expect_relay("B", b"hello A").await;
        c.expect_relay("B", b"hello A").await;
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_peers() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        let mut a = connect(&connector, Some("A")).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "B"));

        // A hangs up without a Bye.
        a.sink.close().await.unwrap();
        drop(a);

        assert_eq!(b.next().await, Frame::system(SystemEvent::Left, "A"));
    }

    #[tokio::test]
    async fn test_explicit_bye() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        let mut a = connect(&connector, Some("A")).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "B"));

        a.sink.send(Frame::Bye).await.unwrap();
        assert_eq!(b.next().await, Frame::system(SystemEvent::Left, "A"));
    }

    #[tokio::test]
    async fn test_capacity_rejection_leaves_existing_sessions_alone() {
        let mut config = test_config();
        config.limits.max_connections = 2;
        let (connector, _stop, _handle) = start_relay(config).await;

        let mut a = connect(&connector, Some("A")).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "B"));

        expect_rejection(&connector, Frame::hello(Some("C".into())), ERR_SERVER_FULL).await;

        // The rejected connection cost the others nothing.
        a.say(b"still works").await;
        b.expect_relay("A", b"still works").await;
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        expect_rejection(&connector, Frame::chat(b"no hello".to_vec()), ERR_BAD_FRAME).await;
        expect_rejection(
            &connector,
            Frame::Hello {
                version: 99,
                name: None,
            },
            ERR_UNSUPPORTED_VERSION,
        )
        .await;
        expect_rejection(
            &connector,
            Frame::hello(Some("$reserved".into())),
            ERR_INVALID_NAME,
        )
        .await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        let mut a = connect(&connector, Some("A")).await;
        a.sink.send(Frame::ping(Some(7))).await.unwrap();
        assert_eq!(a.next().await, Frame::pong(Some(7)));
    }

    #[tokio::test]
    async fn test_anonymous_peer_labeled_by_id() {
        let (connector, _stop, _handle) = start_relay(test_config()).await;

        let mut anon = connect(&connector, None).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(anon.next().await, Frame::system(SystemEvent::Joined, "B"));

        anon.say(b"who am I").await;
        let id = anon.id.clone();
        b.expect_relay(&id, b"who am I").await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_flushes_notice() {
        let (connector, stop, handle) = start_relay(test_config()).await;

        let mut a = connect(&connector, Some("A")).await;
        let mut b = connect(&connector, Some("B")).await;
        assert_eq!(a.next().await, Frame::system(SystemEvent::Joined, "B"));

        stop.send(()).unwrap();

        for client in [&mut a, &mut b] {
            assert_eq!(
                client.next().await,
                Frame::System {
                    event: SystemEvent::Shutdown,
                    peer: None,
                }
            );
            assert!(client.source.recv().await.unwrap().is_none());
        }

        handle.await.unwrap().unwrap();
    }
}
