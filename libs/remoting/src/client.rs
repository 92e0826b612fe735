//! Remote Client Proxy
//!
//! Wraps one framed connection to a remote server. The state machine is
//! Disconnected → Connecting (inside [`RemoteClient::connect`]) →
//! Connected → Disconnected(terminal, with cause).
//!
//! Each call allocates the next connection-scoped request id, registers a
//! pending completion and sends a request frame; the matching response,
//! correlated by id and never by arrival order, resolves the caller's
//! future with the deserialized value or the remote error's message.
//! Disconnection fails every pending call with its cause and fires the
//! disconnected notification exactly once.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use codec::{
    decode_client_frame, BincodeSerializer, ClientFrame, ControlFrame, Handshake, HandshakeReply,
    Ping, ReplyEnvelope, RequestFrame, Serializer, CONTROL_HANDSHAKE, CONTROL_PING,
    PROTOCOL_VERSION,
};
use network::{ConnectionEvent, DisconnectCause, FramedConnection, TcpConfig};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{RemotingError, Result};

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Version offered in the handshake
    pub protocol_version: u32,
    /// Deadline for handshake and ping round-trips
    pub control_timeout: Duration,
    /// Transport configuration
    pub tcp: TcpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            control_timeout: Duration::from_secs(5),
            tcp: TcpConfig::default(),
        }
    }
}

struct ClientInner<S> {
    serializer: S,
    connection: FramedConnection,
    next_request_id: AtomicI64,
    /// request id → completion; entries leave on response or disconnect
    pending: Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Bytes, String>>>>,
    /// control id → FIFO of waiters for that control reply
    control: Mutex<HashMap<i32, VecDeque<oneshot::Sender<Bytes>>>>,
    /// stream name → local multicast point for inbound observable values
    observables: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    /// `None` while connected; the disconnect cause afterwards
    disconnect: watch::Sender<Option<String>>,
}

impl<S> ClientInner<S> {
    /// Fail everything in flight and fire the disconnected notification.
    /// Idempotent: only the first cause wins.
    fn fail_all(&self, cause: &str) {
        let first = self.disconnect.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(cause.to_string());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        let pending: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };
        for (request_id, tx) in pending {
            debug!(request_id, "failing pending call on disconnect");
            let _ = tx.send(Err(cause.to_string()));
        }
        self.control.lock().clear();
        // Dropping the senders ends every local subscription.
        self.observables.lock().clear();
        info!(cause, "client disconnected");
    }
}

impl<S> Drop for ClientInner<S> {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// Proxy for a remote actor interface over one connection
pub struct RemoteClient<S: Serializer = BincodeSerializer> {
    inner: Arc<ClientInner<S>>,
}

impl<S: Serializer> Clone for RemoteClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RemoteClient<BincodeSerializer> {
    /// Connect with the default serializer
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        Self::connect_with(addr, config, BincodeSerializer).await
    }
}

impl<S: Serializer> RemoteClient<S> {
    /// Establish the transport connection and run the version handshake.
    /// Fails with the underlying transport error (refused, timeout) or
    /// with [`RemotingError::VersionMismatch`].
    pub async fn connect_with(
        addr: SocketAddr,
        config: ClientConfig,
        serializer: S,
    ) -> Result<Self> {
        let (connection, events) = network::connect(addr, &config.tcp).await?;
        let (disconnect, _) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            serializer,
            connection: connection.clone(),
            next_request_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            control: Mutex::new(HashMap::new()),
            observables: Mutex::new(HashMap::new()),
            disconnect,
        });
        tokio::spawn(pump(Arc::downgrade(&inner), events, connection));

        let client = Self { inner };
        client.handshake(&config).await?;
        debug!(remote = %addr, "connected and handshaken");
        Ok(client)
    }

    async fn handshake(&self, config: &ClientConfig) -> Result<()> {
        let offer = Handshake {
            client_version: config.protocol_version,
        };
        let payload = self.inner.serializer.to_bytes(&offer)?;
        let reply_bytes = self
            .control_roundtrip(CONTROL_HANDSHAKE, payload, config.control_timeout)
            .await?;
        let reply: HandshakeReply = self.inner.serializer.from_bytes(&reply_bytes)?;
        if !reply.matched {
            warn!(
                client_version = config.protocol_version,
                server_version = reply.server_version,
                "handshake rejected"
            );
            self.inner.connection.close();
            return Err(RemotingError::VersionMismatch {
                client_version: config.protocol_version,
                server_version: reply.server_version,
            });
        }
        Ok(())
    }

    /// Invoke a remote method and await its reply
    pub async fn call<Args, R>(&self, method: &str, args: &Args) -> Result<R>
    where
        Args: Serialize,
        R: DeserializeOwned,
    {
        if let Some(cause) = self.disconnect_cause() {
            return Err(RemotingError::disconnected(cause));
        }
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let args_bytes = self.inner.serializer.to_bytes(args)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);

        let frame = RequestFrame::new(request_id, method, args_bytes).encode();
        if let Err(e) = self.inner.connection.send(frame).await {
            self.inner.pending.lock().remove(&request_id);
            return Err(e.into());
        }
        // A disconnect racing the send may have drained the pending map
        // before our entry landed; re-check so the await cannot hang.
        if let Some(cause) = self.disconnect_cause() {
            self.inner.pending.lock().remove(&request_id);
            return Err(RemotingError::disconnected(cause));
        }

        let envelope_bytes = match rx.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(cause)) => return Err(RemotingError::disconnected(cause)),
            Err(_) => return Err(RemotingError::disconnected("connection closed")),
        };
        let envelope: ReplyEnvelope<R> = self.inner.serializer.from_bytes(&envelope_bytes)?;
        envelope.into_result().map_err(RemotingError::remote)
    }

    /// Round-trip a liveness probe; returns the measured latency
    pub async fn ping(&self) -> Result<Duration> {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let probe = Ping { timestamp_ns };
        let payload = self.inner.serializer.to_bytes(&probe)?;

        let start = Instant::now();
        let reply_bytes = self
            .control_roundtrip(CONTROL_PING, payload, Duration::from_secs(5))
            .await?;
        let echoed: Ping = self.inner.serializer.from_bytes(&reply_bytes)?;
        if echoed != probe {
            return Err(RemotingError::protocol("ping reply does not echo probe"));
        }
        Ok(start.elapsed())
    }

    /// Subscribe to a named observable stream. Values broadcast by the
    /// server under this name are deserialized and pushed to every local
    /// subscriber; dropping the handle unsubscribes.
    pub fn subscribe<T: DeserializeOwned>(&self, name: &str) -> RemoteSubscription<T, S> {
        let rx = if self.is_connected() {
            let mut observables = self.inner.observables.lock();
            observables
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        } else {
            // Already gone: hand out a subscription that reports it.
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            rx
        };
        RemoteSubscription {
            rx,
            inner: Arc::clone(&self.inner),
            _value: PhantomData,
        }
    }

    /// Actively tear down the connection and wait for the disconnect to
    /// land; convergent with a disconnect initiated by the remote side.
    pub async fn close(&self) {
        self.inner.connection.close();
        let mut rx = self.inner.disconnect.subscribe();
        let _ = rx.wait_for(|cause| cause.is_some()).await;
    }

    /// `None` while connected, the cause once disconnected
    pub fn disconnect_cause(&self) -> Option<String> {
        self.inner.disconnect.borrow().clone()
    }

    /// True until the connection has failed or been closed
    pub fn is_connected(&self) -> bool {
        self.disconnect_cause().is_none()
    }

    /// Resolves with the cause when the connection ends. The watch fires
    /// exactly once per connection.
    pub async fn wait_disconnected(&self) -> String {
        let mut rx = self.inner.disconnect.subscribe();
        match rx.wait_for(|cause| cause.is_some()).await {
            Ok(slot) => slot.clone().unwrap_or_default(),
            Err(_) => "connection closed".to_string(),
        }
    }

    async fn control_roundtrip(
        &self,
        control_id: i32,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .control
            .lock()
            .entry(control_id)
            .or_default()
            .push_back(tx);
        let frame = ControlFrame::new(control_id, payload).encode();
        self.inner.connection.send(frame).await?;

        tokio::time::timeout(deadline, rx)
            .await
            .map_err(|_| RemotingError::timeout(format!("control reply {control_id}")))?
            .map_err(|_| RemotingError::disconnected("connection closed"))
    }
}

/// Typed subscription to one named observable stream
pub struct RemoteSubscription<T, S: Serializer = BincodeSerializer> {
    rx: broadcast::Receiver<Bytes>,
    inner: Arc<ClientInner<S>>,
    _value: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, S: Serializer> RemoteSubscription<T, S> {
    /// Next value from the stream; fails once the connection is gone
    pub async fn recv(&mut self) -> Result<T> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => return Ok(self.inner.serializer.from_bytes(&bytes)?),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observable subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let cause = self
                        .inner
                        .disconnect
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "connection closed".to_string());
                    return Err(RemotingError::disconnected(cause));
                }
            }
        }
    }
}

/// Inbound event pump: correlates responses, resolves control waiters and
/// feeds observable subscriptions. Exits on disconnect after failing all
/// pending work.
async fn pump<S: Serializer>(
    inner: Weak<ClientInner<S>>,
    mut events: mpsc::Receiver<ConnectionEvent>,
    connection: FramedConnection,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            // Every client handle is gone; nothing left to notify.
            connection.close();
            return;
        };
        match event {
            ConnectionEvent::Frame(payload) => match decode_client_frame(payload) {
                Ok(ClientFrame::Response(response)) => {
                    let waiter = inner.pending.lock().remove(&response.request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Ok(response.envelope));
                        }
                        None => {
                            debug!(request_id = response.request_id, "response for unknown request")
                        }
                    }
                }
                Ok(ClientFrame::Control(control)) => {
                    let waiter = inner
                        .control
                        .lock()
                        .get_mut(&control.control_id)
                        .and_then(VecDeque::pop_front);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(control.payload);
                        }
                        None => debug!(
                            control_id = control.control_id,
                            "unsolicited control message"
                        ),
                    }
                }
                Ok(ClientFrame::Observable(observable)) => {
                    let sender = inner.observables.lock().get(&observable.name).cloned();
                    if let Some(sender) = sender {
                        // No live subscribers is fine.
                        let _ = sender.send(observable.value);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "undecodable frame from server");
                    connection.close();
                }
            },
            ConnectionEvent::Disconnected(cause) => {
                inner.fail_all(&cause.to_string());
                return;
            }
        }
    }
    // Event stream ended without a terminal event; treat as closed.
    if let Some(inner) = inner.upgrade() {
        inner.fail_all(&DisconnectCause::Closed.to_string());
    }
}
