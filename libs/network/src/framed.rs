//! Framed Connection
//!
//! Pairs one raw byte stream with a [`FrameBuffer`] so callers exchange
//! whole frame payloads instead of chunks. A reader task reassembles
//! inbound frames and delivers them in order through an event channel; a
//! writer task frames and flushes outbound payloads. Raw I/O never touches
//! caller state directly; everything crosses a channel boundary.
//!
//! Disconnection (peer close, I/O error, protocol violation or local
//! [`close`](FramedConnection::close)) is reported exactly once, with its
//! cause, as the final event.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use codec::{encode_frame, FrameBuffer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};

/// Inbound events delivered by a framed connection, in arrival order
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One complete frame payload
    Frame(Bytes),
    /// Terminal event; nothing follows it
    Disconnected(DisconnectCause),
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Graceful close, local or remote
    Closed,
    /// Underlying transport failed
    Error(String),
    /// Peer sent bytes that violate the framing/protocol rules
    ProtocolViolation(String),
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Error(message) => write!(f, "transport error: {message}"),
            Self::ProtocolViolation(message) => write!(f, "protocol violation: {message}"),
        }
    }
}

/// Tuning knobs for a framed connection
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Largest accepted frame, including the length prefix
    pub max_frame_size: usize,
    /// Capacity of the outbound payload queue
    pub outbound_queue: usize,
    /// Capacity of the inbound event queue
    pub inbound_queue: usize,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            max_frame_size: codec::DEFAULT_MAX_FRAME,
            outbound_queue: 256,
            inbound_queue: 256,
        }
    }
}

/// Byte/frame counters and activity tracking for one connection
#[derive(Debug)]
pub struct ConnectionStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
}

impl ConnectionStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            connected_at: now,
            last_activity: Mutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the connection carried any traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since the connection was established
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Handle to one framed connection; cheap to clone
#[derive(Clone)]
pub struct FramedConnection {
    peer_addr: SocketAddr,
    out_tx: mpsc::Sender<Bytes>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Cause recorded by whichever side failed first; `Closed` otherwise
    pending_cause: Arc<Mutex<Option<DisconnectCause>>>,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &*self.shutdown.borrow())
            .finish()
    }
}

impl FramedConnection {
    /// Wrap an established raw byte stream; spawns the reader and writer
    /// tasks. Any `AsyncRead + AsyncWrite` transport plugs in here: TCP
    /// in this crate, anything else at the caller's discretion.
    pub fn spawn<T>(
        io: T,
        peer_addr: SocketAddr,
        config: FramedConfig,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>)>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);

        let (event_tx, event_rx) = mpsc::channel(config.inbound_queue);
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let pending_cause = Arc::new(Mutex::new(None));
        let stats = Arc::new(ConnectionStats::new());

        let connection = Self {
            peer_addr,
            out_tx,
            shutdown: Arc::clone(&shutdown),
            pending_cause: Arc::clone(&pending_cause),
            stats: Arc::clone(&stats),
        };

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            Arc::clone(&shutdown),
            Arc::clone(&pending_cause),
            Arc::clone(&stats),
            peer_addr,
        ));
        tokio::spawn(read_loop(
            read_half,
            event_tx,
            config,
            shutdown,
            pending_cause,
            stats,
            peer_addr,
        ));

        Ok((connection, event_rx))
    }

    /// Remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Connection counters
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Queue one frame payload for sending (framing prefix added here)
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.out_tx
            .send(payload)
            .await
            .map_err(|_| TransportError::closed(Some(self.peer_addr)))
    }

    /// Actively tear the connection down. Convergent with a remote
    /// disconnect: the terminal event still fires exactly once.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// True once close/disconnect has been initiated
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn write_loop<T: AsyncRead + AsyncWrite>(
    mut write_half: WriteHalf<T>,
    mut out_rx: mpsc::Receiver<Bytes>,
    shutdown: Arc<watch::Sender<bool>>,
    pending_cause: Arc<Mutex<Option<DisconnectCause>>>,
    stats: Arc<ConnectionStats>,
    peer_addr: SocketAddr,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let payload = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            payload = out_rx.recv() => match payload {
                Some(payload) => payload,
                // All connection handles dropped.
                None => break,
            },
        };

        let frame = encode_frame(&payload);
        if let Err(e) = write_half.write_all(&frame).await {
            warn!(peer = %peer_addr, error = %e, "frame write failed");
            pending_cause
                .lock()
                .get_or_insert(DisconnectCause::Error(format!("write failed: {e}")));
            let _ = shutdown.send(true);
            break;
        }
        if let Err(e) = write_half.flush().await {
            warn!(peer = %peer_addr, error = %e, "flush failed");
            pending_cause
                .lock()
                .get_or_insert(DisconnectCause::Error(format!("flush failed: {e}")));
            let _ = shutdown.send(true);
            break;
        }
        stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        stats.touch();
        trace!(peer = %peer_addr, bytes = frame.len(), "sent frame");
    }
    let _ = write_half.shutdown().await;
    debug!(peer = %peer_addr, "writer terminated");
}

async fn read_loop<T: AsyncRead + AsyncWrite>(
    mut read_half: ReadHalf<T>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    config: FramedConfig,
    shutdown: Arc<watch::Sender<bool>>,
    pending_cause: Arc<Mutex<Option<DisconnectCause>>>,
    stats: Arc<ConnectionStats>,
    peer_addr: SocketAddr,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut frames = FrameBuffer::with_max_frame(config.max_frame_size);
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    let cause = 'outer: loop {
        let read = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                break 'outer pending_cause.lock().take().unwrap_or(DisconnectCause::Closed);
            }
            read = read_half.read_buf(&mut read_buf) => read,
        };

        match read {
            Ok(0) => break 'outer DisconnectCause::Closed,
            Ok(n) => {
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                stats.touch();
                frames.extend(&read_buf);
                read_buf.clear();
                loop {
                    match frames.next_frame() {
                        Ok(Some(frame)) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            trace!(peer = %peer_addr, bytes = frame.len(), "received frame");
                            if event_tx.send(ConnectionEvent::Frame(frame)).await.is_err() {
                                // Consumer gone; tear down quietly.
                                let _ = shutdown.send(true);
                                debug!(peer = %peer_addr, "event consumer dropped");
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "malformed frame");
                            break 'outer DisconnectCause::ProtocolViolation(e.to_string());
                        }
                    }
                }
            }
            Err(e) => break 'outer DisconnectCause::Error(e.to_string()),
        }
    };

    // Stop the writer and report the terminal event exactly once: this is
    // the only place that ever sends `Disconnected`.
    let _ = shutdown.send(true);
    debug!(peer = %peer_addr, cause = %cause, "connection disconnected");
    let _ = event_tx.send(ConnectionEvent::Disconnected(cause)).await;
}
