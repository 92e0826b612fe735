//! Remote Server
//!
//! Accepts connections, wraps each in a framed transport plus an
//! [`ActorSession`], and routes inbound frames: application requests go
//! through the dispatch table (posted onto the target actor's executor by
//! default), protocol control is answered out-of-band, and bound
//! observable streams fan out to every connected client.
//!
//! Error isolation: an error from the actor implementation travels back in
//! the reply envelope; only protocol violations (undecodable frames,
//! unknown methods, version mismatch) cost the offending client its
//! connection. Other clients are never affected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codec::{
    decode_server_frame, ControlFrame, Handshake, HandshakeReply, RequestFrame, ResponseFrame,
    Serializer, ServerFrame, CONTROL_HANDSHAKE, CONTROL_PING, PROTOCOL_VERSION,
};
use network::{ConnectionEvent, FramedConnection, TcpAcceptor, TcpConfig};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchMode, DispatchTable};
use crate::error::Result;
use crate::session::ActorSession;

/// Server-side configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Version accepted in the handshake
    pub protocol_version: u32,
    /// Close connections idle longer than this; `None` disables the sweep
    pub idle_timeout: Option<Duration>,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Post dispatched calls through the target actor's executor. Turning
    /// this off runs handlers directly on the connection's I/O task,
    /// bypassing the per-actor serialization guarantee; callers own the
    /// consequences. Leave on unless measurements say otherwise.
    pub serialize_dispatch: bool,
    /// Bind the active session in a task-local for the duration of each
    /// dispatch, making [`ActorSession::current`] available to handlers
    pub session_injection: bool,
    /// Transport configuration
    pub tcp: TcpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            idle_timeout: Some(Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(10),
            serialize_dispatch: true,
            session_injection: false,
            tcp: TcpConfig::default(),
        }
    }
}

struct ServerShared {
    sessions: RwLock<HashMap<Uuid, ActorSession>>,
    shutdown: watch::Sender<bool>,
    config: ServerConfig,
}

/// Listening server for one dispatch table
pub struct RemoteServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
}

impl RemoteServer {
    /// Bind and start serving
    pub async fn bind<S: Serializer>(
        addr: SocketAddr,
        table: DispatchTable<S>,
        serializer: S,
        config: ServerConfig,
    ) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(addr, config.tcp.clone()).await?;
        let local_addr = acceptor.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(ServerShared {
            sessions: RwLock::new(HashMap::new()),
            shutdown,
            config,
        });
        let serializer = Arc::new(serializer);
        let table = Arc::new(table);

        // Observable fan-out: one forwarder per bound stream feeding a
        // single broadcast queue.
        let (observable_tx, observable_rx) = mpsc::channel(256);
        table.spawn_observables(Arc::clone(&serializer), observable_tx);
        tokio::spawn(broadcast_loop(Arc::clone(&shared), observable_rx));

        if shared.config.idle_timeout.is_some() {
            tokio::spawn(idle_sweep(Arc::clone(&shared)));
        }
        tokio::spawn(accept_loop(acceptor, Arc::clone(&shared), table, serializer));

        info!(local = %local_addr, "server started");
        Ok(Self { shared, local_addr })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected clients
    pub fn session_count(&self) -> usize {
        self.shared.sessions.read().len()
    }

    /// Stop accepting and close every session, failing their clients'
    /// pending calls. Idempotent.
    pub fn shutdown(&self) {
        info!(local = %self.local_addr, "server shutting down");
        let _ = self.shared.shutdown.send(true);
        let sessions: Vec<ActorSession> = {
            let mut map = self.shared.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop<S: Serializer>(
    acceptor: TcpAcceptor,
    shared: Arc<ServerShared>,
    table: Arc<DispatchTable<S>>,
    serializer: Arc<S>,
) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok((connection, events)) => {
                tokio::spawn(connection_task(
                    connection,
                    events,
                    Arc::clone(&shared),
                    Arc::clone(&table),
                    Arc::clone(&serializer),
                ));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
    debug!("accept loop terminated");
}

async fn connection_task<S: Serializer>(
    connection: FramedConnection,
    mut events: mpsc::Receiver<ConnectionEvent>,
    shared: Arc<ServerShared>,
    table: Arc<DispatchTable<S>>,
    serializer: Arc<S>,
) {
    let session = ActorSession::new(connection.clone());
    info!(session = %session.id(), peer = %session.peer_addr(), "client connected");
    shared
        .sessions
        .write()
        .insert(session.id(), session.clone());

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Frame(payload) => match decode_server_frame(payload) {
                Ok(ServerFrame::Request(request)) => {
                    handle_request(request, &session, &shared, &table, &serializer);
                }
                Ok(ServerFrame::Control(control)) => {
                    handle_control(control, &session, &shared, &serializer).await;
                }
                Err(e) => {
                    // Undecodable frame: protocol violation, connection is
                    // done; other clients unaffected.
                    warn!(session = %session.id(), error = %e, "malformed frame, closing");
                    connection.close();
                }
            },
            ConnectionEvent::Disconnected(cause) => {
                info!(session = %session.id(), cause = %cause, "client disconnected");
                break;
            }
        }
    }
    shared.sessions.write().remove(&session.id());
}

/// Decode and dispatch one application request. The enqueue on the target
/// actor happens here, in arrival order; only the reply is awaited on a
/// separate task, so responses may complete out of order and correlation
/// is by request id alone.
fn handle_request<S: Serializer>(
    request: RequestFrame,
    session: &ActorSession,
    shared: &Arc<ServerShared>,
    table: &Arc<DispatchTable<S>>,
    serializer: &Arc<S>,
) {
    let mode = if shared.config.serialize_dispatch {
        DispatchMode::Serialized
    } else {
        DispatchMode::Direct
    };
    let injected = shared
        .config
        .session_injection
        .then(|| session.clone());
    let dispatched = table.dispatch(
        &request.method,
        Arc::clone(serializer),
        request.args.clone(),
        mode,
        injected,
    );
    let pending = match dispatched {
        Some(Ok(pending)) => pending,
        Some(Err(e)) => {
            warn!(
                session = %session.id(),
                method = %request.method,
                error = %e,
                "undecodable request arguments, closing"
            );
            session.close();
            return;
        }
        None => {
            warn!(
                session = %session.id(),
                method = %request.method,
                "no handler registered, closing"
            );
            session.close();
            return;
        }
    };

    let session = session.clone();
    tokio::spawn(async move {
        let reply = pending.await;
        let frame = ResponseFrame::new(request.request_id, reply).encode();
        if let Err(e) = session.push_frame(frame).await {
            debug!(session = %session.id(), error = %e, "response dropped, client gone");
        }
    });
}

async fn handle_control<S: Serializer>(
    control: ControlFrame,
    session: &ActorSession,
    shared: &Arc<ServerShared>,
    serializer: &Arc<S>,
) {
    match control.control_id {
        CONTROL_HANDSHAKE => {
            let offer: Handshake = match serializer.from_bytes(&control.payload) {
                Ok(offer) => offer,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "bad handshake payload, closing");
                    session.close();
                    return;
                }
            };
            let matched = offer.client_version == shared.config.protocol_version;
            let reply = HandshakeReply {
                requested_version: offer.client_version,
                server_version: shared.config.protocol_version,
                matched,
            };
            let payload = match serializer.to_bytes(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "handshake reply failed to encode");
                    session.close();
                    return;
                }
            };
            let frame = ControlFrame::new(CONTROL_HANDSHAKE, payload).encode();
            let _ = session.push_frame(frame).await;
            if !matched {
                warn!(
                    session = %session.id(),
                    client_version = offer.client_version,
                    server_version = shared.config.protocol_version,
                    "version mismatch, closing"
                );
                session.close();
            }
        }
        CONTROL_PING => {
            // Echo untouched; receipt already refreshed the activity clock.
            let frame = ControlFrame::new(CONTROL_PING, control.payload).encode();
            let _ = session.push_frame(frame).await;
        }
        other => {
            warn!(session = %session.id(), control_id = other, "unknown control id, closing");
            session.close();
        }
    }
}

/// Fan one encoded observable frame out to every connected session
async fn broadcast_loop(shared: Arc<ServerShared>, mut values: mpsc::Receiver<Bytes>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            frame = values.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let sessions: Vec<ActorSession> = shared.sessions.read().values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.push_frame(frame.clone()).await {
                debug!(session = %session.id(), error = %e, "observable push failed");
            }
        }
    }
}

/// Close connections that have been quiet past the configured threshold
async fn idle_sweep(shared: Arc<ServerShared>) {
    let Some(threshold) = shared.config.idle_timeout else {
        return;
    };
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }
        let stale: Vec<ActorSession> = shared
            .sessions
            .read()
            .values()
            .filter(|session| session.idle_for() > threshold)
            .cloned()
            .collect();
        for session in stale {
            info!(
                session = %session.id(),
                idle_secs = session.idle_for().as_secs(),
                "closing idle connection"
            );
            session.close();
        }
    }
}
