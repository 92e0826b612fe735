//! Actor Sessions
//!
//! One session per accepted connection, pairing the framed transport with
//! a stable identity. Sessions support connection-affiliated push-sends
//! and carry the per-client activity timestamp used by the idle sweep.
//!
//! When session injection is enabled on the server, the active session is
//! bound in a task-local for the duration of a single dispatch: explicit
//! scoping instead of an ambient thread-local, so nothing leaks across
//! requests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codec::{ObservableFrame, Serializer};
use network::FramedConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

tokio::task_local! {
    static CURRENT_SESSION: ActorSession;
}

struct SessionInner {
    id: Uuid,
    peer_addr: SocketAddr,
    connection: FramedConnection,
}

/// Identity and push channel of one connected client
#[derive(Clone)]
pub struct ActorSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ActorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSession")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

impl ActorSession {
    pub(crate) fn new(connection: FramedConnection) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                peer_addr: connection.peer_addr(),
                connection,
            }),
        }
    }

    /// Session id, unique per accepted connection
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The client's remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Time since this client last sent or received anything
    pub fn idle_for(&self) -> Duration {
        self.inner.connection.stats().idle_for()
    }

    /// Push an observable value to this client only, tagged by stream name
    pub async fn push<T, S>(&self, name: &str, value: &T, serializer: &S) -> Result<()>
    where
        T: Serialize,
        S: Serializer + ?Sized,
    {
        let bytes = serializer.to_bytes(value)?;
        let frame = ObservableFrame::new(name, bytes).encode();
        self.inner.connection.send(frame).await?;
        Ok(())
    }

    /// Push a pre-encoded frame payload to this client
    pub(crate) async fn push_frame(&self, frame: Bytes) -> Result<()> {
        self.inner.connection.send(frame).await?;
        Ok(())
    }

    /// Close this client's connection
    pub fn close(&self) {
        self.inner.connection.close();
    }

    pub(crate) fn connection(&self) -> &FramedConnection {
        &self.inner.connection
    }

    /// The session of the call currently being dispatched, if session
    /// injection is enabled on the server and the caller is inside a
    /// dispatch.
    pub fn current() -> Option<ActorSession> {
        CURRENT_SESSION.try_with(|session| session.clone()).ok()
    }
}

/// Run `fut` with `session` bound as the current session
pub(crate) async fn with_current<F: Future>(session: ActorSession, fut: F) -> F::Output {
    CURRENT_SESSION.scope(session, fut).await
}

/// Run `f` with `session` bound as the current session
pub(crate) fn with_current_sync<F, R>(session: ActorSession, f: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT_SESSION.sync_scope(session, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::FramedConfig;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_session() -> ActorSession {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer) = listener.accept().await.unwrap();
        let _ = client.await.unwrap();
        let (connection, _events) =
            FramedConnection::spawn(server_stream, peer, FramedConfig::default()).unwrap();
        ActorSession::new(connection)
    }

    #[tokio::test]
    async fn test_current_is_scoped_to_the_dispatch() {
        let session = loopback_session().await;
        let id = session.id();

        assert!(ActorSession::current().is_none());
        let seen = with_current(session, async {
            ActorSession::current().map(|s| s.id())
        })
        .await;
        assert_eq!(seen, Some(id));
        assert!(ActorSession::current().is_none());
    }

    #[tokio::test]
    async fn test_sessions_have_unique_ids() {
        let a = loopback_session().await;
        let b = loopback_session().await;
        assert_ne!(a.id(), b.id());
    }
}
