//! TCP Transport
//!
//! Client connection establishment and server-side acceptance, both
//! producing [`FramedConnection`]s.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::framed::{ConnectionEvent, FramedConfig, FramedConnection};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout for client connects
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Framing configuration applied to every connection
    pub framed: FramedConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
            framed: FramedConfig::default(),
        }
    }
}

/// Connect to a remote endpoint and wrap the stream in framing
///
/// Refused connections and timeouts surface as transport errors on this
/// call; nothing is retried.
pub async fn connect(
    addr: SocketAddr,
    config: &TcpConfig,
) -> Result<(FramedConnection, mpsc::Receiver<ConnectionEvent>)> {
    debug!(remote = %addr, "connecting");
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            TransportError::timeout("tcp connect", config.connect_timeout.as_millis() as u64)
        })?
        .map_err(|e| TransportError::network_with_source("failed to connect", e))?;

    configure_stream(&stream, config);
    let peer = stream
        .peer_addr()
        .map_err(|e| TransportError::network_with_source("failed to get peer address", e))?;
    info!(remote = %addr, "connected");
    FramedConnection::spawn(stream, peer, config.framed.clone())
}

/// Listening socket handing out framed connections
pub struct TcpAcceptor {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpAcceptor {
    /// Bind a listener
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::network_with_source("failed to bind listener", e))?;
        info!(local = %addr, "listening");
        Ok(Self { listener, config })
    }

    /// The bound address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("failed to get local address", e))
    }

    /// Accept one connection and wrap it in framing
    pub async fn accept(&self) -> Result<(FramedConnection, mpsc::Receiver<ConnectionEvent>)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::network_with_source("accept failed", e))?;
        configure_stream(&stream, &self.config);
        debug!(peer = %peer, "accepted connection");
        FramedConnection::spawn(stream, peer, self.config.framed.clone())
    }
}

fn configure_stream(stream: &TcpStream, config: &TcpConfig) {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();

        let accept = tokio::spawn(async move { acceptor.accept().await.unwrap() });
        let (client, mut client_rx) = connect(addr, &TcpConfig::default()).await.unwrap();
        let (server, mut server_rx) = accept.await.unwrap();

        client.send(Bytes::from_static(b"hello")).await.unwrap();
        match server_rx.recv().await.unwrap() {
            ConnectionEvent::Frame(frame) => assert_eq!(frame, Bytes::from_static(b"hello")),
            other => panic!("unexpected event: {other:?}"),
        }

        server.send(Bytes::from_static(b"world")).await.unwrap();
        match client_rx.recv().await.unwrap() {
            ConnectionEvent::Frame(frame) => assert_eq!(frame, Bytes::from_static(b"world")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_error() {
        // Bind-then-drop guarantees an unused port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, &TcpConfig::default()).await;
        assert!(result.is_err());
    }
}
