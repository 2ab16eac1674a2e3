use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::connection::Conn;
use crate::{Entity, TransportConfig, TransportError};

/// A bound TCP listener that yields identified [`Conn`]s.
///
/// Binding happens before the local [`Entity`] exists so that callers can
/// bind port 0 and publish the resolved address in their identity.
pub struct Listener {
    inner: TcpListener,
    config: TransportConfig,
}

impl Listener {
    /// Bind the listening socket. Failure here is fatal for a host.
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { inner, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept the next TCP stream without reading from it.
    ///
    /// The identity handshake is left to [`Accepted::handshake`] so that a
    /// peer that never identifies itself does not hold up later accepts.
    pub async fn accept_stream(&self) -> Result<Accepted, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::debug!(%peer, "accepted tcp connection");
        Ok(Accepted {
            stream,
            peer,
            config: self.config.clone(),
        })
    }

    /// Accept the next connection and run the identity handshake inline.
    ///
    /// A failed handshake is returned as an error; the listener stays usable.
    pub async fn accept(&self, local: &Entity) -> Result<Conn, TransportError> {
        self.accept_stream().await?.handshake(local).await
    }
}

/// A TCP stream taken off a [`Listener`] whose peer has not identified
/// itself yet.
pub struct Accepted {
    stream: TcpStream,
    peer: SocketAddr,
    config: TransportConfig,
}

impl Accepted {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Exchange identities, bounded by the connect timeout.
    pub async fn handshake(self, local: &Entity) -> Result<Conn, TransportError> {
        let peer = self.peer;
        tokio::time::timeout(
            self.config.connect_timeout,
            Conn::handshake(self.stream, local, &self.config),
        )
        .await
        .map_err(|_| TransportError::Handshake(format!("timed out with {peer}")))?
    }
}

/// Open a connection to `remote`, trying each of its addresses in order.
///
/// The peer must present the identity we dialled; anything else is a
/// handshake failure.
pub async fn connect(
    local: &Entity,
    remote: &Entity,
    config: &TransportConfig,
) -> Result<Conn, TransportError> {
    if remote.addresses().is_empty() {
        return Err(TransportError::NoAddress(remote.id()));
    }

    let mut last_err = None;
    for addr in remote.addresses() {
        match connect_addr(local, addr, config).await {
            Ok(conn) if conn.remote().id() == remote.id() => return Ok(conn),
            Ok(conn) => {
                conn.close().await;
                last_err = Some(TransportError::Handshake(format!(
                    "{addr} answered as {}, expected {}",
                    conn.remote().id(),
                    remote.id()
                )));
            }
            Err(e) => {
                tracing::debug!(%addr, "connect attempt failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(TransportError::NoAddress(remote.id())))
}

async fn connect_addr(
    local: &Entity,
    addr: &str,
    config: &TransportConfig,
) -> Result<Conn, TransportError> {
    let attempt = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Conn::handshake(stream, local, config).await
    };
    tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            addr: addr.to_string(),
        })?
}
