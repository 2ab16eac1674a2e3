use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::counter::TrafficStats;
use crate::frame::{read_frame, write_frame};
use crate::{Entity, TransportConfig, TransportError};

/// An identified, framed connection to one remote [`Entity`].
///
/// Reads and writes are independent: one task may block in
/// [`receive`](Self::receive) while others [`send`](Self::send).
/// [`close`](Self::close) wakes a blocked reader with
/// [`TransportError::Closed`].
pub struct Conn {
    remote: Entity,
    peer_addr: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    max_message_size: usize,
    stats: TrafficStats,
}

impl Conn {
    /// Exchange identities over a fresh stream. Both sides write their own
    /// entity first, then read the peer's.
    pub(crate) async fn handshake(
        stream: TcpStream,
        local: &Entity,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = rmp_serde::to_vec(local)?;
        write_frame(&mut write_half, &hello, config.max_message_size).await?;

        let frame = read_frame(&mut read_half, config.max_message_size).await?;
        let remote: Entity = rmp_serde::from_slice(&frame)
            .map_err(|e| TransportError::Handshake(format!("bad identity frame: {e}")))?;

        tracing::debug!(peer = %peer_addr, remote = ?remote.id(), "handshake complete");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            remote,
            peer_addr,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            closed,
            max_message_size: config.max_message_size,
            stats: TrafficStats::default(),
        })
    }

    /// The identity the peer presented during the handshake.
    pub fn remote(&self) -> &Entity {
        &self.remote
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Encode `msg` as MessagePack and send it as one frame.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), TransportError> {
        let data = rmp_serde::to_vec_named(msg)?;
        self.send_bytes(&data).await
    }

    /// Send one raw frame.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, data, self.max_message_size).await?;
        self.stats.record_tx(data.len());
        Ok(())
    }

    /// Receive and decode the next frame.
    ///
    /// A [`TransportError::Decode`] leaves the stream usable; the caller may
    /// keep reading.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let data = self.receive_bytes().await?;
        Ok(rmp_serde::from_slice(&data)?)
    }

    /// Receive the next raw frame.
    pub async fn receive_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(TransportError::Closed),
            frame = read_frame(&mut *reader, self.max_message_size) => {
                let data = frame?;
                self.stats.record_rx(data.len());
                Ok(data)
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer_addr, "shutdown: {e}");
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("remote", &self.remote)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
