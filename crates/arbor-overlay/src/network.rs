/// Outbound seam of the overlay and the host's connection table.
///
/// In production the [`Network`] owns one [`Conn`] per peer and a reader
/// task per connection feeding the host's inbound queue.
/// In tests, `mock::MockOutbound` records what would have been sent.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_transport::{connect, Conn, Entity, EntityId, TrafficSnapshot, TransportConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::OverlayError;
use crate::message::Packet;

/// Where the overlay sends packets.
#[async_trait::async_trait]
pub trait Outbound: Send + Sync {
    /// Send a packet to `to`, connecting first if needed.
    async fn send_raw(&self, to: &Entity, packet: Packet) -> Result<(), OverlayError>;

    /// Identity packets are sent from.
    fn local(&self) -> &Entity;
}

/// One packet taken off a connection, tagged with the sender.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: Entity,
    pub packet: Packet,
}

// ── Network (production) ────────────────────────────────────────────

pub(crate) struct Network {
    local: Entity,
    config: TransportConfig,
    /// Network lock: connections by peer, newest last. A superseded
    /// connection stays here until its reader ends so `close` reaches it.
    connections: Mutex<HashMap<EntityId, Vec<Arc<Conn>>>>,
    /// One dial at a time per peer.
    dialing: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>,
    inbound: mpsc::Sender<Inbound>,
    closing: AtomicBool,
}

impl Network {
    pub fn new(local: Entity, config: TransportConfig, inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            local,
            config,
            connections: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashMap::new()),
            inbound,
            closing: AtomicBool::new(false),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Existing live connection to `remote`, or a fresh one. Concurrent
    /// callers for the same peer share a single dial.
    pub async fn connect(self: &Arc<Self>, remote: &Entity) -> Result<Arc<Conn>, OverlayError> {
        if self.is_closing() {
            return Err(OverlayError::Shutdown);
        }
        if let Some(conn) = self.connection(&remote.id()) {
            return Ok(conn);
        }

        let gate = self.dialing.lock().entry(remote.id()).or_default().clone();
        let result = {
            let _dial = gate.lock().await;
            self.dial(remote).await
        };

        let mut dialing = self.dialing.lock();
        // The map and this call hold the only references: nobody else waits.
        if Arc::strong_count(&gate) == 2 {
            dialing.remove(&remote.id());
        }
        result
    }

    async fn dial(self: &Arc<Self>, remote: &Entity) -> Result<Arc<Conn>, OverlayError> {
        if let Some(conn) = self.connection(&remote.id()) {
            return Ok(conn);
        }
        let conn = connect(&self.local, remote, &self.config).await?;
        tracing::debug!(local = %self.local, remote = %remote, "connected");
        let conn = self.register(conn);
        if self.is_closing() {
            return Err(OverlayError::Shutdown);
        }
        Ok(conn)
    }

    pub fn connection(&self, id: &EntityId) -> Option<Arc<Conn>> {
        self.connections
            .lock()
            .get(id)?
            .iter()
            .rev()
            .find(|c| !c.is_closed())
            .cloned()
    }

    pub fn is_connected(&self, id: &EntityId) -> bool {
        self.connection(id).is_some()
    }

    /// Track `conn` under its remote identity and start its reader.
    pub fn register(self: &Arc<Self>, conn: Conn) -> Arc<Conn> {
        let conn = Arc::new(conn);
        let remote = conn.remote().id();
        {
            let mut conns = self.connections.lock();
            // `close` sets the flag before draining under this lock.
            if self.is_closing() {
                drop(conns);
                let late = conn.clone();
                tokio::spawn(async move { late.close().await });
                return conn;
            }
            conns.entry(remote).or_default().push(conn.clone());
        }

        let network = self.clone();
        let reader = conn.clone();
        tokio::spawn(async move {
            network.read_loop(&reader).await;
            network.unregister(&reader);
        });
        conn
    }

    /// Reads packets until the connection ends. Disconnects end the loop
    /// quietly; a malformed frame is dropped and reading continues.
    async fn read_loop(&self, conn: &Conn) {
        let from = conn.remote().clone();
        loop {
            match conn.receive::<Packet>().await {
                Ok(packet) => {
                    tracing::debug!(from = %from, kind = packet.kind(), "packet received");
                    let item = Inbound {
                        from: from.clone(),
                        packet,
                    };
                    if self.inbound.send(item).await.is_err() {
                        tracing::debug!("inbound queue closed, stopping reader for {from}");
                        return;
                    }
                }
                Err(e) if e.is_decode() => {
                    tracing::warn!(from = %from, "dropping undecodable packet: {e}");
                }
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(from = %from, "connection ended: {e}");
                    return;
                }
                Err(e) => {
                    tracing::error!(from = %from, "connection failed: {e}");
                    return;
                }
            }
        }
    }

    fn unregister(&self, conn: &Arc<Conn>) {
        let id = conn.remote().id();
        let mut conns = self.connections.lock();
        if let Some(list) = conns.get_mut(&id) {
            list.retain(|c| !Arc::ptr_eq(c, conn));
            if list.is_empty() {
                conns.remove(&id);
            }
        }
    }

    /// Number of tracked connections, superseded ones included.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().values().map(Vec::len).sum()
    }

    /// Sum of the traffic counters of every live connection.
    pub fn traffic(&self) -> TrafficSnapshot {
        let mut total = TrafficSnapshot::default();
        for conn in self.connections.lock().values().flatten() {
            total += conn.stats().snapshot();
        }
        total
    }

    /// Close every connection; later sends fail with `Shutdown`.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let conns: Vec<_> = self
            .connections
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

#[async_trait::async_trait]
impl Outbound for Arc<Network> {
    async fn send_raw(&self, to: &Entity, packet: Packet) -> Result<(), OverlayError> {
        if to.id() == self.local.id() {
            let item = Inbound {
                from: self.local.clone(),
                packet,
            };
            // Never wait on our own queue: the caller may be its consumer.
            return self.inbound.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => OverlayError::InboundFull,
                mpsc::error::TrySendError::Closed(_) => OverlayError::Shutdown,
            });
        }

        let conn = self.connect(to).await?;
        if let Err(e) = conn.send(&packet).await {
            tracing::warn!(to = %to, kind = packet.kind(), "send failed: {e}");
            self.unregister(&conn);
            conn.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    fn local(&self) -> &Entity {
        &self.local
    }
}

// ── MockOutbound (tests) ────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Outbound that records every packet instead of sending it.
    #[derive(Clone)]
    pub struct MockOutbound {
        local: Entity,
        sent: Arc<Mutex<Vec<(EntityId, Packet)>>>,
        fail_sends: Arc<Mutex<bool>>,
    }

    impl MockOutbound {
        pub fn new(local: Entity) -> Self {
            Self {
                local,
                sent: Arc::new(Mutex::new(Vec::new())),
                fail_sends: Arc::new(Mutex::new(false)),
            }
        }

        pub fn sent(&self) -> Vec<(EntityId, Packet)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            *self.fail_sends.lock().unwrap() = fail;
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait::async_trait]
    impl Outbound for MockOutbound {
        async fn send_raw(&self, to: &Entity, packet: Packet) -> Result<(), OverlayError> {
            if *self.fail_sends.lock().unwrap() {
                return Err(OverlayError::Transport(
                    arbor_transport::TransportError::Closed,
                ));
            }
            self.sent.lock().unwrap().push((to.id(), packet));
            Ok(())
        }

        fn local(&self) -> &Entity {
            &self.local
        }
    }
}
