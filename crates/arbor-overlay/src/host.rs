/// Host: one network identity, its connections and its message pump.
///
/// Connection readers feed a shared inbound queue. A single pump task
/// drains it and dispatches each [`Packet`] by kind: protocol data goes to
/// the [`Overlay`], topology requests and responses drive reconciliation,
/// client and service traffic goes to the service layer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_transport::{Accepted, Entity, EntityId, KeyPair, Listener, TrafficSnapshot};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::config::HostConfig;
use crate::error::OverlayError;
use crate::message::Packet;
use crate::network::{Inbound, Network, Outbound};
use crate::overlay::{Overlay, OverlayStats};
use crate::protocol::ProtocolRegistry;
use crate::roster::Roster;
use crate::service::ServiceRegistry;
use crate::tree::Tree;

/// Snapshot of a host for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub entity: String,
    pub connections: usize,
    pub traffic: TrafficSnapshot,
    pub overlay: OverlayStats,
}

struct HostInner {
    entity: Entity,
    config: HostConfig,
    network: Arc<Network>,
    overlay: Arc<Overlay>,
    listener: parking_lot::Mutex<Option<Listener>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    processing: AtomicBool,
    closing: AtomicBool,
    quit: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// Handle to a host. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// A host that will listen on `address` once [`listen`](Self::listen)
    /// is called.
    pub fn new(
        keypair: KeyPair,
        address: &str,
        protocols: Arc<ProtocolRegistry>,
        services: &ServiceRegistry,
        config: HostConfig,
    ) -> Result<Self, OverlayError> {
        let entity = Entity::new(keypair.public(), address);
        Self::build(keypair, entity, None, protocols, services, config)
    }

    /// A host around an already bound listener; its entity advertises the
    /// listener's resolved address.
    pub fn with_listener(
        keypair: KeyPair,
        listener: Listener,
        protocols: Arc<ProtocolRegistry>,
        services: &ServiceRegistry,
        config: HostConfig,
    ) -> Result<Self, OverlayError> {
        let address = listener.local_addr()?.to_string();
        let entity = Entity::new(keypair.public(), address);
        Self::build(keypair, entity, Some(listener), protocols, services, config)
    }

    /// Bind `addr` (port 0 picks a free port) and build the host on it.
    pub async fn bind(
        keypair: KeyPair,
        addr: &str,
        protocols: Arc<ProtocolRegistry>,
        services: &ServiceRegistry,
        config: HostConfig,
    ) -> Result<Self, OverlayError> {
        let listener = Listener::bind(addr, config.transport.clone()).await?;
        Self::with_listener(keypair, listener, protocols, services, config)
    }

    fn build(
        keypair: KeyPair,
        entity: Entity,
        listener: Option<Listener>,
        protocols: Arc<ProtocolRegistry>,
        services: &ServiceRegistry,
        config: HostConfig,
    ) -> Result<Self, OverlayError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let network = Arc::new(Network::new(
            entity.clone(),
            config.transport.clone(),
            inbound_tx,
        ));
        let outbound: Arc<dyn Outbound> = Arc::new(network.clone());
        let overlay = Overlay::new(keypair, outbound, protocols, &config);
        overlay.start_services(services)?;

        let (quit, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(HostInner {
                entity,
                config,
                network,
                overlay,
                listener: parking_lot::Mutex::new(listener),
                inbound: tokio::sync::Mutex::new(inbound_rx),
                processing: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                quit,
                closed,
            }),
        })
    }

    pub fn entity(&self) -> &Entity {
        &self.inner.entity
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.inner.overlay
    }

    pub fn keypair(&self) -> &KeyPair {
        self.inner.overlay.keypair()
    }

    // ── Network ─────────────────────────────────────────────────────

    /// Start accepting connections. Failing to bind is fatal for the host.
    pub async fn listen(&self) -> Result<(), OverlayError> {
        let existing = self.inner.listener.lock().take();
        let listener = match existing {
            Some(listener) => listener,
            None => {
                Listener::bind(
                    self.inner.entity.address(),
                    self.inner.config.transport.clone(),
                )
                .await?
            }
        };
        tracing::info!(entity = %self.inner.entity, "listening");
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        Ok(())
    }

    /// Connect to `remote` unless a live connection already exists.
    pub async fn connect(&self, remote: &Entity) -> Result<(), OverlayError> {
        self.inner.network.connect(remote).await.map(|_| ())
    }

    /// Send one packet, connecting first if needed.
    pub async fn send_raw(&self, to: &Entity, packet: Packet) -> Result<(), OverlayError> {
        self.inner.network.send_raw(to, packet).await
    }

    pub fn is_connected(&self, id: &EntityId) -> bool {
        self.inner.network.is_connected(id)
    }

    // ── Topology ────────────────────────────────────────────────────

    pub async fn register_tree(&self, tree: Arc<Tree>) {
        self.inner.overlay.register_tree(tree).await
    }

    pub async fn register_roster(&self, roster: Arc<Roster>) {
        self.inner.overlay.register_roster(roster).await
    }

    // ── Processing ──────────────────────────────────────────────────

    /// Spawn the message pump. Calling it again has no effect.
    pub fn start_processing(&self) {
        if self.inner.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(pump(self.inner.clone()));
    }

    /// Take the next inbound packet without the pump. Returns `None` once
    /// the host is closed. Blocks while the pump is running.
    pub async fn receive(&self) -> Option<Inbound> {
        let mut inbound = self.inner.inbound.lock().await;
        let mut quit = self.inner.quit.subscribe();
        if *quit.borrow() {
            return None;
        }
        tokio::select! {
            _ = quit.changed() => None,
            item = inbound.recv() => item,
        }
    }

    /// Dispatch one inbound packet, as the pump does.
    pub async fn process(&self, item: Inbound) {
        self.inner.process(item).await
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            entity: self.inner.entity.to_string(),
            connections: self.inner.network.connection_count(),
            traffic: self.inner.network.traffic(),
            overlay: self.inner.overlay.stats(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop the pump, close every connection and shut the overlay down.
    /// A second call fails with [`OverlayError::AlreadyClosing`].
    pub async fn close(&self) -> Result<(), OverlayError> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return Err(OverlayError::AlreadyClosing);
        }
        tracing::info!(entity = %self.inner.entity, "closing host");
        self.inner.quit.send_replace(true);
        self.inner.network.close().await;
        self.inner.overlay.close();
        self.inner.closed.send_replace(true);
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has completed.
    pub async fn wait_for_close(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("entity", &self.inner.entity)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl HostInner {
    async fn process(&self, item: Inbound) {
        let Inbound { from, packet } = item;
        let overlay = &self.overlay;
        let result = match packet {
            Packet::Data(mut msg) => {
                msg.entity = Some(from.clone());
                overlay.transmit_msg(msg).await
            }
            Packet::RequestTree(req) => overlay.handle_tree_request(&from, req).await,
            Packet::SendTree(resp) => overlay.handle_tree_response(&from, resp).await,
            Packet::RequestRoster(req) => overlay.handle_roster_request(&from, req).await,
            Packet::SendRoster(resp) => {
                overlay.handle_roster_response(&from, resp).await;
                Ok(())
            }
            Packet::ClientRequest(req) => {
                overlay.handle_client_request(from.clone(), req);
                Ok(())
            }
            Packet::ServiceMessage(msg) => {
                overlay.handle_service_message(from.clone(), msg);
                Ok(())
            }
            Packet::ClientReply(reply) => {
                tracing::debug!(from = %from, service = %reply.service, "client reply at a host dropped");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(from = %from, "processing packet: {e}");
        }
    }
}

async fn pump(inner: Arc<HostInner>) {
    let mut inbound = inner.inbound.lock().await;
    let mut quit = inner.quit.subscribe();
    let mut sweep = tokio::time::interval(inner.config.pending_sweep_interval);
    // Skip the immediate first tick
    sweep.tick().await;

    if *quit.borrow() {
        return;
    }
    tracing::debug!(entity = %inner.entity, "pump started");
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            item = inbound.recv() => match item {
                Some(item) => inner.process(item).await,
                None => break,
            },
            _ = sweep.tick() => {
                inner.overlay.evict_expired();
            }
        }
    }
    tracing::debug!(entity = %inner.entity, "pump stopped");
}

async fn accept_loop(inner: Arc<HostInner>, listener: Listener) {
    let mut quit = inner.quit.subscribe();
    if *quit.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            accepted = listener.accept_stream() => match accepted {
                Ok(accepted) => {
                    tokio::spawn(admit(inner.clone(), accepted));
                }
                Err(e) if inner.closing.load(Ordering::Acquire) => {
                    tracing::debug!("accept stopped: {e}");
                    break;
                }
                Err(e) => tracing::warn!(entity = %inner.entity, "accept failed: {e}"),
            },
        }
    }
}

/// Handshake one accepted stream off the accept loop, then track it.
async fn admit(inner: Arc<HostInner>, accepted: Accepted) {
    let peer = accepted.peer_addr();
    match accepted.handshake(&inner.entity).await {
        Ok(conn) => {
            tracing::debug!(local = %inner.entity, remote = %conn.remote(), "accepted");
            inner.network.register(conn);
        }
        Err(e) => tracing::warn!(entity = %inner.entity, %peer, "handshake failed: {e}"),
    }
}
