/// Overlay: per-host registry of trees, rosters and live protocol instances.
///
/// Routes protocol data to the [`TreeNodeInstance`] named by the
/// destination token, creating the instance on first contact, and runs the
/// reconciliation that fetches missing trees and rosters from the sender.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_transport::{Entity, KeyPair};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::HostConfig;
use crate::error::OverlayError;
use crate::ids::{MessageTypeId, ProtocolId, RosterId, RoundId, ServiceId, TokenId, TreeId};
use crate::instance::TreeNodeInstance;
use crate::message::{
    ClientReply, ClientRequest, Packet, ProtocolMessage, ProtocolMsg, RequestRoster, RequestTree,
    SendRoster, SendTree, ServiceMessage,
};
use crate::network::Outbound;
use crate::pending::{Pending, PendingStats};
use crate::protocol::{ProtocolInstance, ProtocolRegistry};
use crate::roster::Roster;
use crate::service::{Service, ServiceContext, ServiceRegistry};
use crate::token::Token;
use crate::tree::{Tree, TreeNode};

struct Instances {
    live: HashMap<TokenId, TreeNodeInstance>,
    /// Tokens of completed instances; late traffic for them is dropped.
    finished: LruCache<TokenId, ()>,
}

/// Outcome of routing one data message against the tree registry.
enum Routed {
    Ready(Arc<Tree>, ProtocolMsg),
    Parked {
        from: Option<Entity>,
        tree: TreeId,
        request: bool,
    },
}

/// Registry sizes, for status reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStats {
    pub trees: usize,
    pub rosters: usize,
    pub instances: usize,
    pub finished: usize,
    pub pending: PendingStats,
}

pub struct Overlay {
    entity: Entity,
    keypair: KeyPair,
    outbound: Arc<dyn Outbound>,
    protocols: Arc<ProtocolRegistry>,
    services: RwLock<HashMap<ServiceId, Arc<dyn Service>>>,
    trees: RwLock<HashMap<TreeId, Arc<Tree>>>,
    rosters: RwLock<HashMap<RosterId, Arc<Roster>>>,
    instances: Mutex<Instances>,
    /// Serializes instance creation for incoming data.
    transmit: Mutex<()>,
    pending: Pending,
    pending_timeout: Duration,
    closed: AtomicBool,
}

impl Overlay {
    pub fn new(
        keypair: KeyPair,
        outbound: Arc<dyn Outbound>,
        protocols: Arc<ProtocolRegistry>,
        config: &HostConfig,
    ) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.finished_capacity).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            entity: outbound.local().clone(),
            keypair,
            outbound,
            protocols,
            services: RwLock::new(HashMap::new()),
            trees: RwLock::new(HashMap::new()),
            rosters: RwLock::new(HashMap::new()),
            instances: Mutex::new(Instances {
                live: HashMap::new(),
                finished: LruCache::new(capacity),
            }),
            transmit: Mutex::new(()),
            pending: Pending::default(),
            pending_timeout: config.pending_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Build this host's instance of every registered service.
    pub fn start_services(self: &Arc<Self>, registry: &ServiceRegistry) -> Result<(), OverlayError> {
        for (id, name, factory) in registry.factories() {
            let ctx = ServiceContext::new(Arc::downgrade(self), id, name.clone());
            let service = factory(ctx)?;
            self.services.write().insert(id, service);
            tracing::debug!(service = %name, entity = %self.entity, "service started");
        }
        Ok(())
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    pub fn service(&self, id: ServiceId) -> Option<Arc<dyn Service>> {
        self.services.read().get(&id).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ── Topology registry ───────────────────────────────────────────

    pub fn tree(&self, id: TreeId) -> Option<Arc<Tree>> {
        self.trees.read().get(&id).cloned()
    }

    pub fn roster(&self, id: RosterId) -> Option<Arc<Roster>> {
        self.rosters.read().get(&id).cloned()
    }

    /// Insert without replaying pending traffic.
    fn store_tree(&self, tree: &Arc<Tree>) {
        self.rosters
            .write()
            .entry(tree.roster().id())
            .or_insert_with(|| tree.roster().clone());
        self.trees
            .write()
            .entry(tree.id())
            .or_insert_with(|| tree.clone());
    }

    /// Register `tree` (and its roster), then replay data that was waiting
    /// for it, in arrival order.
    pub async fn register_tree(self: &Arc<Self>, tree: Arc<Tree>) {
        self.store_tree(&tree);
        let ready = self.pending.take_for_tree(tree.id());
        if !ready.is_empty() {
            tracing::debug!(tree = %tree.id(), count = ready.len(), "replaying pending data");
        }
        for msg in ready {
            if let Err(e) = self.transmit_msg(msg).await {
                tracing::error!(tree = %tree.id(), "replaying pending data: {e}");
            }
        }
    }

    /// Register `roster`, then build every tree that was waiting for it.
    pub async fn register_roster(self: &Arc<Self>, roster: Arc<Roster>) {
        let id = roster.id();
        self.rosters.write().entry(id).or_insert_with(|| roster.clone());
        for marshal in self.pending.take_trees(id) {
            match marshal.make_tree(roster.clone()) {
                Ok(tree) => self.register_tree(Arc::new(tree)).await,
                Err(e) => tracing::error!(roster = %id, "building pending tree: {e}"),
            }
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────

    pub async fn handle_tree_request(
        &self,
        from: &Entity,
        req: RequestTree,
    ) -> Result<(), OverlayError> {
        let tree = self.tree(req.tree_id);
        if tree.is_none() {
            tracing::debug!(tree = %req.tree_id, to = %from, "unknown tree requested");
        }
        let reply = SendTree {
            tree_id: req.tree_id,
            tree: tree.map(|t| t.marshal()),
        };
        self.outbound.send_raw(from, Packet::SendTree(reply)).await
    }

    pub async fn handle_tree_response(
        self: &Arc<Self>,
        from: &Entity,
        resp: SendTree,
    ) -> Result<(), OverlayError> {
        let Some(marshal) = resp.tree else {
            tracing::warn!(tree = %resp.tree_id, from = %from, "peer does not know the tree");
            self.pending.clear_request(resp.tree_id);
            return Ok(());
        };
        if self.tree(marshal.tree_id).is_some() {
            return Ok(());
        }

        match self.roster(marshal.roster_id) {
            Some(roster) => {
                let tree = marshal.make_tree(roster)?;
                self.register_tree(Arc::new(tree)).await;
                Ok(())
            }
            None => {
                let roster_id = marshal.roster_id;
                if self.pending.park_tree(marshal) {
                    tracing::debug!(roster = %roster_id, to = %from, "requesting roster");
                    let req = Packet::RequestRoster(RequestRoster { roster_id });
                    if let Err(e) = self.outbound.send_raw(from, req).await {
                        self.drop_parked_trees(roster_id);
                        return Err(e);
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn handle_roster_request(
        &self,
        from: &Entity,
        req: RequestRoster,
    ) -> Result<(), OverlayError> {
        let reply = SendRoster {
            roster_id: req.roster_id,
            roster: self.roster(req.roster_id).map(|r| (*r).clone()),
        };
        self.outbound.send_raw(from, Packet::SendRoster(reply)).await
    }

    pub async fn handle_roster_response(self: &Arc<Self>, from: &Entity, resp: SendRoster) {
        match resp.roster {
            Some(roster) => self.register_roster(Arc::new(roster)).await,
            None => {
                let dropped = self.drop_parked_trees(resp.roster_id);
                tracing::warn!(
                    roster = %resp.roster_id,
                    from = %from,
                    dropped,
                    "peer does not know the roster"
                );
            }
        }
    }

    /// Forget the trees waiting on `roster` so a later message for any of
    /// them starts over with a fresh tree request.
    fn drop_parked_trees(&self, roster: RosterId) -> usize {
        let trees = self.pending.take_trees(roster);
        for marshal in &trees {
            self.pending.clear_request(marshal.tree_id);
        }
        trees.len()
    }

    // ── Data routing ────────────────────────────────────────────────

    /// Park `msg` unless its tree is known. The check happens under the
    /// pending lock so a concurrent [`register_tree`](Self::register_tree)
    /// either sees the parked message or is seen by it.
    fn route(&self, msg: ProtocolMsg) -> Routed {
        let tree_id = msg.to.tree_id();
        let mut data = self.pending.data();
        match self.tree(tree_id) {
            Some(tree) => Routed::Ready(tree, msg),
            None => {
                let from = msg.entity.clone();
                let request = data.park(msg);
                Routed::Parked {
                    from,
                    tree: tree_id,
                    request,
                }
            }
        }
    }

    /// Deliver protocol data to its instance, creating the instance if this
    /// is the first message of its round here.
    pub async fn transmit_msg(self: &Arc<Self>, msg: ProtocolMsg) -> Result<(), OverlayError> {
        if self.is_closed() {
            return Err(OverlayError::Shutdown);
        }

        let (tree, msg) = match self.route(msg) {
            Routed::Ready(tree, msg) => (tree, msg),
            Routed::Parked {
                from,
                tree,
                request,
            } => {
                if request {
                    self.request_tree(from, tree).await;
                }
                return Ok(());
            }
        };

        let Some(tni) = self.instance_for(&tree, &msg.to)? else {
            tracing::debug!(token = ?msg.to, "data for finished instance dropped");
            return Ok(());
        };
        tni.process(msg);
        Ok(())
    }

    async fn request_tree(&self, from: Option<Entity>, tree: TreeId) {
        let Some(from) = from else {
            tracing::warn!(tree = %tree, "unknown tree and no sender to ask");
            self.pending.clear_request(tree);
            return;
        };
        tracing::debug!(tree = %tree, to = %from, "requesting tree");
        let req = Packet::RequestTree(RequestTree { tree_id: tree });
        if let Err(e) = self.outbound.send_raw(&from, req).await {
            tracing::error!(tree = %tree, to = %from, "tree request failed: {e}");
            self.pending.clear_request(tree);
        }
    }

    /// Existing live instance for `token`, a freshly created and bound one,
    /// or `None` if the round already finished here.
    fn instance_for(
        self: &Arc<Self>,
        tree: &Arc<Tree>,
        token: &Token,
    ) -> Result<Option<TreeNodeInstance>, OverlayError> {
        let _creating = self.transmit.lock();
        let id = token.id();
        {
            let instances = self.instances.lock();
            if instances.finished.contains(&id) {
                return Ok(None);
            }
            if let Some(tni) = instances.live.get(&id) {
                return Ok(Some(tni.clone()));
            }
        }

        let node = tree
            .search(&token.tree_node_id())
            .ok_or(OverlayError::UnknownTreeNode(token.tree_node_id()))?;
        let tni = self.insert_instance(token.clone(), node);
        tracing::debug!(entity = %self.entity, token = ?token, "creating instance");

        let bound = self
            .instantiate(&tni)
            .and_then(|pi| self.bind_and_dispatch(pi));
        if let Err(e) = bound {
            self.instances.lock().live.remove(&id);
            tni.halt();
            return Err(e);
        }
        Ok(Some(tni))
    }

    /// Ask the token's service first, then the protocol registry.
    fn instantiate(&self, tni: &TreeNodeInstance) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let token = tni.token();
        if let Some(service) = self.service(token.service_id()) {
            if let Some(pi) = service.new_protocol(tni.clone())? {
                return Ok(pi);
            }
        }
        self.protocols.instantiate(token.protocol_id(), tni.clone())
    }

    fn insert_instance(self: &Arc<Self>, token: Token, node: TreeNode) -> TreeNodeInstance {
        let name = self
            .protocols
            .name(token.protocol_id())
            .unwrap_or_else(|| token.protocol_id().to_string());
        let tni = TreeNodeInstance::new(Arc::downgrade(self), token.clone(), node, name);
        self.instances.lock().live.insert(token.id(), tni.clone());
        tni
    }

    fn bind_and_dispatch(&self, pi: Arc<dyn ProtocolInstance>) -> Result<(), OverlayError> {
        self.register_protocol_instance(pi.clone())?;
        tokio::spawn(async move {
            if let Err(e) = pi.dispatch().await {
                tracing::error!(protocol = pi.tree_node_instance().protocol_name(), "dispatch: {e}");
            }
        });
        Ok(())
    }

    // ── Instances ───────────────────────────────────────────────────

    /// A new round of `protocol` at `node`. Registers the tree locally so
    /// that peers can fetch it.
    pub fn new_tree_node_instance(
        self: &Arc<Self>,
        tree: &Arc<Tree>,
        node: &TreeNode,
        protocol: ProtocolId,
        service: ServiceId,
    ) -> Result<TreeNodeInstance, OverlayError> {
        if self.is_closed() {
            return Err(OverlayError::Shutdown);
        }
        let node = tree
            .search(&node.id())
            .ok_or(OverlayError::UnknownTreeNode(node.id()))?;
        self.store_tree(tree);
        let token = Token::new(
            tree.roster().id(),
            tree.id(),
            protocol,
            service,
            RoundId::random(),
            node.id(),
        );
        Ok(self.insert_instance(token, node))
    }

    /// Bind `pi` to its tree node instance.
    pub fn register_protocol_instance(
        &self,
        pi: Arc<dyn ProtocolInstance>,
    ) -> Result<(), OverlayError> {
        let id = pi.tree_node_instance().token_id();
        let tni = self
            .instances
            .lock()
            .live
            .get(&id)
            .cloned()
            .ok_or(OverlayError::UnknownInstance)?;
        tni.bind(pi)?;
        tracing::debug!(entity = %self.entity, token = %id, "protocol instance bound");
        Ok(())
    }

    pub fn create_protocol(
        self: &Arc<Self>,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.create_protocol_service(name, tree, ServiceId::nil())
    }

    /// Instantiate `name` at the root of `tree`, tagged with `service`.
    pub fn create_protocol_service(
        self: &Arc<Self>,
        name: &str,
        tree: &Arc<Tree>,
        service: ServiceId,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let protocol = self
            .protocols
            .id(name)
            .ok_or_else(|| OverlayError::UnknownProtocol(name.to_string()))?;
        let tni = self.new_tree_node_instance(tree, &tree.root(), protocol, service)?;
        let created = self
            .protocols
            .instantiate(protocol, tni.clone())
            .and_then(|pi| self.bind_and_dispatch(pi.clone()).map(|()| pi));
        if created.is_err() {
            self.instances.lock().live.remove(&tni.token_id());
            tni.halt();
        }
        created
    }

    /// Create `name` at the root of `tree` and run its `start`.
    pub async fn start_protocol(
        self: &Arc<Self>,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let pi = self.create_protocol(name, tree)?;
        tracing::info!(protocol = name, tree = %tree.id(), "starting protocol");
        pi.start().await?;
        Ok(pi)
    }

    pub async fn send_to_tree_node<M: ProtocolMessage>(
        &self,
        from: &Token,
        to: &TreeNode,
        msg: &M,
    ) -> Result<(), OverlayError> {
        let payload = rmp_serde::to_vec_named(msg)?;
        self.send_encoded(from, to, M::message_type(), payload).await
    }

    pub(crate) async fn send_encoded(
        &self,
        from: &Token,
        to: &TreeNode,
        msg_type: MessageTypeId,
        payload: Vec<u8>,
    ) -> Result<(), OverlayError> {
        let msg = ProtocolMsg {
            from: from.clone(),
            to: from.change_tree_node_id(to.id()),
            msg_type,
            payload,
            entity: None,
        };
        self.outbound.send_raw(to.entity(), Packet::Data(msg)).await
    }

    /// Retire the instance for `token` and remember it as finished.
    pub async fn node_done(&self, token: &Token) {
        let id = token.id();
        let tni = {
            let mut instances = self.instances.lock();
            instances.finished.put(id, ());
            instances.live.remove(&id)
        };
        match tni {
            Some(tni) => {
                tracing::debug!(entity = %self.entity, token = %id, "instance done");
                if let Err(e) = tni.close().await {
                    tracing::error!(token = %id, "closing instance: {e}");
                }
            }
            None => tracing::debug!(token = %id, "instance already gone"),
        }
    }

    pub fn instance(&self, token: TokenId) -> Option<TreeNodeInstance> {
        self.instances.lock().live.get(&token).cloned()
    }

    pub fn instances(&self) -> Vec<TreeNodeInstance> {
        self.instances.lock().live.values().cloned().collect()
    }

    // ── Services ────────────────────────────────────────────────────

    /// Run a client request on its service in a task of its own. A failed
    /// request is answered with an error reply.
    pub(crate) fn handle_client_request(&self, from: Entity, req: ClientRequest) {
        let Some(service) = self.service(req.service) else {
            tracing::warn!(service = %req.service, from = %from, "request for unknown service dropped");
            return;
        };
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let id = req.service;
            if let Err(e) = service.process_client_request(&from, req).await {
                tracing::debug!(service = %id, from = %from, "client request failed: {e}");
                let reply = Packet::ClientReply(ClientReply::error(id, e.to_string()));
                if let Err(e) = outbound.send_raw(&from, reply).await {
                    tracing::warn!(to = %from, "sending error reply: {e}");
                }
            }
        });
    }

    pub(crate) fn handle_service_message(&self, from: Entity, msg: ServiceMessage) {
        let Some(service) = self.service(msg.service) else {
            tracing::warn!(service = %msg.service, from = %from, "message for unknown service dropped");
            return;
        };
        tokio::spawn(async move {
            let id = msg.service;
            if let Err(e) = service.process_service_message(&from, msg).await {
                tracing::warn!(service = %id, from = %from, "service message failed: {e}");
            }
        });
    }

    // ── Housekeeping ────────────────────────────────────────────────

    /// Drop pending entries older than the configured timeout.
    pub fn evict_expired(&self) -> (usize, usize) {
        let (data, trees) = self.pending.evict_expired(self.pending_timeout);
        if data + trees > 0 {
            tracing::warn!(data, trees, "evicted pending entries whose topology never arrived");
        }
        (data, trees)
    }

    pub fn stats(&self) -> OverlayStats {
        let (instances, finished) = {
            let i = self.instances.lock();
            (i.live.len(), i.finished.len())
        };
        OverlayStats {
            trees: self.trees.read().len(),
            rosters: self.rosters.read().len(),
            instances,
            finished,
            pending: self.pending.stats(),
        }
    }

    /// Stop routing and drop pending buffers. Live instances are left to
    /// their protocols.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.clear();
        tracing::debug!(entity = %self.entity, "overlay closed");
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("entity", &self.entity)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Incoming;
    use crate::network::mock::MockOutbound;
    use tokio::sync::mpsc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl ProtocolMessage for Ping {
        const NAME: &'static str = "test.Ping";
    }

    struct Recorder {
        tni: TreeNodeInstance,
    }

    #[async_trait::async_trait]
    impl ProtocolInstance for Recorder {
        fn tree_node_instance(&self) -> &TreeNodeInstance {
            &self.tni
        }
    }

    fn entity(seed: &str, addr: &str) -> (KeyPair, Entity) {
        let kp = KeyPair::from_seed(seed.as_bytes());
        let e = Entity::new(kp.public(), addr);
        (kp, e)
    }

    /// Roster [a, b, c] on distinct hosts; binary tree rooted at a.
    fn topology() -> (KeyPair, Vec<Entity>, Arc<Roster>, Arc<Tree>) {
        let (kp, a) = entity("a", "10.0.0.1:7000");
        let (_, b) = entity("b", "10.0.0.2:7000");
        let (_, c) = entity("c", "10.0.0.3:7000");
        let roster = Arc::new(Roster::new(vec![a.clone(), b.clone(), c.clone()]));
        let tree = Arc::new(roster.generate_binary_tree().unwrap());
        (kp, vec![a, b, c], roster, tree)
    }

    /// Overlay at `a` with a "seq" protocol forwarding every Ping seq and a
    /// "sum" protocol forwarding the seq total of each aggregated batch.
    fn setup(kp: KeyPair, local: &Entity) -> (Arc<Overlay>, MockOutbound, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let protocols = Arc::new(ProtocolRegistry::new());

        let seq_tx = tx.clone();
        protocols
            .register("seq", move |tni| {
                let tx = seq_tx.clone();
                tni.register_handler(move |m: Incoming<Ping>| {
                    let _ = tx.send(m.msg.seq);
                    Ok(())
                })?;
                Ok(Arc::new(Recorder { tni }) as Arc<dyn ProtocolInstance>)
            })
            .unwrap();
        protocols
            .register("sum", move |tni| {
                let tx = tx.clone();
                tni.register_handler_aggregate(move |batch: Vec<Incoming<Ping>>| {
                    let _ = tx.send(batch.iter().map(|m| m.msg.seq).sum());
                    Ok(())
                })?;
                Ok(Arc::new(Recorder { tni }) as Arc<dyn ProtocolInstance>)
            })
            .unwrap();

        let mock = MockOutbound::new(local.clone());
        let overlay = Overlay::new(kp, Arc::new(mock.clone()), protocols, &HostConfig::new());
        (overlay, mock, rx)
    }

    /// Data from `from_index` (a tree position) to the root for `protocol`.
    fn data(tree: &Arc<Tree>, protocol: &str, round: RoundId, from_index: usize, seq: u32) -> ProtocolMsg {
        let nodes = tree.list();
        let to = Token::new(
            tree.roster().id(),
            tree.id(),
            ProtocolId::from_name(protocol),
            ServiceId::nil(),
            round,
            nodes[0].id(),
        );
        let from = to.change_tree_node_id(nodes[from_index].id());
        let mut msg = ProtocolMsg::new(from, to, &Ping { seq }).unwrap();
        msg.entity = Some(nodes[from_index].entity().clone());
        msg
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<u32>) -> u32 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_reconciliation_requests_once_and_replays_in_order() {
        let (kp, entities, roster, tree) = topology();
        let (overlay, mock, mut rx) = setup(kp, &entities[0]);
        let round = RoundId::random();

        overlay.transmit_msg(data(&tree, "seq", round, 1, 1)).await.unwrap();
        overlay.transmit_msg(data(&tree, "seq", round, 1, 2)).await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 1, "one tree request for two messages");
        assert_eq!(sent[0].0, entities[1].id());
        assert!(matches!(&sent[0].1, Packet::RequestTree(r) if r.tree_id == tree.id()));
        assert_eq!(overlay.stats().pending.data, 2);
        mock.clear_sent();

        // Tree arrives before its roster.
        let resp = SendTree {
            tree_id: tree.id(),
            tree: Some(tree.marshal()),
        };
        overlay.handle_tree_response(&entities[1], resp).await.unwrap();
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, Packet::RequestRoster(r) if r.roster_id == roster.id()));
        assert_eq!(overlay.stats().pending.trees, 1);

        let resp = SendRoster {
            roster_id: roster.id(),
            roster: Some((*roster).clone()),
        };
        overlay.handle_roster_response(&entities[1], resp).await;

        assert_eq!(next(&mut rx).await, 1);
        assert_eq!(next(&mut rx).await, 2);
        assert_eq!(overlay.stats().pending, PendingStats::default());
        assert_eq!(overlay.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_tree_response_allows_new_request() {
        let (kp, entities, _, tree) = topology();
        let (overlay, mock, _rx) = setup(kp, &entities[0]);
        let round = RoundId::random();

        overlay.transmit_msg(data(&tree, "seq", round, 1, 1)).await.unwrap();
        let empty = SendTree {
            tree_id: tree.id(),
            tree: None,
        };
        overlay.handle_tree_response(&entities[1], empty).await.unwrap();
        overlay.transmit_msg(data(&tree, "seq", round, 2, 2)).await.unwrap();

        let requests = mock
            .sent()
            .iter()
            .filter(|(_, p)| matches!(p, Packet::RequestTree(_)))
            .count();
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_aggregation_waits_for_every_child() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, mut rx) = setup(kp, &entities[0]);
        overlay.register_tree(tree.clone()).await;
        let round = RoundId::random();

        overlay.transmit_msg(data(&tree, "sum", round, 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no partial flush");

        overlay.transmit_msg(data(&tree, "sum", round, 2, 2)).await.unwrap();
        assert_eq!(next(&mut rx).await, 3);

        // A fresh set of children's messages makes a fresh batch.
        overlay.transmit_msg(data(&tree, "sum", round, 2, 3)).await.unwrap();
        overlay.transmit_msg(data(&tree, "sum", round, 1, 4)).await.unwrap();
        assert_eq!(next(&mut rx).await, 7);
    }

    /// Roster of seven on distinct hosts; binary tree rooted at the first.
    fn deep_topology() -> (KeyPair, Vec<Entity>, Arc<Tree>) {
        let (kp, root) = entity("a", "10.0.0.1:7000");
        let mut entities = vec![root];
        for i in 2..=7 {
            entities.push(entity(&format!("n{i}"), &format!("10.0.0.{i}:7000")).1);
        }
        let roster = Arc::new(Roster::new(entities.clone()));
        let tree = Arc::new(roster.generate_binary_tree().unwrap());
        (kp, entities, tree)
    }

    fn position(tree: &Arc<Tree>, node: &TreeNode) -> usize {
        tree.list().iter().position(|n| n.id() == node.id()).unwrap()
    }

    #[tokio::test]
    async fn test_aggregation_ignores_non_children() {
        let (kp, entities, tree) = deep_topology();
        let (overlay, _mock, mut rx) = setup(kp, &entities[0]);
        overlay.register_tree(tree.clone()).await;
        let round = RoundId::random();

        let children = tree.root().children();
        assert_eq!(children.len(), 2);
        let grandchild = children[0].children()[0].clone();

        let msg = data(&tree, "sum", round, position(&tree, &grandchild), 100);
        overlay.transmit_msg(msg).await.unwrap();
        let msg = data(&tree, "sum", round, position(&tree, &children[0]), 1);
        overlay.transmit_msg(msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "a grandchild does not complete the set");

        let msg = data(&tree, "sum", round, position(&tree, &children[1]), 2);
        overlay.transmit_msg(msg).await.unwrap();
        assert_eq!(next(&mut rx).await, 3);
    }

    #[tokio::test]
    async fn test_aggregation_repeat_child_waits_for_next_set() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, mut rx) = setup(kp, &entities[0]);
        overlay.register_tree(tree.clone()).await;
        let round = RoundId::random();

        // Two messages from the same child reach the child count but not
        // one per child.
        overlay.transmit_msg(data(&tree, "sum", round, 1, 1)).await.unwrap();
        overlay.transmit_msg(data(&tree, "sum", round, 1, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no flush without every child");

        overlay.transmit_msg(data(&tree, "sum", round, 2, 4)).await.unwrap();
        assert_eq!(next(&mut rx).await, 5);

        // The held repeat opens the next set.
        overlay.transmit_msg(data(&tree, "sum", round, 2, 8)).await.unwrap();
        assert_eq!(next(&mut rx).await, 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    fn count(mock: &MockOutbound, kind: &str) -> usize {
        mock.sent().iter().filter(|(_, p)| p.kind() == kind).count()
    }

    #[tokio::test]
    async fn test_trees_sharing_a_roster_request_it_once() {
        let (kp, entities, roster, tree) = topology();
        let (overlay, mock, mut rx) = setup(kp, &entities[0]);
        let line = Arc::new(roster.generate_nary_tree(1).unwrap());
        assert_ne!(tree.id(), line.id());

        overlay.transmit_msg(data(&tree, "seq", RoundId::random(), 1, 1)).await.unwrap();
        overlay.transmit_msg(data(&line, "seq", RoundId::random(), 1, 2)).await.unwrap();
        assert_eq!(count(&mock, "RequestTree"), 2);

        for t in [&tree, &line] {
            let resp = SendTree {
                tree_id: t.id(),
                tree: Some(t.marshal()),
            };
            overlay.handle_tree_response(&entities[1], resp).await.unwrap();
        }
        assert_eq!(count(&mock, "RequestRoster"), 1);
        assert_eq!(overlay.stats().pending.trees, 2);

        let resp = SendRoster {
            roster_id: roster.id(),
            roster: Some((*roster).clone()),
        };
        overlay.handle_roster_response(&entities[1], resp).await;

        assert!(overlay.tree(tree.id()).is_some());
        assert!(overlay.tree(line.id()).is_some());
        let mut seqs = vec![next(&mut rx).await, next(&mut rx).await];
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(overlay.stats().pending, PendingStats::default());
    }

    #[tokio::test]
    async fn test_empty_roster_response_allows_new_request() {
        let (kp, entities, roster, tree) = topology();
        let (overlay, mock, _rx) = setup(kp, &entities[0]);
        let round = RoundId::random();
        let marshal = || SendTree {
            tree_id: tree.id(),
            tree: Some(tree.marshal()),
        };

        overlay.transmit_msg(data(&tree, "seq", round, 1, 1)).await.unwrap();
        overlay.handle_tree_response(&entities[1], marshal()).await.unwrap();
        assert_eq!(count(&mock, "RequestRoster"), 1);

        let empty = SendRoster {
            roster_id: roster.id(),
            roster: None,
        };
        overlay.handle_roster_response(&entities[1], empty).await;
        assert_eq!(overlay.stats().pending.trees, 0);
        assert_eq!(overlay.stats().pending.data, 1);

        // Both markers are gone: the next message asks again from the start.
        overlay.transmit_msg(data(&tree, "seq", round, 1, 2)).await.unwrap();
        assert_eq!(count(&mock, "RequestTree"), 2);
        overlay.handle_tree_response(&entities[1], marshal()).await.unwrap();
        assert_eq!(count(&mock, "RequestRoster"), 2);
    }

    #[tokio::test]
    async fn test_failed_tree_request_is_retried() {
        let (kp, entities, _, tree) = topology();
        let (overlay, mock, _rx) = setup(kp, &entities[0]);
        let round = RoundId::random();

        mock.set_fail_sends(true);
        overlay.transmit_msg(data(&tree, "seq", round, 1, 1)).await.unwrap();
        assert!(mock.sent().is_empty());
        assert_eq!(overlay.stats().pending.data, 1);

        mock.set_fail_sends(false);
        overlay.transmit_msg(data(&tree, "seq", round, 1, 2)).await.unwrap();
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, entities[1].id());
        assert!(matches!(&sent[0].1, Packet::RequestTree(r) if r.tree_id == tree.id()));
    }

    #[tokio::test]
    async fn test_failed_roster_request_is_retried() {
        let (kp, entities, _, tree) = topology();
        let (overlay, mock, _rx) = setup(kp, &entities[0]);
        let resp = || SendTree {
            tree_id: tree.id(),
            tree: Some(tree.marshal()),
        };

        mock.set_fail_sends(true);
        assert!(overlay.handle_tree_response(&entities[1], resp()).await.is_err());
        assert_eq!(overlay.stats().pending.trees, 0);

        mock.set_fail_sends(false);
        overlay.handle_tree_response(&entities[1], resp()).await.unwrap();
        assert_eq!(count(&mock, "RequestRoster"), 1);
        assert_eq!(overlay.stats().pending.trees, 1);
    }

    #[tokio::test]
    async fn test_finished_instance_drops_late_data() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, mut rx) = setup(kp, &entities[0]);
        overlay.register_tree(tree.clone()).await;
        let round = RoundId::random();

        let first = data(&tree, "seq", round, 1, 1);
        let token = first.to.clone();
        overlay.transmit_msg(first).await.unwrap();
        assert_eq!(next(&mut rx).await, 1);

        overlay.node_done(&token).await;
        assert!(overlay.instances().is_empty());
        assert_eq!(overlay.stats().finished, 1);

        overlay.transmit_msg(data(&tree, "seq", round, 1, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(overlay.instances().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_protocol_does_not_leave_an_instance() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, _rx) = setup(kp, &entities[0]);
        overlay.register_tree(tree.clone()).await;

        let err = overlay
            .transmit_msg(data(&tree, "missing", RoundId::random(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnknownProtocolId(_)));
        assert!(overlay.instances().is_empty());
    }

    #[tokio::test]
    async fn test_binding_twice_fails() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, _rx) = setup(kp, &entities[0]);

        let pi = overlay.create_protocol("seq", &tree).unwrap();
        assert!(matches!(
            overlay.register_protocol_instance(pi.clone()),
            Err(OverlayError::InstanceAlreadyBound)
        ));

        overlay.node_done(pi.tree_node_instance().token()).await;
        assert!(matches!(
            overlay.register_protocol_instance(pi),
            Err(OverlayError::UnknownInstance)
        ));
    }

    #[tokio::test]
    async fn test_create_registers_tree_for_peers() {
        let (kp, entities, roster, tree) = topology();
        let (overlay, mock, _rx) = setup(kp, &entities[0]);
        assert!(matches!(
            overlay.create_protocol("nope", &tree),
            Err(OverlayError::UnknownProtocol(_))
        ));

        overlay.create_protocol("seq", &tree).unwrap();
        assert!(overlay.tree(tree.id()).is_some());
        assert!(overlay.roster(roster.id()).is_some());

        let req = RequestTree { tree_id: tree.id() };
        overlay.handle_tree_request(&entities[1], req).await.unwrap();
        let req = RequestRoster {
            roster_id: RosterId::random(),
        };
        overlay.handle_roster_request(&entities[2], req).await.unwrap();

        let sent = mock.sent();
        match &sent[0].1 {
            Packet::SendTree(r) => assert_eq!(r.tree.as_ref(), Some(&tree.marshal())),
            other => panic!("unexpected {}", other.kind()),
        }
        match &sent[1].1 {
            Packet::SendRoster(r) => assert!(r.roster.is_none()),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_closed_overlay_rejects_data() {
        let (kp, entities, _, tree) = topology();
        let (overlay, _mock, _rx) = setup(kp, &entities[0]);
        overlay.transmit_msg(data(&tree, "seq", RoundId::random(), 1, 1)).await.unwrap();
        overlay.close();
        assert_eq!(overlay.stats().pending, PendingStats::default());
        assert!(matches!(
            overlay.transmit_msg(data(&tree, "seq", RoundId::random(), 1, 1)).await,
            Err(OverlayError::Shutdown)
        ));
    }
}
