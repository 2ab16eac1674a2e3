/// TreeNodeInstance: one protocol endpoint bound to one tree position.
///
/// Each instance owns a private FIFO of undelivered [`ProtocolMsg`]s and
/// one consumer task draining it. Producers push and wake the consumer
/// through a [`Notify`]; closing sets a flag and performs one last wake so
/// the consumer exits instead of waiting forever.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use arbor_transport::{Entity, KeyPair, PublicKey};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use crate::dispatch::{Delivery, Incoming, MessageSink, Received, TypedSink};
use crate::error::OverlayError;
use crate::ids::{MessageTypeId, TokenId};
use crate::message::{ProtocolMessage, ProtocolMsg};
use crate::overlay::Overlay;
use crate::protocol::ProtocolInstance;
use crate::roster::Roster;
use crate::token::Token;
use crate::tree::{Tree, TreeNode};

type DoneCallback = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct DispatchQueue {
    items: VecDeque<ProtocolMsg>,
    closing: bool,
}

struct Inner {
    overlay: Weak<Overlay>,
    token: Token,
    node: TreeNode,
    protocol_name: String,
    sinks: RwLock<HashMap<MessageTypeId, Arc<dyn MessageSink>>>,
    /// Children's messages held back until every child reported.
    aggregates: Mutex<HashMap<MessageTypeId, Held>>,
    queue: Mutex<DispatchQueue>,
    wake: Notify,
    instance: Mutex<Option<Arc<dyn ProtocolInstance>>>,
    on_done: Mutex<Option<DoneCallback>>,
}

/// Handle to a tree node instance. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct TreeNodeInstance {
    inner: Arc<Inner>,
}

impl TreeNodeInstance {
    /// Create the instance and spawn its dispatch consumer.
    pub(crate) fn new(
        overlay: Weak<Overlay>,
        token: Token,
        node: TreeNode,
        protocol_name: String,
    ) -> Self {
        let inner = Arc::new(Inner {
            overlay,
            token,
            node,
            protocol_name,
            sinks: RwLock::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
            queue: Mutex::new(DispatchQueue::default()),
            wake: Notify::new(),
            instance: Mutex::new(None),
            on_done: Mutex::new(None),
        });
        tokio::spawn(dispatch_loop(inner.clone()));
        Self { inner }
    }

    // ── Identity & topology ─────────────────────────────────────────

    pub fn token(&self) -> &Token {
        &self.inner.token
    }

    pub fn token_id(&self) -> TokenId {
        self.inner.token.id()
    }

    pub fn protocol_name(&self) -> &str {
        &self.inner.protocol_name
    }

    pub fn tree_node(&self) -> &TreeNode {
        &self.inner.node
    }

    pub fn tree(&self) -> &Arc<Tree> {
        self.inner.node.tree()
    }

    pub fn roster(&self) -> &Arc<Roster> {
        self.tree().roster()
    }

    pub fn entity(&self) -> &Entity {
        self.inner.node.entity()
    }

    pub fn parent(&self) -> Option<TreeNode> {
        self.inner.node.parent()
    }

    pub fn children(&self) -> Vec<TreeNode> {
        self.inner.node.children()
    }

    pub fn root(&self) -> TreeNode {
        self.tree().root()
    }

    pub fn is_root(&self) -> bool {
        self.inner.node.is_root()
    }

    pub fn is_leaf(&self) -> bool {
        self.inner.node.is_leaf()
    }

    /// Position of this node's entity in the roster.
    pub fn index(&self) -> usize {
        self.inner.node.roster_index()
    }

    /// All tree nodes, breadth-first.
    pub fn list(&self) -> Vec<TreeNode> {
        self.tree().list()
    }

    /// Aggregate public key of the whole roster.
    pub fn aggregate(&self) -> &PublicKey {
        self.roster().aggregate()
    }

    pub fn public(&self) -> &PublicKey {
        self.entity().public()
    }

    /// The hosting overlay's key pair.
    pub fn keypair(&self) -> Result<KeyPair, OverlayError> {
        Ok(self.overlay()?.keypair().clone())
    }

    fn overlay(&self) -> Result<Arc<Overlay>, OverlayError> {
        self.inner.overlay.upgrade().ok_or(OverlayError::Shutdown)
    }

    // ── Registration ────────────────────────────────────────────────

    /// Deliver each `M` as it arrives on the returned queue.
    pub fn register_channel<M: ProtocolMessage>(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Incoming<M>>, OverlayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Delivery::Queue(tx))?;
        Ok(rx)
    }

    /// Deliver children's `M`s as one batch once every child sent one.
    /// A message from the parent is delivered alone.
    pub fn register_channel_aggregate<M: ProtocolMessage>(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Vec<Incoming<M>>>, OverlayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Delivery::BatchQueue(tx))?;
        Ok(rx)
    }

    /// Call `f` for each `M`, on the dispatch task.
    pub fn register_handler<M, F>(&self, f: F) -> Result<(), OverlayError>
    where
        M: ProtocolMessage,
        F: Fn(Incoming<M>) -> Result<(), OverlayError> + Send + Sync + 'static,
    {
        self.register(Delivery::Handler(Box::new(f)))
    }

    /// Aggregating variant of [`register_handler`](Self::register_handler).
    pub fn register_handler_aggregate<M, F>(&self, f: F) -> Result<(), OverlayError>
    where
        M: ProtocolMessage,
        F: Fn(Vec<Incoming<M>>) -> Result<(), OverlayError> + Send + Sync + 'static,
    {
        self.register(Delivery::BatchHandler(Box::new(f)))
    }

    fn register<M: ProtocolMessage>(&self, delivery: Delivery<M>) -> Result<(), OverlayError> {
        let mut sinks = self.inner.sinks.write();
        if sinks.contains_key(&M::message_type()) {
            return Err(OverlayError::HandlerAlreadyRegistered(M::NAME));
        }
        sinks.insert(M::message_type(), Arc::new(TypedSink::new(delivery)));
        Ok(())
    }

    // ── Sending ─────────────────────────────────────────────────────

    pub async fn send_to<M: ProtocolMessage>(
        &self,
        to: &TreeNode,
        msg: &M,
    ) -> Result<(), OverlayError> {
        self.overlay()?
            .send_to_tree_node(&self.inner.token, to, msg)
            .await
    }

    /// No-op on the root.
    pub async fn send_to_parent<M: ProtocolMessage>(&self, msg: &M) -> Result<(), OverlayError> {
        match self.parent() {
            Some(parent) => self.send_to(&parent, msg).await,
            None => Ok(()),
        }
    }

    /// Sequential; stops at the first failure.
    pub async fn send_to_children<M: ProtocolMessage>(&self, msg: &M) -> Result<(), OverlayError> {
        for child in self.children() {
            self.send_to(&child, msg).await?;
        }
        Ok(())
    }

    /// Sends to every child concurrently and reports every failure.
    pub async fn send_to_children_in_parallel<M: ProtocolMessage>(
        &self,
        msg: &M,
    ) -> Result<(), OverlayError> {
        let overlay = self.overlay()?;
        let payload = rmp_serde::to_vec_named(msg)?;
        let mut tasks = tokio::task::JoinSet::new();
        for child in self.children() {
            let overlay = overlay.clone();
            let from = self.inner.token.clone();
            let payload = payload.clone();
            tasks.spawn(async move {
                let result = overlay
                    .send_encoded(&from, &child, M::message_type(), payload)
                    .await;
                (child, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((child, Err(e))) => failures.push(format!("{}: {e}", child.entity())),
                Err(e) => failures.push(format!("send task failed: {e}")),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OverlayError::SendFailures(failures.join("\n")))
        }
    }

    /// Sequential send to an explicit set of nodes.
    pub async fn multicast<M: ProtocolMessage>(
        &self,
        msg: &M,
        nodes: &[TreeNode],
    ) -> Result<(), OverlayError> {
        for node in nodes {
            self.send_to(node, msg).await?;
        }
        Ok(())
    }

    /// Send to every node of the tree except this one.
    pub async fn broadcast<M: ProtocolMessage>(&self, msg: &M) -> Result<(), OverlayError> {
        let me = self.inner.node.id();
        for node in self.list().into_iter().filter(|n| n.id() != me) {
            self.send_to(&node, msg).await?;
        }
        Ok(())
    }

    /// Start a sub-protocol on another tree from this host.
    pub fn create_protocol(
        &self,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?.create_protocol(name, tree)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Queue an arriving message for the consumer.
    pub(crate) fn process(&self, msg: ProtocolMsg) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.closing {
                tracing::debug!(token = ?self.inner.token, "instance closing, dropping message");
                return;
            }
            queue.items.push_back(msg);
        }
        self.inner.wake.notify_one();
    }

    pub(crate) fn bind(&self, pi: Arc<dyn ProtocolInstance>) -> Result<(), OverlayError> {
        let mut slot = self.inner.instance.lock();
        if slot.is_some() {
            return Err(OverlayError::InstanceAlreadyBound);
        }
        *slot = Some(pi);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.instance.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.lock().closing
    }

    // ── Termination ─────────────────────────────────────────────────

    /// Install a callback consulted by [`done`](Self::done); returning
    /// `false` keeps the instance alive.
    pub fn on_done<F>(&self, f: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *self.inner.on_done.lock() = Some(Arc::new(f));
    }

    /// Signal that the protocol finished on this node.
    pub async fn done(&self) {
        let callback = self.inner.on_done.lock().clone();
        if let Some(callback) = callback {
            if !callback() {
                tracing::debug!(token = ?self.inner.token, "done deferred by callback");
                return;
            }
        }
        match self.inner.overlay.upgrade() {
            Some(overlay) => overlay.node_done(&self.inner.token).await,
            None => {
                if let Err(e) = self.close().await {
                    tracing::error!("closing orphaned instance: {e}");
                }
            }
        }
    }

    /// Stop the consumer, drop registrations and shut the bound protocol
    /// down. Idempotent.
    pub async fn close(&self) -> Result<(), OverlayError> {
        if !self.halt() {
            return Ok(());
        }
        let pi = self.inner.instance.lock().take();
        match pi {
            Some(pi) => pi.shutdown().await,
            None => Ok(()),
        }
    }

    /// Synchronous part of [`close`](Self::close). Returns false if the
    /// instance was already closing.
    pub(crate) fn halt(&self) -> bool {
        {
            let mut queue = self.inner.queue.lock();
            if queue.closing {
                return false;
            }
            queue.closing = true;
            queue.items.clear();
        }
        self.inner.wake.notify_one();
        self.inner.sinks.write().clear();
        self.inner.aggregates.lock().clear();
        true
    }
}

impl std::fmt::Debug for TreeNodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNodeInstance")
            .field("protocol", &self.inner.protocol_name)
            .field("node", &self.inner.node)
            .field("token", &self.inner.token.id())
            .finish()
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut queue = inner.queue.lock();
            if queue.closing {
                break;
            }
            queue.items.pop_front()
        };
        match next {
            Some(msg) => {
                if let Err(e) = inner.dispatch(msg) {
                    tracing::error!(
                        protocol = %inner.protocol_name,
                        node = %inner.node.entity(),
                        "dispatch failed: {e}"
                    );
                }
            }
            None => inner.wake.notified().await,
        }
    }
    tracing::debug!(token = ?inner.token, "dispatch consumer stopped");
}

impl Inner {
    fn dispatch(&self, msg: ProtocolMsg) -> Result<(), OverlayError> {
        let sink = self
            .sinks
            .read()
            .get(&msg.msg_type)
            .cloned()
            .ok_or(OverlayError::MessageNotHandled(msg.msg_type))?;

        let from_id = msg.from.tree_node_id();
        let from = self
            .node
            .tree()
            .search(&from_id)
            .ok_or(OverlayError::UnknownTreeNode(from_id))?;
        let decoded = sink.decode(&msg.payload)?;
        let received = Received {
            from,
            token: msg.from,
            msg: decoded,
        };

        for batch in self.aggregate(msg.msg_type, sink.aggregate(), received) {
            sink.deliver(batch)?;
        }
        Ok(())
    }

    /// Messages from the parent, and types that do not aggregate, pass
    /// straight through. Otherwise hold children's messages until exactly
    /// one per child has arrived, then release that set once. A child that
    /// reports again before its siblings waits for the next set; messages
    /// from nodes that are not children are dropped.
    fn aggregate(
        &self,
        msg_type: MessageTypeId,
        aggregating: bool,
        received: Received,
    ) -> Vec<Vec<Received>> {
        let from_id = received.from.id();
        let from_parent = self.node.parent().is_some_and(|p| p.id() == from_id);
        let expected = self.node.child_count();
        if from_parent || !aggregating || expected == 0 {
            return vec![vec![received]];
        }
        if !self.node.children().iter().any(|c| c.id() == from_id) {
            tracing::warn!(
                node = %self.node.entity(),
                from = %received.from.entity(),
                "dropping aggregated message from a non-child"
            );
            return Vec::new();
        }

        let mut aggregates = self.aggregates.lock();
        let held = aggregates.entry(msg_type).or_default();
        let ready = held.push(received, expected);
        tracing::debug!(
            node = %self.node.entity(),
            received = held.batch.len(),
            backlog = held.backlog.len(),
            expected,
            "holding children message"
        );
        if held.batch.is_empty() && held.backlog.is_empty() {
            aggregates.remove(&msg_type);
        }
        ready
    }
}

/// Per-type aggregation state: the set being filled, one entry per child,
/// and early repeats from children already in it.
#[derive(Default)]
struct Held {
    batch: Vec<Received>,
    backlog: VecDeque<Received>,
}

impl Held {
    fn push(&mut self, received: Received, expected: usize) -> Vec<Vec<Received>> {
        if self.holds(&received) {
            self.backlog.push_back(received);
            return Vec::new();
        }
        self.batch.push(received);

        let mut ready = Vec::new();
        while self.batch.len() == expected {
            ready.push(std::mem::take(&mut self.batch));
            for next in std::mem::take(&mut self.backlog) {
                if self.holds(&next) {
                    self.backlog.push_back(next);
                } else {
                    self.batch.push(next);
                }
            }
        }
        ready
    }

    fn holds(&self, received: &Received) -> bool {
        let id = received.from.id();
        self.batch.iter().any(|r| r.from.id() == id)
    }
}
