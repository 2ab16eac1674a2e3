/// In-process test harness: real hosts on loopback TCP.
use std::collections::HashMap;
use std::sync::Arc;

use arbor_transport::{EntityId, KeyPair};

use crate::config::HostConfig;
use crate::error::OverlayError;
use crate::host::Host;
use crate::ids::{ProtocolId, ServiceId, TreeId};
use crate::instance::TreeNodeInstance;
use crate::message::{ProtocolMessage, ProtocolMsg};
use crate::protocol::{ProtocolInstance, ProtocolRegistry};
use crate::roster::Roster;
use crate::service::ServiceRegistry;
use crate::tree::{Tree, TreeNode};

/// Builds hosts on `127.0.0.1:0`, rosters and trees over them, and starts
/// protocols on the right host.
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), arbor_overlay::OverlayError> {
/// use std::sync::Arc;
/// use arbor_overlay::{LocalTest, ProtocolRegistry, ServiceRegistry};
///
/// let protocols = Arc::new(ProtocolRegistry::new());
/// let mut local = LocalTest::new(protocols, Arc::new(ServiceRegistry::new()));
/// let (_hosts, _roster, tree) = local.gen_tree(5, true).await?;
/// assert_eq!(tree.size(), 5);
/// local.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct LocalTest {
    protocols: Arc<ProtocolRegistry>,
    services: Arc<ServiceRegistry>,
    config: HostConfig,
    hosts: Vec<Host>,
    trees: HashMap<TreeId, Arc<Tree>>,
}

impl LocalTest {
    pub fn new(protocols: Arc<ProtocolRegistry>, services: Arc<ServiceRegistry>) -> Self {
        Self::with_config(protocols, services, HostConfig::new())
    }

    pub fn with_config(
        protocols: Arc<ProtocolRegistry>,
        services: Arc<ServiceRegistry>,
        config: HostConfig,
    ) -> Self {
        Self {
            protocols,
            services,
            config,
            hosts: Vec::new(),
            trees: HashMap::new(),
        }
    }

    /// `n` listening, processing hosts.
    pub async fn gen_hosts(&mut self, n: usize) -> Result<Vec<Host>, OverlayError> {
        let mut hosts = Vec::with_capacity(n);
        for _ in 0..n {
            let host = Host::bind(
                KeyPair::generate(),
                "127.0.0.1:0",
                self.protocols.clone(),
                &self.services,
                self.config.clone(),
            )
            .await?;
            host.listen().await?;
            host.start_processing();
            hosts.push(host);
        }
        self.hosts.extend(hosts.iter().cloned());
        Ok(hosts)
    }

    pub fn gen_roster_from_hosts(&self, hosts: &[Host]) -> Arc<Roster> {
        Arc::new(Roster::new(hosts.iter().map(|h| h.entity().clone())))
    }

    /// `n` hosts under a binary tree. With `register`, the root's host knows
    /// the tree up front; the others learn it on first contact.
    pub async fn gen_tree(
        &mut self,
        n: usize,
        register: bool,
    ) -> Result<(Vec<Host>, Arc<Roster>, Arc<Tree>), OverlayError> {
        let hosts = self.gen_hosts(n).await?;
        let roster = self.gen_roster_from_hosts(&hosts);
        let tree = Arc::new(roster.generate_binary_tree()?);
        self.adopt(&hosts, &tree, register).await;
        Ok((hosts, roster, tree))
    }

    /// A `bf`-ary tree of `nodes` positions over `hosts` hosts; hosts are
    /// reused when there are more positions than hosts.
    pub async fn gen_big_tree(
        &mut self,
        nodes: usize,
        hosts: usize,
        bf: usize,
        register: bool,
    ) -> Result<(Vec<Host>, Arc<Roster>, Arc<Tree>), OverlayError> {
        let hosts = self.gen_hosts(hosts).await?;
        let roster = self.gen_roster_from_hosts(&hosts);
        let tree = Arc::new(roster.generate_big_nary_tree(bf, nodes)?);
        self.adopt(&hosts, &tree, register).await;
        Ok((hosts, roster, tree))
    }

    async fn adopt(&mut self, hosts: &[Host], tree: &Arc<Tree>, register: bool) {
        self.trees.insert(tree.id(), tree.clone());
        if register {
            if let Some(root_host) = hosts.first() {
                root_host.register_roster(tree.roster().clone()).await;
                root_host.register_tree(tree.clone()).await;
            }
        }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, id: &EntityId) -> Option<&Host> {
        self.hosts.iter().find(|h| h.entity().id() == *id)
    }

    fn host_of(&self, node: &TreeNode) -> Result<&Host, OverlayError> {
        self.host(&node.entity().id())
            .ok_or_else(|| OverlayError::InvalidTopology(format!("no local host for {}", node.entity())))
    }

    /// Create and start `name` on the host at the root of `tree`.
    pub async fn start_protocol(
        &self,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let host = self.host_of(&tree.root())?;
        host.overlay().start_protocol(name, tree).await
    }

    pub fn create_protocol(
        &self,
        name: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let host = self.host_of(&tree.root())?;
        host.overlay().create_protocol(name, tree)
    }

    /// A fresh, unbound instance of `protocol` at `node`, on its host.
    pub fn new_tree_node_instance(
        &self,
        node: &TreeNode,
        protocol: &str,
    ) -> Result<TreeNodeInstance, OverlayError> {
        if self.protocols.id(protocol).is_none() {
            return Err(OverlayError::UnknownProtocol(protocol.to_string()));
        }
        let host = self.host_of(node)?;
        host.overlay().new_tree_node_instance(
            node.tree(),
            node,
            ProtocolId::from_name(protocol),
            ServiceId::nil(),
        )
    }

    /// Live instances sitting at `node`.
    pub fn instances(&self, node: &TreeNode) -> Vec<TreeNodeInstance> {
        match self.host_of(node) {
            Ok(host) => host
                .overlay()
                .instances()
                .into_iter()
                .filter(|tni| tni.tree_node() == node)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Hand `msg` from one instance straight to another's overlay,
    /// bypassing the network.
    pub async fn send_tree_node<M: ProtocolMessage>(
        &self,
        from: &TreeNodeInstance,
        to: &TreeNodeInstance,
        msg: &M,
    ) -> Result<(), OverlayError> {
        if from.tree().id() != to.tree().id() {
            return Err(OverlayError::InvalidTopology(
                "cannot send between different trees".into(),
            ));
        }
        let host = self.host_of(to.tree_node())?;
        let mut data = ProtocolMsg::new(from.token().clone(), to.token().clone(), msg)?;
        data.entity = Some(from.entity().clone());
        host.overlay().transmit_msg(data).await
    }

    pub fn tree(&self, id: TreeId) -> Option<&Arc<Tree>> {
        self.trees.get(&id)
    }

    /// Close every instance, then every host.
    pub async fn close_all(&mut self) {
        for host in &self.hosts {
            for tni in host.overlay().instances() {
                if let Err(e) = tni.close().await {
                    tracing::warn!(entity = %host.entity(), "closing instance: {e}");
                }
            }
        }
        for host in self.hosts.drain(..) {
            match host.close().await {
                Ok(()) | Err(OverlayError::AlreadyClosing) => {}
                Err(e) => tracing::warn!(entity = %host.entity(), "closing host: {e}"),
            }
        }
        self.trees.clear();
    }
}
