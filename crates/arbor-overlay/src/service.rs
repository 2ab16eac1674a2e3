/// Long-lived per-host services reachable by clients and by each other.
///
/// Each host builds one instance of every registered service at startup.
/// A service only sees the host through its [`ServiceContext`].
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use arbor_transport::Entity;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::OverlayError;
use crate::ids::{ProtocolId, ServiceId};
use crate::instance::TreeNodeInstance;
use crate::message::{ClientReply, ClientRequest, Packet, ServiceMessage};
use crate::overlay::{Overlay, OverlayStats};
use crate::protocol::ProtocolInstance;
use crate::tree::{Tree, TreeNode};

#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// Offered every tree node instance created for a token carrying this
    /// service's id. `None` falls back to the protocol registry.
    fn new_protocol(
        &self,
        _tni: TreeNodeInstance,
    ) -> Result<Option<Arc<dyn ProtocolInstance>>, OverlayError> {
        Ok(None)
    }

    /// Handle a client request. Replies go through [`ServiceContext::reply`];
    /// an error is returned to the client as a failed [`ClientReply`].
    async fn process_client_request(
        &self,
        _from: &Entity,
        _request: ClientRequest,
    ) -> Result<(), OverlayError> {
        Err(OverlayError::Service("client requests not supported".into()))
    }

    async fn process_service_message(
        &self,
        from: &Entity,
        _msg: ServiceMessage,
    ) -> Result<(), OverlayError> {
        tracing::debug!(from = %from, "service message ignored");
        Ok(())
    }
}

pub type ServiceFactory =
    Arc<dyn Fn(ServiceContext) -> Result<Arc<dyn Service>, OverlayError> + Send + Sync>;

/// Name-indexed service factories.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<ServiceId, (String, ServiceFactory)>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F) -> Result<ServiceId, OverlayError>
    where
        F: Fn(ServiceContext) -> Result<Arc<dyn Service>, OverlayError> + Send + Sync + 'static,
    {
        let id = ServiceId::from_name(name);
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(OverlayError::ServiceRegistered(name.to_string()));
        }
        entries.insert(id, (name.to_string(), Arc::new(factory)));
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<ServiceId> {
        let id = ServiceId::from_name(name);
        self.entries.read().contains_key(&id).then_some(id)
    }

    pub fn name(&self, id: ServiceId) -> Option<String> {
        self.entries.read().get(&id).map(|(name, _)| name.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().values().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn factories(&self) -> Vec<(ServiceId, String, ServiceFactory)> {
        self.entries
            .read()
            .iter()
            .map(|(id, (name, f))| (*id, name.clone(), f.clone()))
            .collect()
    }
}

/// What a service may do with its host.
#[derive(Clone)]
pub struct ServiceContext {
    overlay: Weak<Overlay>,
    id: ServiceId,
    name: String,
}

impl ServiceContext {
    pub(crate) fn new(overlay: Weak<Overlay>, id: ServiceId, name: String) -> Self {
        Self { overlay, id, name }
    }

    fn overlay(&self) -> Result<Arc<Overlay>, OverlayError> {
        self.overlay.upgrade().ok_or(OverlayError::Shutdown)
    }

    pub fn service_id(&self) -> ServiceId {
        self.id
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self) -> Result<Entity, OverlayError> {
        Ok(self.overlay()?.entity().clone())
    }

    /// Registry sizes of the hosting overlay.
    pub fn stats(&self) -> Result<OverlayStats, OverlayError> {
        Ok(self.overlay()?.stats())
    }

    /// A fresh round of `protocol` at `node`, tagged with this service so
    /// that remote nodes hand it to their copy of the service.
    pub fn create_tree_node_instance(
        &self,
        tree: &Arc<Tree>,
        node: &TreeNode,
        protocol: &str,
    ) -> Result<TreeNodeInstance, OverlayError> {
        self.overlay()?
            .new_tree_node_instance(tree, node, ProtocolId::from_name(protocol), self.id)
    }

    pub fn register_protocol_instance(
        &self,
        pi: Arc<dyn ProtocolInstance>,
    ) -> Result<(), OverlayError> {
        self.overlay()?.register_protocol_instance(pi)
    }

    /// Instantiate `protocol` at the root of `tree` through the registry.
    pub fn create_protocol(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        self.overlay()?.create_protocol_service(protocol, tree, self.id)
    }

    pub async fn send_raw(&self, to: &Entity, packet: Packet) -> Result<(), OverlayError> {
        self.overlay()?.outbound().send_raw(to, packet).await
    }

    pub async fn send_service_message<T: Serialize>(
        &self,
        to: &Entity,
        service: &str,
        body: &T,
    ) -> Result<(), OverlayError> {
        let msg = ServiceMessage::new(service, body)?;
        self.send_raw(to, Packet::ServiceMessage(msg)).await
    }

    pub async fn reply(&self, to: &Entity, reply: ClientReply) -> Result<(), OverlayError> {
        self.send_raw(to, Packet::ClientReply(reply)).await
    }

    /// Reply with a successful payload.
    pub async fn reply_ok<T: Serialize>(&self, to: &Entity, body: &T) -> Result<(), OverlayError> {
        self.reply(to, ClientReply::ok(self.id, body)?).await
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl Service for Echo {}

    fn echo(_: ServiceContext) -> Result<Arc<dyn Service>, OverlayError> {
        Ok(Arc::new(Echo))
    }

    #[test]
    fn duplicate_service_fails() {
        let registry = ServiceRegistry::new();
        let id = registry.register("echo", echo).unwrap();
        assert_eq!(id, ServiceId::from_name("echo"));
        assert!(matches!(
            registry.register("echo", echo),
            Err(OverlayError::ServiceRegistered(_))
        ));
    }

    #[test]
    fn names_are_sorted() {
        let registry = ServiceRegistry::new();
        registry.register("zeta", echo).unwrap();
        registry.register("alpha", echo).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert_eq!(registry.factories().len(), 2);
        assert_eq!(
            registry.name(ServiceId::from_name("alpha")).as_deref(),
            Some("alpha")
        );
        assert_eq!(registry.id("missing"), None);
    }

    #[test]
    fn context_without_overlay_reports_shutdown() {
        let ctx = ServiceContext::new(Weak::new(), ServiceId::from_name("echo"), "echo".into());
        assert!(matches!(ctx.entity(), Err(OverlayError::Shutdown)));
        assert_eq!(ctx.service_name(), "echo");
    }
}
