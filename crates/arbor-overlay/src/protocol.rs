use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::OverlayError;
use crate::ids::ProtocolId;
use crate::instance::TreeNodeInstance;

/// Logic of one protocol run on one tree node.
///
/// `start` is called once, on the initiating node only. Incoming messages
/// reach the protocol through the channels and handlers it registered on
/// its [`TreeNodeInstance`]; `dispatch` is available for protocols that
/// drive their own receive loop.
#[async_trait::async_trait]
pub trait ProtocolInstance: Send + Sync + 'static {
    fn tree_node_instance(&self) -> &TreeNodeInstance;

    async fn start(&self) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn dispatch(&self) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), OverlayError> {
        Ok(())
    }
}

/// Builds a protocol instance bound to the given tree node instance.
pub type ProtocolFactory =
    Arc<dyn Fn(TreeNodeInstance) -> Result<Arc<dyn ProtocolInstance>, OverlayError> + Send + Sync>;

struct Registered {
    name: String,
    factory: ProtocolFactory,
}

/// Name-indexed protocol factories.
///
/// Built once at startup and shared by every host of the process.
#[derive(Default)]
pub struct ProtocolRegistry {
    entries: RwLock<HashMap<ProtocolId, Registered>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F) -> Result<ProtocolId, OverlayError>
    where
        F: Fn(TreeNodeInstance) -> Result<Arc<dyn ProtocolInstance>, OverlayError>
            + Send
            + Sync
            + 'static,
    {
        let id = ProtocolId::from_name(name);
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(OverlayError::ProtocolRegistered(name.to_string()));
        }
        entries.insert(
            id,
            Registered {
                name: name.to_string(),
                factory: Arc::new(factory),
            },
        );
        tracing::debug!(protocol = name, "protocol registered");
        Ok(id)
    }

    /// Id of a registered protocol.
    pub fn id(&self, name: &str) -> Option<ProtocolId> {
        let id = ProtocolId::from_name(name);
        self.entries.read().contains_key(&id).then_some(id)
    }

    pub fn name(&self, id: ProtocolId) -> Option<String> {
        self.entries.read().get(&id).map(|r| r.name.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().values().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    /// Run the factory registered under `id`.
    pub fn instantiate(
        &self,
        id: ProtocolId,
        tni: TreeNodeInstance,
    ) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let factory = self
            .entries
            .read()
            .get(&id)
            .map(|r| r.factory.clone())
            .ok_or(OverlayError::UnknownProtocolId(id))?;
        factory(tni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: TreeNodeInstance) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        Err(OverlayError::Service("unused".into()))
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ProtocolRegistry::new();
        let id = registry.register("count", noop).unwrap();
        assert_eq!(id, ProtocolId::from_name("count"));
        assert!(matches!(
            registry.register("count", noop),
            Err(OverlayError::ProtocolRegistered(name)) if name == "count"
        ));
    }

    #[test]
    fn lookup_by_name_and_id() {
        let registry = ProtocolRegistry::new();
        registry.register("count", noop).unwrap();
        registry.register("broadcast", noop).unwrap();

        assert_eq!(registry.id("count"), Some(ProtocolId::from_name("count")));
        assert_eq!(registry.id("missing"), None);
        assert_eq!(
            registry.name(ProtocolId::from_name("broadcast")).as_deref(),
            Some("broadcast")
        );
        assert_eq!(registry.names(), vec!["broadcast", "count"]);
    }
}
