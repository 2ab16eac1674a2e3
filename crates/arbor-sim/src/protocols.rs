//! Demo protocols and the status service run by the simulator.
//!
//! Both protocols report to the root, which sends the number of nodes it
//! heard from on the channel handed to [`register`].

use std::sync::Arc;

use arbor_overlay::{
    ClientRequest, Incoming, OverlayError, OverlayStats, ProtocolInstance, ProtocolMessage,
    ProtocolRegistry, Service, ServiceContext, ServiceRegistry, TreeNodeInstance,
};
use arbor_transport::Entity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const STATUS_SERVICE: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Demo {
    /// Aggregate a node count up the tree.
    Count,
    /// Root sends to every node, every node acks to the root.
    Broadcast,
}

impl Demo {
    pub fn name(self) -> &'static str {
        match self {
            Demo::Count => "count",
            Demo::Broadcast => "broadcast",
        }
    }
}

pub type Reports = mpsc::UnboundedSender<usize>;

/// Register both demo protocols, reporting on `reports`.
pub fn register(protocols: &ProtocolRegistry, reports: Reports) -> Result<(), OverlayError> {
    let tx = reports.clone();
    protocols.register(Demo::Count.name(), move |tni| Count::new(tni, tx.clone()))?;
    protocols.register(Demo::Broadcast.name(), move |tni| {
        Broadcast::new(tni, reports.clone())
    })?;
    Ok(())
}

// ── Messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce;

impl ProtocolMessage for Announce {
    const NAME: &'static str = "arbor_sim.Announce";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tally {
    pub count: usize,
}

impl ProtocolMessage for Tally {
    const NAME: &'static str = "arbor_sim.Tally";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack;

impl ProtocolMessage for Ack {
    const NAME: &'static str = "arbor_sim.Ack";
}

// ── Count ───────────────────────────────────────────────────────

pub struct Count {
    tni: TreeNodeInstance,
    announces: Mutex<Option<mpsc::UnboundedReceiver<Incoming<Announce>>>>,
    tallies: Mutex<Option<mpsc::UnboundedReceiver<Vec<Incoming<Tally>>>>>,
    reports: Reports,
}

impl Count {
    fn new(tni: TreeNodeInstance, reports: Reports) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let announces = tni.register_channel::<Announce>()?;
        let tallies = tni.register_channel_aggregate::<Tally>()?;
        Ok(Arc::new(Self {
            tni,
            announces: Mutex::new(Some(announces)),
            tallies: Mutex::new(Some(tallies)),
            reports,
        }))
    }

    async fn finish(&self, count: usize) -> Result<(), OverlayError> {
        if self.tni.is_root() {
            let _ = self.reports.send(count);
        } else {
            self.tni.send_to_parent(&Tally { count }).await?;
        }
        self.tni.done().await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProtocolInstance for Count {
    fn tree_node_instance(&self) -> &TreeNodeInstance {
        &self.tni
    }

    async fn start(&self) -> Result<(), OverlayError> {
        if self.tni.is_leaf() {
            return self.finish(1).await;
        }
        self.tni.send_to_children_in_parallel(&Announce).await
    }

    async fn dispatch(&self) -> Result<(), OverlayError> {
        let announces = self.announces.lock().take();
        let tallies = self.tallies.lock().take();
        let (Some(mut announces), Some(mut tallies)) = (announces, tallies) else {
            return Ok(());
        };
        loop {
            tokio::select! {
                announce = announces.recv() => match announce {
                    Some(_) if self.tni.is_leaf() => return self.finish(1).await,
                    Some(_) => self.tni.send_to_children_in_parallel(&Announce).await?,
                    None => return Ok(()),
                },
                batch = tallies.recv() => match batch {
                    Some(batch) => {
                        let below: usize = batch.iter().map(|t| t.msg.count).sum();
                        return self.finish(below + 1).await;
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

// ── Broadcast ───────────────────────────────────────────────────

pub struct Broadcast {
    tni: TreeNodeInstance,
    announces: Mutex<Option<mpsc::UnboundedReceiver<Incoming<Announce>>>>,
    acks: Mutex<Option<mpsc::UnboundedReceiver<Incoming<Ack>>>>,
    reports: Reports,
}

impl Broadcast {
    fn new(tni: TreeNodeInstance, reports: Reports) -> Result<Arc<dyn ProtocolInstance>, OverlayError> {
        let announces = tni.register_channel::<Announce>()?;
        let acks = tni.register_channel::<Ack>()?;
        Ok(Arc::new(Self {
            tni,
            announces: Mutex::new(Some(announces)),
            acks: Mutex::new(Some(acks)),
            reports,
        }))
    }

    async fn collect_acks(&self, mut acks: mpsc::UnboundedReceiver<Incoming<Ack>>) {
        let expected = self.tni.list().len() - 1;
        let mut seen = 0;
        while seen < expected {
            match acks.recv().await {
                Some(ack) => {
                    tracing::trace!(from = %ack.from.entity(), "ack");
                    seen += 1;
                }
                None => return,
            }
        }
        let _ = self.reports.send(seen + 1);
        self.tni.done().await;
    }
}

#[async_trait::async_trait]
impl ProtocolInstance for Broadcast {
    fn tree_node_instance(&self) -> &TreeNodeInstance {
        &self.tni
    }

    async fn start(&self) -> Result<(), OverlayError> {
        self.tni.broadcast(&Announce).await
    }

    async fn dispatch(&self) -> Result<(), OverlayError> {
        if self.tni.is_root() {
            let acks = self.acks.lock().take();
            if let Some(acks) = acks {
                self.collect_acks(acks).await;
            }
            return Ok(());
        }

        let announces = self.announces.lock().take();
        let Some(mut announces) = announces else {
            return Ok(());
        };
        if announces.recv().await.is_some() {
            self.tni.send_to(&self.tni.root(), &Ack).await?;
            self.tni.done().await;
        }
        Ok(())
    }
}

// ── Status service ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub entity: String,
    pub stats: OverlayStats,
}

/// Answers a [`StatusRequest`] with the host's registry sizes.
pub struct StatusService {
    ctx: ServiceContext,
}

pub fn register_services(services: &ServiceRegistry) -> Result<(), OverlayError> {
    services.register(STATUS_SERVICE, |ctx| {
        Ok(Arc::new(StatusService { ctx }) as Arc<dyn Service>)
    })?;
    Ok(())
}

#[async_trait::async_trait]
impl Service for StatusService {
    async fn process_client_request(
        &self,
        from: &Entity,
        request: ClientRequest,
    ) -> Result<(), OverlayError> {
        let StatusRequest = request.decode()?;
        let reply = StatusReply {
            entity: self.ctx.entity()?.to_string(),
            stats: self.ctx.stats()?,
        };
        tracing::debug!(to = %from, "status requested");
        self.ctx.reply_ok(from, &reply).await
    }
}
