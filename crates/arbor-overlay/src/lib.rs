//! Arbor overlay layer.
//!
//! Runs multi-party protocols over a spanning tree of hosts. A [`Roster`]
//! lists the peers, a [`Tree`] arranges them, and every protocol round is
//! addressed by a [`Token`]. Each [`Host`] pumps inbound packets into its
//! [`Overlay`], which creates one [`TreeNodeInstance`] per token and feeds
//! it decoded messages, fetching unknown trees and rosters from the sender
//! on the way.
//!
//! Wire format: MessagePack (compact binary) over `arbor-transport`.
//!
//! # Writing a protocol
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arbor_overlay::{
//!     Incoming, OverlayError, ProtocolInstance, ProtocolMessage, ProtocolRegistry,
//!     TreeNodeInstance,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello;
//!
//! impl ProtocolMessage for Hello {
//!     const NAME: &'static str = "example.Hello";
//! }
//!
//! struct Greeter {
//!     tni: TreeNodeInstance,
//! }
//!
//! #[async_trait::async_trait]
//! impl ProtocolInstance for Greeter {
//!     fn tree_node_instance(&self) -> &TreeNodeInstance {
//!         &self.tni
//!     }
//!
//!     async fn start(&self) -> Result<(), OverlayError> {
//!         self.tni.send_to_children(&Hello).await
//!     }
//! }
//!
//! let protocols = ProtocolRegistry::new();
//! protocols.register("greeter", |tni| {
//!     let node = tni.clone();
//!     tni.register_handler(move |_: Incoming<Hello>| {
//!         tracing::info!(entity = %node.entity(), "hello");
//!         Ok(())
//!     })?;
//!     Ok(Arc::new(Greeter { tni }) as Arc<dyn ProtocolInstance>)
//! })?;
//! # Ok::<(), OverlayError>(())
//! ```

pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod host;
pub mod ids;
pub mod instance;
pub mod local;
pub mod message;
mod network;
pub mod overlay;
mod pending;
pub mod protocol;
pub mod roster;
pub mod service;
pub mod token;
pub mod tree;

pub use client::Client;
pub use config::HostConfig;
pub use dispatch::Incoming;
pub use error::OverlayError;
pub use host::{Host, HostStatus};
pub use ids::{MessageTypeId, ProtocolId, RosterId, RoundId, ServiceId, TokenId, TreeId, TreeNodeId};
pub use instance::TreeNodeInstance;
pub use local::LocalTest;
pub use message::{
    ClientReply, ClientRequest, Packet, ProtocolMessage, ProtocolMsg, RequestRoster, RequestTree,
    SendRoster, SendTree, ServiceMessage,
};
pub use network::{Inbound, Outbound};
pub use overlay::{Overlay, OverlayStats};
pub use pending::PendingStats;
pub use protocol::{ProtocolFactory, ProtocolInstance, ProtocolRegistry};
pub use roster::Roster;
pub use service::{Service, ServiceContext, ServiceFactory, ServiceRegistry};
pub use token::Token;
pub use tree::{Tree, TreeMarshal, TreeNode};
