//! Arbor transport layer.
//!
//! Peer identities ([`Entity`], [`KeyPair`]) and ordered, length-framed TCP
//! connections that exchange identities on connect. Payloads are
//! MessagePack-encoded serde values.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arbor_transport::{connect, Entity, KeyPair, Listener, TransportConfig};
//!
//! # async fn example() -> Result<(), arbor_transport::TransportError> {
//! let config = TransportConfig::new();
//! let listener = Listener::bind("127.0.0.1:0", config.clone()).await?;
//! let server = Entity::new(KeyPair::generate().public(), listener.local_addr()?.to_string());
//! let client = Entity::new(KeyPair::generate().public(), "");
//!
//! let accept = tokio::spawn({
//!     let server = server.clone();
//!     async move { listener.accept(&server).await }
//! });
//! let conn = connect(&client, &server, &config).await?;
//! conn.send(&"hello".to_string()).await?;
//!
//! let incoming = accept.await.unwrap()?;
//! let text: String = incoming.receive().await?;
//! assert_eq!(text, "hello");
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod counter;
mod endpoint;
mod error;
mod frame;
mod identity;

pub use config::TransportConfig;
pub use connection::Conn;
pub use counter::{Counter, TrafficSnapshot, TrafficStats};
pub use endpoint::{connect, Accepted, Listener};
pub use error::TransportError;
pub use identity::{content_id, Entity, EntityId, KeyPair, PublicKey};
