use std::time::Duration;

use arbor_transport::{connect, Entity, KeyPair, TransportConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::OverlayError;
use crate::ids::ServiceId;
use crate::message::{ClientReply, ClientRequest, Packet};
use crate::roster::Roster;

/// Talks to one service on remote hosts.
///
/// Each request opens a connection under an ephemeral identity with no
/// listening address, waits for the [`ClientReply`] and closes it.
///
/// ```rust,no_run
/// # async fn demo(host: arbor_transport::Entity) -> Result<(), arbor_overlay::OverlayError> {
/// use arbor_overlay::Client;
///
/// let client = Client::new("status");
/// let count: u64 = client.request(&host, &()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    service: String,
    keypair: KeyPair,
    config: TransportConfig,
    timeout: Duration,
}

impl Client {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            keypair: KeyPair::generate(),
            config: TransportConfig::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// How long to wait for a reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service_id(&self) -> ServiceId {
        ServiceId::from_name(&self.service)
    }

    fn identity(&self) -> Entity {
        Entity::with_addresses(self.keypair.public(), Vec::new())
    }

    /// Send `body` to the service on `dst` and return its raw reply.
    pub async fn send<T: Serialize>(
        &self,
        dst: &Entity,
        body: &T,
    ) -> Result<ClientReply, OverlayError> {
        let request = ClientRequest::new(&self.service, body)?;
        let conn = connect(&self.identity(), dst, &self.config).await?;
        tracing::debug!(service = %self.service, to = %dst, "sending client request");

        let exchange = async {
            conn.send(&Packet::ClientRequest(request)).await?;
            loop {
                match conn.receive::<Packet>().await? {
                    Packet::ClientReply(reply) => return Ok::<_, OverlayError>(reply),
                    other => tracing::debug!(kind = other.kind(), "ignoring packet while waiting for reply"),
                }
            }
        };
        let result = tokio::time::timeout(self.timeout, exchange).await;
        conn.close().await;
        result.map_err(|_| OverlayError::Timeout)?
    }

    /// Send and decode a successful reply; a service error becomes
    /// [`OverlayError::Service`].
    pub async fn request<T, R>(&self, dst: &Entity, body: &T) -> Result<R, OverlayError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.send(dst, body).await?.decode()
    }

    /// Send `body` to every roster member in turn. Failures are collected
    /// and reported together.
    pub async fn send_to_all<T: Serialize>(
        &self,
        roster: &Roster,
        body: &T,
    ) -> Result<Vec<ClientReply>, OverlayError> {
        let mut replies = Vec::with_capacity(roster.len());
        let mut failures = Vec::new();
        for entity in roster.list() {
            match self.send(entity, body).await {
                Ok(reply) => replies.push(reply),
                Err(e) => failures.push(format!("{entity}: {e}")),
            }
        }
        if failures.is_empty() {
            Ok(replies)
        } else {
            Err(OverlayError::SendFailures(failures.join("\n")))
        }
    }
}
