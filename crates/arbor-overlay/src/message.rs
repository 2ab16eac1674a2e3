/// Wire messages exchanged between hosts.
///
/// Every frame on a connection is one [`Packet`]. Protocol payloads travel
/// MessagePack-encoded inside [`ProtocolMsg`] and are decoded only by the
/// tree node instance that registered their type.
use arbor_transport::Entity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::ids::{MessageTypeId, RosterId, ServiceId, TreeId};
use crate::roster::Roster;
use crate::token::Token;
use crate::tree::TreeMarshal;

/// A payload type protocols exchange through the overlay.
///
/// `NAME` must be unique among the messages a protocol registers; the
/// [`MessageTypeId`] on the wire is derived from it.
///
/// ```rust
/// use arbor_overlay::ProtocolMessage;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Announce {
///     round: u32,
/// }
///
/// impl ProtocolMessage for Announce {
///     const NAME: &'static str = "example.Announce";
/// }
/// ```
pub trait ProtocolMessage: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    fn message_type() -> MessageTypeId {
        MessageTypeId::from_name(Self::NAME)
    }
}

/// Protocol traffic envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMsg {
    pub from: Token,
    pub to: Token,
    pub msg_type: MessageTypeId,
    pub payload: Vec<u8>,
    /// Sender identity, filled in by the receiving host.
    #[serde(skip)]
    pub entity: Option<Entity>,
}

impl ProtocolMsg {
    pub fn new<M: ProtocolMessage>(from: Token, to: Token, msg: &M) -> Result<Self, OverlayError> {
        Ok(Self {
            from,
            to,
            msg_type: M::message_type(),
            payload: rmp_serde::to_vec_named(msg)?,
            entity: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTree {
    pub tree_id: TreeId,
}

/// Answer to [`RequestTree`]; `tree` is `None` when the responder does not
/// know the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTree {
    pub tree_id: TreeId,
    pub tree: Option<TreeMarshal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRoster {
    pub roster_id: RosterId,
}

/// Answer to [`RequestRoster`]; `roster` is `None` when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRoster {
    pub roster_id: RosterId,
    pub roster: Option<Roster>,
}

/// Client-to-service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub service: ServiceId,
    pub data: Vec<u8>,
}

/// Service-to-service message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub service: ServiceId,
    pub data: Vec<u8>,
}

/// Service-to-client reply: either a payload or an error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub service: ServiceId,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl ClientRequest {
    pub fn new<T: Serialize>(service: &str, body: &T) -> Result<Self, OverlayError> {
        Ok(Self {
            service: ServiceId::from_name(service),
            data: rmp_serde::to_vec_named(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OverlayError> {
        Ok(rmp_serde::from_slice(&self.data)?)
    }
}

impl ServiceMessage {
    pub fn new<T: Serialize>(service: &str, body: &T) -> Result<Self, OverlayError> {
        Ok(Self {
            service: ServiceId::from_name(service),
            data: rmp_serde::to_vec_named(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OverlayError> {
        Ok(rmp_serde::from_slice(&self.data)?)
    }
}

impl ClientReply {
    pub fn ok<T: Serialize>(service: ServiceId, body: &T) -> Result<Self, OverlayError> {
        Ok(Self {
            service,
            data: rmp_serde::to_vec_named(body)?,
            error: None,
        })
    }

    pub fn error(service: ServiceId, reason: impl Into<String>) -> Self {
        Self {
            service,
            data: Vec::new(),
            error: Some(reason.into()),
        }
    }

    /// Decode the payload, or surface the service's error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OverlayError> {
        if let Some(reason) = &self.error {
            return Err(OverlayError::Service(reason.clone()));
        }
        Ok(rmp_serde::from_slice(&self.data)?)
    }
}

/// Every frame exchanged between hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    Data(ProtocolMsg),
    RequestTree(RequestTree),
    SendTree(SendTree),
    RequestRoster(RequestRoster),
    SendRoster(SendRoster),
    ClientRequest(ClientRequest),
    ServiceMessage(ServiceMessage),
    ClientReply(ClientReply),
}

impl Packet {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Data(_) => "Data",
            Packet::RequestTree(_) => "RequestTree",
            Packet::SendTree(_) => "SendTree",
            Packet::RequestRoster(_) => "RequestRoster",
            Packet::SendRoster(_) => "SendRoster",
            Packet::ClientRequest(_) => "ClientRequest",
            Packet::ServiceMessage(_) => "ServiceMessage",
            Packet::ClientReply(_) => "ClientReply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ProtocolId, RoundId, TreeNodeId};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Hello {
        text: String,
    }

    impl ProtocolMessage for Hello {
        const NAME: &'static str = "test.Hello";
    }

    fn token() -> Token {
        Token::new(
            RosterId::random(),
            TreeId::nil(),
            ProtocolId::from_name("p"),
            ServiceId::nil(),
            RoundId::random(),
            TreeNodeId::nil(),
        )
    }

    #[test]
    fn data_packet_survives_the_wire() {
        let msg = ProtocolMsg::new(token(), token(), &Hello { text: "hi".into() }).unwrap();
        let bytes = rmp_serde::to_vec_named(&Packet::Data(msg.clone())).unwrap();
        let back: Packet = rmp_serde::from_slice(&bytes).unwrap();
        match back {
            Packet::Data(d) => {
                assert_eq!(d.msg_type, Hello::message_type());
                assert_eq!(d.to, msg.to);
                assert!(d.entity.is_none());
                let hello: Hello = rmp_serde::from_slice(&d.payload).unwrap();
                assert_eq!(hello.text, "hi");
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn empty_responses_are_explicit() {
        let p = Packet::SendRoster(SendRoster {
            roster_id: RosterId::random(),
            roster: None,
        });
        let bytes = rmp_serde::to_vec_named(&p).unwrap();
        match rmp_serde::from_slice::<Packet>(&bytes).unwrap() {
            Packet::SendRoster(r) => assert!(r.roster.is_none()),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn reply_error_surfaces() {
        let reply = ClientReply::error(ServiceId::from_name("s"), "no such round");
        let err = reply.decode::<u32>().unwrap_err();
        assert_eq!(err.to_string(), "service error: no such round");

        let ok = ClientReply::ok(ServiceId::from_name("s"), &7u32).unwrap();
        assert_eq!(ok.decode::<u32>().unwrap(), 7);
    }
}
