use crate::ids::{MessageTypeId, ProtocolId, RosterId, TreeNodeId};

/// Overlay-level errors.
///
/// Wraps transport errors and adds the topology, routing and lifecycle
/// variants of the runtime.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("transport error: {0}")]
    Transport(#[from] arbor_transport::TransportError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ── Topology ────────────────────────────────────────────────────
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("no tree node {0} in this tree")]
    UnknownTreeNode(TreeNodeId),

    #[error("tree marshal references roster {expected}, got {got}")]
    RosterMismatch { expected: RosterId, got: RosterId },

    // ── Protocols ───────────────────────────────────────────────────
    #[error("protocol {0:?} is not registered")]
    UnknownProtocol(String),

    #[error("no protocol registered for id {0}")]
    UnknownProtocolId(ProtocolId),

    #[error("protocol {0:?} is already registered")]
    ProtocolRegistered(String),

    #[error("tree node instance does not exist")]
    UnknownInstance,

    #[error("a protocol instance is already bound to this tree node instance")]
    InstanceAlreadyBound,

    // ── Dispatch ────────────────────────────────────────────────────
    #[error("message type {0} is not handled by this protocol")]
    MessageNotHandled(MessageTypeId),

    #[error("a handler for {0} is already registered")]
    HandlerAlreadyRegistered(&'static str),

    #[error("delivery queue for {0} is closed")]
    ChannelClosed(&'static str),

    #[error("decoded message is not a {0}")]
    TypeMismatch(&'static str),

    #[error("send failures: {0}")]
    SendFailures(String),

    // ── Services ────────────────────────────────────────────────────
    #[error("service {0:?} is already registered")]
    ServiceRegistered(String),

    #[error("service error: {0}")]
    Service(String),

    // ── Lifecycle ───────────────────────────────────────────────────
    #[error("host is already closing")]
    AlreadyClosing,

    #[error("overlay is shut down")]
    Shutdown,

    #[error("inbound queue is full")]
    InboundFull,

    #[error("operation timed out")]
    Timeout,
}

impl From<rmp_serde::encode::Error> for OverlayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OverlayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for OverlayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OverlayError::Deserialization(e.to_string())
    }
}
