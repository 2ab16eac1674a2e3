use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use arbor_transport::content_id;
use serde::{Deserialize, Serialize};

use crate::ids::{ProtocolId, RosterId, RoundId, ServiceId, TokenId, TreeId, TreeNodeId};

/// Address of one endpoint of one running protocol instance.
///
/// Two tokens name the same instance iff all six fields match. The
/// [`TokenId`] is a content hash of the fields, computed on first use and
/// cached in the value; [`change_tree_node_id`](Self::change_tree_node_id)
/// yields a token with a fresh cache.
#[derive(Clone, Serialize, Deserialize)]
pub struct Token {
    roster_id: RosterId,
    tree_id: TreeId,
    protocol_id: ProtocolId,
    service_id: ServiceId,
    round_id: RoundId,
    tree_node_id: TreeNodeId,
    #[serde(skip)]
    cached_id: OnceLock<TokenId>,
}

impl Token {
    pub fn new(
        roster_id: RosterId,
        tree_id: TreeId,
        protocol_id: ProtocolId,
        service_id: ServiceId,
        round_id: RoundId,
        tree_node_id: TreeNodeId,
    ) -> Self {
        Self {
            roster_id,
            tree_id,
            protocol_id,
            service_id,
            round_id,
            tree_node_id,
            cached_id: OnceLock::new(),
        }
    }

    pub fn id(&self) -> TokenId {
        *self.cached_id.get_or_init(|| {
            TokenId::from_uuid(content_id(
                "arbor/token",
                &[
                    self.roster_id.as_bytes(),
                    self.tree_id.as_bytes(),
                    self.protocol_id.as_bytes(),
                    self.service_id.as_bytes(),
                    self.round_id.as_bytes(),
                    self.tree_node_id.as_bytes(),
                ],
            ))
        })
    }

    /// Same round, different position.
    pub fn change_tree_node_id(&self, tree_node_id: TreeNodeId) -> Token {
        Token::new(
            self.roster_id,
            self.tree_id,
            self.protocol_id,
            self.service_id,
            self.round_id,
            tree_node_id,
        )
    }

    pub fn roster_id(&self) -> RosterId {
        self.roster_id
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn tree_node_id(&self) -> TreeNodeId {
        self.tree_node_id
    }

    fn fields(&self) -> (RosterId, TreeId, ProtocolId, ServiceId, RoundId, TreeNodeId) {
        (
            self.roster_id,
            self.tree_id,
            self.protocol_id,
            self.service_id,
            self.round_id,
            self.tree_node_id,
        )
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fields().hash(state);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("tree", &self.tree_id)
            .field("protocol", &self.protocol_id)
            .field("round", &self.round_id)
            .field("node", &self.tree_node_id)
            .finish()
    }
}
