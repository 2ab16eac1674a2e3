/// Roster: the ordered, deduplicated set of peers a tree is built over.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arbor_transport::{Entity, EntityId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::ids::RosterId;
use crate::tree::Tree;

/// An ordered list of entities plus their aggregate public key.
///
/// Immutable once created. Trees share a roster through `Arc`. The
/// aggregate key is recomputed when a roster is decoded from the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RosterRepr", from = "RosterRepr")]
pub struct Roster {
    id: RosterId,
    list: Vec<Entity>,
    aggregate: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct RosterRepr {
    id: RosterId,
    list: Vec<Entity>,
}

impl From<RosterRepr> for Roster {
    fn from(repr: RosterRepr) -> Self {
        let aggregate = repr.list.iter().map(Entity::public).sum();
        Roster {
            id: repr.id,
            list: repr.list,
            aggregate,
        }
    }
}

impl From<Roster> for RosterRepr {
    fn from(roster: Roster) -> Self {
        RosterRepr {
            id: roster.id,
            list: roster.list,
        }
    }
}

impl Roster {
    /// Build a roster with a fresh random id. Later duplicates of an entity
    /// (same [`EntityId`]) are dropped; order is otherwise preserved.
    pub fn new(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut seen = HashSet::new();
        let list: Vec<Entity> = entities
            .into_iter()
            .filter(|e| seen.insert(e.id()))
            .collect();
        let aggregate = list.iter().map(Entity::public).sum();
        Self {
            id: RosterId::random(),
            list,
            aggregate,
        }
    }

    pub fn id(&self) -> RosterId {
        self.id
    }

    pub fn list(&self) -> &[Entity] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Entity> {
        self.list.get(index)
    }

    /// Position and entity for `id`, if present.
    pub fn search(&self, id: &EntityId) -> Option<(usize, &Entity)> {
        self.list.iter().enumerate().find(|(_, e)| e.id() == *id)
    }

    /// Sum of every member's public key.
    pub fn aggregate(&self) -> &PublicKey {
        &self.aggregate
    }

    // ── Tree generation ─────────────────────────────────────────────

    /// A tree with one node per roster entry and at most `bf` children
    /// per node, rooted at the first entry.
    pub fn generate_nary_tree(self: &Arc<Self>, bf: usize) -> Result<Tree, OverlayError> {
        Tree::generate(self.clone(), bf, self.len(), 0)
    }

    pub fn generate_binary_tree(self: &Arc<Self>) -> Result<Tree, OverlayError> {
        self.generate_nary_tree(2)
    }

    /// A tree of `nodes` positions, reusing entities when `nodes` exceeds the
    /// roster size.
    pub fn generate_big_nary_tree(
        self: &Arc<Self>,
        bf: usize,
        nodes: usize,
    ) -> Result<Tree, OverlayError> {
        Tree::generate(self.clone(), bf, nodes, 0)
    }

    /// Like [`generate_nary_tree`](Self::generate_nary_tree) but rooted at `root`.
    pub fn generate_nary_tree_with_root(
        self: &Arc<Self>,
        bf: usize,
        root: &EntityId,
    ) -> Result<Tree, OverlayError> {
        let (index, _) = self.search(root).ok_or_else(|| {
            OverlayError::InvalidTopology(format!("root {root} is not in roster {}", self.id))
        })?;
        Tree::generate(self.clone(), bf, self.len(), index)
    }
}

impl fmt::Debug for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roster")
            .field("id", &self.id)
            .field("len", &self.list.len())
            .finish()
    }
}
