/// Rooted topologies over a [`Roster`].
///
/// A [`Tree`] is an arena of node records stored in breadth-first order,
/// root first; parents are indices into the arena. [`TreeNode`] is a cheap
/// handle (`Arc<Tree>` + index) that protocols pass around.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use arbor_transport::{content_id, Entity, EntityId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::ids::{RosterId, TreeId, TreeNodeId};
use crate::roster::Roster;

// ── Arena ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeRecord {
    id: TreeNodeId,
    roster_index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    /// This node's key plus every descendant's.
    aggregate: PublicKey,
}

/// A rooted tree over a roster. Immutable once built.
pub struct Tree {
    id: TreeId,
    roster: Arc<Roster>,
    nodes: Vec<NodeRecord>,
}

/// Shape of one position before ids and aggregates are assigned.
struct Slot {
    id: Option<TreeNodeId>,
    roster_index: usize,
    parent: Option<usize>,
}

fn node_id(roster: RosterId, position: usize, entity: &EntityId) -> TreeNodeId {
    TreeNodeId::from_uuid(content_id(
        "arbor/treenode",
        &[
            roster.as_bytes(),
            &(position as u64).to_be_bytes(),
            entity.as_uuid().as_bytes(),
        ],
    ))
}

fn tree_id(roster: RosterId, root: TreeNodeId) -> TreeId {
    TreeId::from_uuid(content_id(
        "arbor/tree",
        &[roster.as_bytes(), root.as_bytes()],
    ))
}

impl Tree {
    /// Assemble a tree from breadth-first slots (parents before children).
    fn assemble(
        roster: Arc<Roster>,
        slots: Vec<Slot>,
        id: Option<TreeId>,
    ) -> Result<Tree, OverlayError> {
        let mut nodes = Vec::with_capacity(slots.len());
        for (position, slot) in slots.iter().enumerate() {
            let entity = roster.get(slot.roster_index).ok_or_else(|| {
                OverlayError::InvalidTopology(format!(
                    "roster index {} out of range",
                    slot.roster_index
                ))
            })?;
            nodes.push(NodeRecord {
                id: slot
                    .id
                    .unwrap_or_else(|| node_id(roster.id(), position, &entity.id())),
                roster_index: slot.roster_index,
                parent: slot.parent,
                children: Vec::new(),
                aggregate: *entity.public(),
            });
        }
        for index in 1..nodes.len() {
            match nodes[index].parent {
                Some(parent) if parent < index => nodes[parent].children.push(index),
                _ => {
                    return Err(OverlayError::InvalidTopology(format!(
                        "node {index} has no earlier parent"
                    )))
                }
            }
        }
        // Single bottom-up pass: children always sit after their parent.
        for index in (1..nodes.len()).rev() {
            if let Some(parent) = nodes[index].parent {
                let sub = nodes[index].aggregate;
                nodes[parent].aggregate = nodes[parent].aggregate + sub;
            }
        }
        let root = nodes
            .first()
            .ok_or_else(|| OverlayError::InvalidTopology("empty tree".into()))?
            .id;
        Ok(Tree {
            id: id.unwrap_or_else(|| tree_id(roster.id(), root)),
            roster,
            nodes,
        })
    }

    /// Breadth-first n-ary construction.
    ///
    /// Each new position takes the least-used roster entry, preferring one
    /// on a different network host than its parent, scanning round-robin
    /// from where the previous pick left off. With as many nodes as roster
    /// entries every entity is used exactly once; beyond that entities are
    /// reused evenly.
    pub(crate) fn generate(
        roster: Arc<Roster>,
        bf: usize,
        nodes: usize,
        root_index: usize,
    ) -> Result<Tree, OverlayError> {
        if roster.is_empty() || nodes == 0 {
            return Err(OverlayError::InvalidTopology(
                "a tree needs at least one node and one entity".into(),
            ));
        }
        if bf == 0 && nodes > 1 {
            return Err(OverlayError::InvalidTopology(
                "branching factor 0 only allows a single node".into(),
            ));
        }

        let len = roster.len();
        let mut uses = vec![0usize; len];
        uses[root_index] = 1;
        let mut cursor = (root_index + 1) % len;
        let mut slots = vec![Slot {
            id: None,
            roster_index: root_index,
            parent: None,
        }];

        let mut parent = 0;
        while slots.len() < nodes {
            let parent_host = roster.list()[slots[parent].roster_index].host();
            for _ in 0..bf {
                if slots.len() == nodes {
                    break;
                }
                let pick = (0..len)
                    .map(|offset| (cursor + offset) % len)
                    .min_by_key(|&i| (uses[i], roster.list()[i].host() == parent_host))
                    .unwrap_or(cursor);
                uses[pick] += 1;
                cursor = (pick + 1) % len;
                slots.push(Slot {
                    id: None,
                    roster_index: pick,
                    parent: Some(parent),
                });
            }
            parent += 1;
        }

        Self::assemble(roster, slots, None)
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Number of positions.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(self: &Arc<Self>) -> TreeNode {
        TreeNode {
            tree: self.clone(),
            index: 0,
        }
    }

    pub fn search(self: &Arc<Self>, id: &TreeNodeId) -> Option<TreeNode> {
        self.nodes
            .iter()
            .position(|n| n.id == *id)
            .map(|index| TreeNode {
                tree: self.clone(),
                index,
            })
    }

    /// Every position, breadth-first from the root.
    pub fn list(self: &Arc<Self>) -> Vec<TreeNode> {
        (0..self.nodes.len())
            .map(|index| TreeNode {
                tree: self.clone(),
                index,
            })
            .collect()
    }

    /// Longest root-to-leaf path, counted in nodes.
    pub fn depth(&self) -> usize {
        let mut depth = vec![0usize; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            depth[index] = node.parent.map(|p| depth[p] + 1).unwrap_or(1);
        }
        depth.into_iter().max().unwrap_or(0)
    }

    /// True if every node has at most `bf` children and every non-root node
    /// exactly one parent.
    pub fn is_nary(&self, bf: usize) -> bool {
        self.nodes.iter().enumerate().all(|(index, node)| {
            node.children.len() <= bf && (index == 0) == node.parent.is_none()
        })
    }

    pub fn is_binary(&self) -> bool {
        self.is_nary(2)
    }

    /// Wire projection: forward edges only, ids preserved.
    pub fn marshal(&self) -> TreeMarshal {
        self.marshal_node(0)
    }

    fn marshal_node(&self, index: usize) -> TreeMarshal {
        let node = &self.nodes[index];
        let is_root = index == 0;
        TreeMarshal {
            node_id: node.id,
            tree_id: if is_root { self.id } else { TreeId::nil() },
            entity_id: self.roster.list()[node.roster_index].id(),
            roster_id: if is_root {
                self.roster.id()
            } else {
                RosterId::nil()
            },
            children: node
                .children
                .iter()
                .map(|&child| self.marshal_node(child))
                .collect(),
        }
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.roster.id() == other.roster.id() && self.nodes == other.nodes
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("roster", &self.roster.id())
            .field("size", &self.nodes.len())
            .finish()
    }
}

/// Indented dump, one line per node.
impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = vec![(0usize, 0usize)];
        while let Some((index, level)) = stack.pop() {
            let node = &self.nodes[index];
            let entity = &self.roster.list()[node.roster_index];
            writeln!(f, "{:indent$}- {} {:?}", "", entity, node.id, indent = level * 2)?;
            for &child in node.children.iter().rev() {
                stack.push((child, level + 1));
            }
        }
        Ok(())
    }
}

// ── TreeNode handle ─────────────────────────────────────────────────

/// One position in a [`Tree`].
#[derive(Clone)]
pub struct TreeNode {
    tree: Arc<Tree>,
    index: usize,
}

impl TreeNode {
    fn record(&self) -> &NodeRecord {
        &self.tree.nodes[self.index]
    }

    fn at(&self, index: usize) -> TreeNode {
        TreeNode {
            tree: self.tree.clone(),
            index,
        }
    }

    pub fn id(&self) -> TreeNodeId {
        self.record().id
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn roster_index(&self) -> usize {
        self.record().roster_index
    }

    pub fn entity(&self) -> &Entity {
        &self.tree.roster.list()[self.record().roster_index]
    }

    pub fn parent(&self) -> Option<TreeNode> {
        self.record().parent.map(|p| self.at(p))
    }

    pub fn children(&self) -> Vec<TreeNode> {
        self.record().children.iter().map(|&c| self.at(c)).collect()
    }

    pub fn child_count(&self) -> usize {
        self.record().children.len()
    }

    pub fn is_root(&self) -> bool {
        self.record().parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.record().children.is_empty()
    }

    /// Sum of this node's key and all of its descendants' keys.
    pub fn aggregate(&self) -> &PublicKey {
        &self.record().aggregate
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        self.tree.id == other.tree.id && self.id() == other.id()
    }
}

impl Eq for TreeNode {}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeNode({:?} @ {})", self.id(), self.entity())
    }
}

// ── Wire form ───────────────────────────────────────────────────────

/// Wire-safe projection of a tree: each node lists its children; no
/// parent links are serialized. Tree and roster ids are set on the root
/// only and are nil below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMarshal {
    pub node_id: TreeNodeId,
    pub tree_id: TreeId,
    pub entity_id: EntityId,
    pub roster_id: RosterId,
    pub children: Vec<TreeMarshal>,
}

impl TreeMarshal {
    /// Rebuild the tree against `roster`, re-attaching parent links.
    pub fn make_tree(&self, roster: Arc<Roster>) -> Result<Tree, OverlayError> {
        if self.roster_id != roster.id() {
            return Err(OverlayError::RosterMismatch {
                expected: self.roster_id,
                got: roster.id(),
            });
        }

        let mut slots = Vec::new();
        let mut queue = VecDeque::from([(self, None)]);
        while let Some((marshal, parent)) = queue.pop_front() {
            let (roster_index, _) = roster.search(&marshal.entity_id).ok_or_else(|| {
                OverlayError::InvalidTopology(format!(
                    "entity {} is not in roster {}",
                    marshal.entity_id,
                    roster.id()
                ))
            })?;
            let position = slots.len();
            slots.push(Slot {
                id: Some(marshal.node_id),
                roster_index,
                parent,
            });
            for child in &marshal.children {
                queue.push_back((child, Some(position)));
            }
        }

        Tree::assemble(roster, slots, Some(self.tree_id))
    }
}
