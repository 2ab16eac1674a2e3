/// Buffers for traffic that arrived before its topology.
///
/// Data waiting for a tree is kept in arrival order together with the set
/// of trees already requested, under one lock. Tree marshals waiting for a
/// roster are grouped by roster id under a second lock.
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ids::{RosterId, TreeId};
use crate::message::ProtocolMsg;
use crate::tree::TreeMarshal;

struct Parked<T> {
    item: T,
    since: Instant,
}

#[derive(Default)]
pub(crate) struct PendingData {
    queue: Vec<Parked<ProtocolMsg>>,
    requested: HashSet<TreeId>,
}

impl PendingData {
    /// Park `msg`. Returns true if nobody asked for its tree yet, in which
    /// case the caller must send the request.
    pub fn park(&mut self, msg: ProtocolMsg) -> bool {
        let tree = msg.to.tree_id();
        self.queue.push(Parked {
            item: msg,
            since: Instant::now(),
        });
        self.requested.insert(tree)
    }
}

#[derive(Default)]
pub(crate) struct Pending {
    data: Mutex<PendingData>,
    trees: Mutex<HashMap<RosterId, Vec<Parked<TreeMarshal>>>>,
}

/// Counts of parked entries, for status reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingStats {
    pub data: usize,
    pub trees: usize,
}

impl Pending {
    /// Lock the data buffer. Callers check for the tree while holding it so
    /// that a concurrent registration cannot slip between check and park.
    pub fn data(&self) -> parking_lot::MutexGuard<'_, PendingData> {
        self.data.lock()
    }

    /// Remove every message for `tree`, in arrival order, keeping the rest.
    pub fn take_for_tree(&self, tree: TreeId) -> Vec<ProtocolMsg> {
        let mut data = self.data.lock();
        data.requested.remove(&tree);
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut data.queue)
            .into_iter()
            .partition(|p| p.item.to.tree_id() == tree);
        data.queue = rest;
        ready.into_iter().map(|p| p.item).collect()
    }

    /// Forget that `tree` was requested, so the next message re-requests it.
    pub fn clear_request(&self, tree: TreeId) {
        self.data.lock().requested.remove(&tree);
    }

    /// Park a tree marshal. Returns true if it is the first one waiting on
    /// its roster, in which case the caller must request the roster.
    pub fn park_tree(&self, marshal: TreeMarshal) -> bool {
        let mut trees = self.trees.lock();
        let waiting = trees.entry(marshal.roster_id).or_default();
        let first = waiting.is_empty();
        waiting.push(Parked {
            item: marshal,
            since: Instant::now(),
        });
        first
    }

    pub fn take_trees(&self, roster: RosterId) -> Vec<TreeMarshal> {
        self.trees
            .lock()
            .remove(&roster)
            .map(|v| v.into_iter().map(|p| p.item).collect())
            .unwrap_or_default()
    }

    /// Drop entries older than `timeout`. Returns (data, trees) evicted.
    pub fn evict_expired(&self, timeout: Duration) -> (usize, usize) {
        let now = Instant::now();
        let expired = |since: Instant| now.duration_since(since) >= timeout;

        let data_evicted = {
            let mut data = self.data.lock();
            let before = data.queue.len();
            let mut dropped_trees = HashSet::new();
            data.queue.retain(|p| {
                let keep = !expired(p.since);
                if !keep {
                    dropped_trees.insert(p.item.to.tree_id());
                }
                keep
            });
            // A tree whose every waiter expired may be requested again.
            for tree in dropped_trees {
                if !data.queue.iter().any(|p| p.item.to.tree_id() == tree) {
                    data.requested.remove(&tree);
                }
            }
            before - data.queue.len()
        };

        let trees_evicted = {
            let mut trees = self.trees.lock();
            let mut evicted = 0;
            trees.retain(|_, waiting| {
                let before = waiting.len();
                waiting.retain(|p| !expired(p.since));
                evicted += before - waiting.len();
                !waiting.is_empty()
            });
            evicted
        };

        (data_evicted, trees_evicted)
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            data: self.data.lock().queue.len(),
            trees: self.trees.lock().values().map(Vec::len).sum(),
        }
    }

    pub fn clear(&self) {
        let mut data = self.data.lock();
        data.queue.clear();
        data.requested.clear();
        drop(data);
        self.trees.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ProtocolId, RoundId, ServiceId, TreeNodeId};
    use crate::token::Token;
    use arbor_transport::EntityId;
    use uuid::Uuid;

    fn msg(tree: TreeId, seq: u8) -> ProtocolMsg {
        let token = Token::new(
            RosterId::nil(),
            tree,
            ProtocolId::from_name("p"),
            ServiceId::nil(),
            RoundId::nil(),
            TreeNodeId::nil(),
        );
        ProtocolMsg {
            from: token.clone(),
            to: token,
            msg_type: crate::ids::MessageTypeId::nil(),
            payload: vec![seq],
            entity: None,
        }
    }

    fn marshal(roster: RosterId) -> TreeMarshal {
        TreeMarshal {
            node_id: TreeNodeId::nil(),
            tree_id: TreeId::from_uuid(Uuid::new_v4()),
            entity_id: "00000000-0000-0000-0000-000000000001"
                .parse::<EntityId>()
                .unwrap(),
            roster_id: roster,
            children: vec![],
        }
    }

    #[test]
    fn request_once_per_missing_tree() {
        let pending = Pending::default();
        let t1 = TreeId::from_uuid(Uuid::new_v4());
        let t2 = TreeId::from_uuid(Uuid::new_v4());
        assert!(pending.data().park(msg(t1, 1)));
        assert!(!pending.data().park(msg(t1, 2)));
        assert!(pending.data().park(msg(t2, 3)));
        assert_eq!(pending.stats().data, 3);
    }

    #[test]
    fn take_preserves_order_and_retains_others() {
        let pending = Pending::default();
        let t1 = TreeId::from_uuid(Uuid::new_v4());
        let t2 = TreeId::from_uuid(Uuid::new_v4());
        pending.data().park(msg(t1, 1));
        pending.data().park(msg(t2, 2));
        pending.data().park(msg(t1, 3));

        let ready: Vec<u8> = pending
            .take_for_tree(t1)
            .iter()
            .map(|m| m.payload[0])
            .collect();
        assert_eq!(ready, vec![1, 3]);
        assert_eq!(pending.stats().data, 1);
        assert!(pending.take_for_tree(t1).is_empty());
        // t1 may be requested again after resolution.
        assert!(pending.data().park(msg(t1, 4)));
    }

    #[test]
    fn trees_grouped_by_roster() {
        let pending = Pending::default();
        let r = RosterId::random();
        assert!(pending.park_tree(marshal(r)));
        assert!(!pending.park_tree(marshal(r)));
        assert_eq!(pending.stats().trees, 2);
        assert_eq!(pending.take_trees(r).len(), 2);
        assert!(pending.take_trees(r).is_empty());
    }

    #[test]
    fn eviction_clears_request_markers() {
        let pending = Pending::default();
        let t = TreeId::from_uuid(Uuid::new_v4());
        pending.data().park(msg(t, 1));
        pending.park_tree(marshal(RosterId::random()));

        assert_eq!(pending.evict_expired(Duration::from_secs(3600)), (0, 0));
        assert_eq!(pending.evict_expired(Duration::ZERO), (1, 1));
        assert_eq!(pending.stats(), PendingStats::default());
        assert!(pending.data().park(msg(t, 2)));
    }
}
