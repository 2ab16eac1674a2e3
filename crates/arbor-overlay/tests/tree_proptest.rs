use std::collections::HashSet;
use std::sync::Arc;

use arbor_overlay::{
    ProtocolId, Roster, RosterId, RoundId, ServiceId, Token, TreeId, TreeNodeId,
};
use arbor_transport::{Entity, KeyPair};
use proptest::prelude::*;
use uuid::Uuid;

/// `n` entities spread over `hosts` distinct IPs.
fn roster(n: usize, hosts: usize) -> Arc<Roster> {
    Arc::new(Roster::new((0..n).map(|i| {
        Entity::new(
            KeyPair::from_seed(&(i as u64).to_le_bytes()).public(),
            format!("10.1.0.{}:{}", i % hosts.max(1) + 1, 7000 + i),
        )
    })))
}

fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

fn arb_token() -> impl Strategy<Value = Token> {
    (arb_uuid(), arb_uuid(), arb_uuid(), arb_uuid(), arb_uuid(), arb_uuid()).prop_map(
        |(r, t, p, s, round, node)| {
            Token::new(
                RosterId::from_uuid(r),
                TreeId::from_uuid(t),
                ProtocolId::from_uuid(p),
                ServiceId::from_uuid(s),
                RoundId::from_uuid(round),
                TreeNodeId::from_uuid(node),
            )
        },
    )
}

proptest! {
    /// One node per entity, one parent per non-root node, at most `bf`
    /// children everywhere.
    #[test]
    fn nary_tree_shape(n in 1..40usize, bf in 1..6usize, hosts in 1..5usize) {
        let roster = roster(n, hosts);
        let tree = Arc::new(roster.generate_nary_tree(bf).unwrap());

        prop_assert_eq!(tree.size(), n);
        prop_assert!(tree.is_nary(bf));
        let nodes = tree.list();
        prop_assert!(nodes[0].is_root());
        for node in &nodes[1..] {
            let parent = node.parent().unwrap();
            prop_assert!(parent.children().contains(node));
        }
        let ids: HashSet<_> = nodes.iter().map(|n| n.id()).collect();
        prop_assert_eq!(ids.len(), n);
    }

    /// Entities are reused evenly when there are more positions than entities.
    #[test]
    fn big_tree_reuse_is_even(n in 1..8usize, nodes in 1..60usize, bf in 1..5usize) {
        let roster = roster(n, n);
        let tree = Arc::new(roster.generate_big_nary_tree(bf, nodes).unwrap());
        prop_assert_eq!(tree.size(), nodes);
        prop_assert!(tree.is_nary(bf));

        let mut uses = vec![0usize; n];
        for node in tree.list() {
            uses[node.roster_index()] += 1;
        }
        let max = *uses.iter().max().unwrap();
        let min = *uses.iter().min().unwrap();
        prop_assert!(max - min <= 1, "uneven reuse {:?}", uses);
    }

    /// Marshal then rebuild against the same roster gives the same tree.
    #[test]
    fn marshal_rebuild_is_identity(n in 1..30usize, bf in 1..5usize) {
        let roster = roster(n, 3);
        let tree = roster.generate_nary_tree(bf).unwrap();

        let bytes = rmp_serde::to_vec_named(&tree.marshal()).unwrap();
        let marshal: arbor_overlay::TreeMarshal = rmp_serde::from_slice(&bytes).unwrap();
        let rebuilt = marshal.make_tree(roster.clone()).unwrap();

        prop_assert_eq!(rebuilt.id(), tree.id());
        prop_assert!(rebuilt == tree);
    }

    /// Token ids are stable and sensitive to the tree node id.
    #[test]
    fn token_id_idempotent_and_unique(token in arb_token(), other in arb_uuid()) {
        prop_assert_eq!(token.id(), token.id());

        let moved = token.change_tree_node_id(TreeNodeId::from_uuid(other));
        if moved.tree_node_id() != token.tree_node_id() {
            prop_assert_ne!(moved.id(), token.id());
        } else {
            prop_assert_eq!(moved.id(), token.id());
        }
    }

    /// Rosters keep the first occurrence of each entity.
    #[test]
    fn roster_dedupes(n in 1..20usize, dupes in 0..10usize) {
        let base = roster(n, 2);
        let mut entities = base.list().to_vec();
        entities.extend(base.list().iter().take(dupes).cloned());
        let roster = Roster::new(entities);
        prop_assert_eq!(roster.len(), n);
        prop_assert_eq!(roster.list(), base.list());
    }
}
