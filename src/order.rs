//! Ordering of entry and exit lists.
//!
//! Exit lists must run innermost-first, and sibling parallel regions must
//! exit in reverse document order (entry lists are produced by sorting the
//! same way and reversing, which yields document order among siblings).

use crate::model::{Model, NodeId};
use std::cmp::Ordering;

/// Total order over model nodes used to sort exit and entry lists.
///
/// Deeper nodes sort before shallower ones. Nodes at equal depth are ordered
/// by the document order of their divergent ancestors, with the later
/// declared node sorting first. Returns `Equal` only for identical nodes,
/// which makes the comparator safe for `sort_by`.
pub fn exit_order(model: &Model, a: NodeId, b: NodeId) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let depth_a = model.node(a).depth;
    let depth_b = model.node(b).depth;
    match depth_b.cmp(&depth_a) {
        Ordering::Equal => {}
        unequal => return unequal,
    }
    // equal depth: walk both chains up in lockstep to the divergence point
    let (mut a, mut b) = (a, b);
    loop {
        let pa = model.node(a).parent;
        let pb = model.node(b).parent;
        if pa == pb {
            // a and b are siblings (or roots): later in document order first
            return model.node(b).order.cmp(&model.node(a).order);
        }
        match (pa, pb) {
            (Some(na), Some(nb)) => {
                a = na;
                b = nb;
            }
            // different tree heights cannot happen at equal depth
            _ => return model.node(b).order.cmp(&model.node(a).order),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use serde_json::json;

    fn model() -> Model {
        Model::from_json(&json!({
            "initial": "wrap",
            "states": [
                {"id": "wrap", "states": [
                    {"id": "p", "kind": "parallel", "states": [
                        {"id": "r1", "initial": "r1a", "states": [
                            {"id": "r1a"}, {"id": "r1b"}
                        ]},
                        {"id": "r2", "initial": "r2a", "states": [
                            {"id": "r2a"}
                        ]}
                    ]}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_deeper_first() {
        let m = model();
        let wrap = m.node_by_id("wrap").unwrap();
        let r1a = m.node_by_id("r1a").unwrap();
        assert_eq!(exit_order(&m, r1a, wrap), Ordering::Less);
        assert_eq!(exit_order(&m, wrap, r1a), Ordering::Greater);
    }

    #[test]
    fn test_equal_only_for_same_node() {
        let m = model();
        let r1a = m.node_by_id("r1a").unwrap();
        let r1b = m.node_by_id("r1b").unwrap();
        assert_eq!(exit_order(&m, r1a, r1a), Ordering::Equal);
        assert_ne!(exit_order(&m, r1a, r1b), Ordering::Equal);
    }

    #[test]
    fn test_sibling_regions_reverse_document_order() {
        let m = model();
        let r1 = m.node_by_id("r1").unwrap();
        let r2 = m.node_by_id("r2").unwrap();
        // r2 is declared later, so it exits first
        assert_eq!(exit_order(&m, r2, r1), Ordering::Less);
        assert_eq!(exit_order(&m, r1, r2), Ordering::Greater);
    }

    #[test]
    fn test_cousins_ordered_by_divergent_ancestor() {
        let m = model();
        let r1a = m.node_by_id("r1a").unwrap();
        let r2a = m.node_by_id("r2a").unwrap();
        // diverge at r1 vs r2: the r2 subtree sorts first
        assert_eq!(exit_order(&m, r2a, r1a), Ordering::Less);
    }

    #[test]
    fn test_sorted_exit_list_matches_w3c_order() {
        let m = model();
        let ids = ["r1a", "r2a", "r1", "r2", "p", "wrap"];
        let mut list: Vec<_> = ids.iter().map(|i| m.node_by_id(i).unwrap()).collect();
        list.sort_by(|x, y| exit_order(&m, *x, *y));
        let sorted: Vec<_> = list.iter().map(|n| m.id_of(*n)).collect();
        assert_eq!(sorted, vec!["r2a", "r1a", "r2", "r1", "p", "wrap"]);
    }
}
