//! Tree traversal helpers.
//!
//! Traversals return id snapshots so callers can mutate the tree while
//! walking it; a node deleted mid-walk is simply skipped when resolved.

use super::{Tree, TreeModel};
use crate::models::NodeKey;

/// Ids of the subtree rooted at `start` in pre-order (parents before
/// children).
pub fn pre_order_ids<Id: NodeKey, M: TreeModel<Id>>(
    tree: &Tree<Id, M>,
    start: Id,
    include_start: bool,
) -> Vec<Id> {
    let mut order = Vec::new();
    let mut stack = vec![start];

    while let Some(id) = stack.pop() {
        if id != start || include_start {
            order.push(id);
        }

        // Reverse so the smallest child id is visited first.
        let children: Vec<Id> = tree.children_ids(id).collect();
        stack.extend(children.into_iter().rev());
    }

    order
}

/// Ids of the subtree rooted at `start` in post-order (children strictly
/// before parents).
pub fn post_order_ids<Id: NodeKey, M: TreeModel<Id>>(
    tree: &Tree<Id, M>,
    start: Id,
    include_start: bool,
) -> Vec<Id> {
    let mut order = Vec::new();
    let mut stack = vec![(start, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            if id != start || include_start {
                order.push(id);
            }
            continue;
        }

        stack.push((id, true));

        let children: Vec<Id> = tree.children_ids(id).collect();
        for child in children.into_iter().rev() {
            stack.push((child, false));
        }
    }

    order
}
