//! Graph Traversals
//!
//! Ordering decisions over the node graph:
//!
//! - [`disposal_order`]: every node after all of its dependents, so nothing
//!   is torn down while something still depends on it.
//! - [`depth`]: length of the longest dependency chain below a node. Leaves
//!   (nodes that read nothing) have depth 0.
//! - [`depends_on`]: whether a node transitively reads another one, used to
//!   reject cycles before an edge is added.
//!
//! # Algorithm
//!
//! All three are iterative depth-first walks over an explicit stack with a
//! visited set, so deep graphs cannot overflow the call stack. The disposal
//! walk visits each node once but inspects every edge of every node it
//! reaches; its worst case is O(N·E), which is fine for graphs of the size a
//! container holds and is not meant for arbitrarily large ones.

use std::collections::{HashMap, HashSet};

use super::node::{NodeId, NodeRef};

/// Order `roots` (and every dependent reachable from them) so that each node
/// comes after all of its dependents.
pub(crate) fn disposal_order(roots: &[NodeRef]) -> Vec<NodeRef> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    for root in roots {
        if visited.contains(&root.id()) {
            continue;
        }

        // (node, expanded): a node is emitted when it is popped the second
        // time, after everything pushed above it (its dependents) is done.
        let mut stack = vec![(NodeRef::clone(root), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }

            let dependents = node.dependents();
            stack.push((node, true));
            for dependent in dependents {
                if !visited.contains(&dependent.id()) {
                    stack.push((dependent, false));
                }
            }
        }
    }

    order
}

/// Whether `node` reads `target`, directly or through other nodes.
pub(crate) fn depends_on(node: &NodeRef, target: NodeId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = node.dependencies();

    while let Some(current) = stack.pop() {
        if current.id() == target {
            return true;
        }
        if visited.insert(current.id()) {
            stack.extend(current.dependencies());
        }
    }

    false
}

/// Length of the longest dependency chain below `node`.
pub(crate) fn depth(node: &NodeRef) -> usize {
    let mut depths: HashMap<NodeId, usize> = HashMap::new();
    let mut entered = HashSet::new();
    let mut stack = vec![(NodeRef::clone(node), false)];

    while let Some((current, expanded)) = stack.pop() {
        if depths.contains_key(&current.id()) {
            continue;
        }

        let dependencies = current.dependencies();
        if expanded {
            let depth = dependencies
                .iter()
                .map(|dependency| depths.get(&dependency.id()).map_or(0, |depth| depth + 1))
                .max()
                .unwrap_or(0);
            depths.insert(current.id(), depth);
            continue;
        }
        if !entered.insert(current.id()) {
            continue;
        }

        stack.push((current, true));
        for dependency in dependencies {
            if !depths.contains_key(&dependency.id()) {
                stack.push((dependency, false));
            }
        }
    }

    depths.get(&node.id()).copied().unwrap_or(0)
}
