//! Hierarchy walks: tree materialization and container expansion.
//!
//! Nothing in storage stops `parent_id` facts from forming a cycle, so both
//! walks are iterative and track what they have already visited.

use crate::graph::{FactGraph, NodeView};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use steward_core::{EntityId, Error, Result};
use tracing::{debug, error, warn};

/// A node and its descendants. Serializes as the node view with a
/// `children` list added when there are any.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeNode {
    pub node: NodeView,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn id(&self) -> EntityId {
        self.node.id()
    }

    /// Number of nodes in this subtree, root included.
    pub fn size(&self) -> usize {
        let mut size = 0;
        let mut pending = vec![self];
        while let Some(tree) = pending.pop() {
            size += 1;
            pending.extend(tree.children.iter());
        }
        size
    }

    pub fn to_value(&self) -> Value {
        let mut doc = self.node.to_document();
        if !self.children.is_empty() {
            if let Value::Object(map) = &mut doc {
                let children = self.children.iter().map(TreeNode::to_value).collect();
                map.insert("children".to_string(), Value::Array(children));
            }
        }
        doc
    }
}

impl Serialize for TreeNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl FactGraph {
    /// Materialize the subtree rooted at `root`.
    ///
    /// Each node appears at most once. An edge back to a node already placed
    /// is logged and dropped, so cyclic data still yields a finite tree.
    pub fn build_tree(&self, root: EntityId) -> Result<TreeNode> {
        self.get_node(root)?;
        let snapshot = self.snapshot();

        let mut placed = HashSet::from([root]);
        let mut kept: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        let mut order = vec![root];
        let mut queue = VecDeque::from([root]);

        while let Some(id) = queue.pop_front() {
            for &child in snapshot.children_of(id) {
                if !placed.insert(child) {
                    error!(
                        "Loop detected in node hierarchy: {} -> {} already in tree rooted at {}",
                        id, child, root
                    );
                    continue;
                }
                kept.entry(id).or_default().push(child);
                order.push(child);
                queue.push_back(child);
            }
        }

        // Breadth-first order reversed puts every child before its parent.
        let mut built: HashMap<EntityId, TreeNode> = HashMap::with_capacity(order.len());
        for id in order.into_iter().rev() {
            let node = snapshot
                .node(id)
                .cloned()
                .ok_or_else(|| Error::not_found("node", id))?;
            let children = kept
                .remove(&id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|child| built.remove(&child))
                .collect();
            built.insert(id, TreeNode { node, children });
        }

        built
            .remove(&root)
            .ok_or_else(|| Error::not_found("node", root))
    }

    /// Replace container nodes by the leaf nodes beneath them.
    ///
    /// Non-containers pass through. The result has no duplicates and keeps
    /// the order in which nodes are first reached. Every input id must exist.
    pub fn expand_nodes(&self, ids: &[EntityId]) -> Result<Vec<EntityId>> {
        let snapshot = self.snapshot();
        for id in ids {
            if snapshot.node(*id).is_none() {
                return Err(Error::not_found("node", id));
            }
        }

        let mut expanded = Vec::new();
        let mut emitted = HashSet::new();
        let mut opened = HashSet::new();
        let mut stack: Vec<EntityId> = ids.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            let Some(view) = snapshot.node(id) else {
                continue;
            };
            if view.is_container() {
                if !opened.insert(id) {
                    warn!("Container {} reached twice while expanding, skipping", id);
                    continue;
                }
                stack.extend(snapshot.children_of(id).iter().rev().copied());
            } else if emitted.insert(id) {
                expanded.push(id);
            }
        }

        debug!("Expanded {:?} to {:?}", ids, expanded);
        Ok(expanded)
    }
}
