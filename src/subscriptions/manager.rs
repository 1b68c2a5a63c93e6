//! Path-trie subscription registry.

use crate::diff::{Delta, DiffNode, NestedDelta};
use crate::state::Notice;
use crate::types::{StatePath, StateTree};
use serde_json::Value;
use std::collections::HashMap;

use super::types::{Delivery, Listener, Payload, SubscriptionId};

type NodeId = usize;

const ROOT: NodeId = 0;

/// One path segment in the trie.
#[derive(Debug, Default)]
struct PathNode {
    /// Parent node and the segment leading here. `None` for the root.
    parent: Option<(NodeId, String)>,
    children: HashMap<String, NodeId>,
    listeners: Vec<(SubscriptionId, Listener)>,
}

/// Registry of path-scoped listeners.
///
/// Paths are stored as a trie in an arena of nodes; subscribing to `a.b.c`
/// ensures nodes for `a`, `a.b`, and `a.b.c`. Unsubscribing prunes nodes left
/// without listeners or children, and their slots are reused.
pub struct SubscriptionRegistry {
    nodes: Vec<PathNode>,
    /// Pruned slots in `nodes`.
    free: Vec<NodeId>,
    /// Node each subscription is attached to.
    owners: HashMap<SubscriptionId, NodeId>,
    next_id: u64,
    /// Whether replacing a subtree notifies listeners below it.
    notify_descendants: bool,
}

impl SubscriptionRegistry {
    /// Create an empty registry that notifies descendants on replacement.
    pub fn new() -> Self {
        Self::with_descendant_notification(true)
    }

    pub fn with_descendant_notification(notify_descendants: bool) -> Self {
        Self {
            nodes: vec![PathNode::default()],
            free: Vec::new(),
            owners: HashMap::new(),
            next_id: 1,
            notify_descendants,
        }
    }

    /// Attach `listener` at `path`, creating entries for every prefix.
    pub fn subscribe(&mut self, path: &StatePath, listener: Listener) -> SubscriptionId {
        let mut node = ROOT;
        for segment in path.segments() {
            node = match self.nodes[node].children.get(segment) {
                Some(&child) => child,
                None => {
                    let child = self.allocate(node, segment);
                    self.nodes[node].children.insert(segment.clone(), child);
                    child
                }
            };
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.nodes[node].listeners.push((id, listener));
        self.owners.insert(id, node);
        id
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.owners.remove(&id) {
            Some(node) => {
                self.nodes[node].listeners.retain(|(sid, _)| *sid != id);
                self.prune(node);
                true
            }
            None => false,
        }
    }

    fn allocate(&mut self, parent: NodeId, segment: &str) -> NodeId {
        let node = PathNode {
            parent: Some((parent, segment.to_string())),
            ..Default::default()
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Release `node` and its ancestors while they hold nothing.
    fn prune(&mut self, mut node: NodeId) {
        while node != ROOT
            && self.nodes[node].listeners.is_empty()
            && self.nodes[node].children.is_empty()
        {
            let Some((parent, segment)) = self.nodes[node].parent.take() else {
                break;
            };
            self.nodes[parent].children.remove(&segment);
            self.free.push(node);
            node = parent;
        }
    }

    /// Whether a registry entry exists for `path`.
    pub fn has_entry(&self, path: &StatePath) -> bool {
        self.find(path).is_some()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.owners.len()
    }

    /// Number of live trie nodes, the root included.
    pub fn entry_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of listeners attached exactly at `path`.
    pub fn listeners_at(&self, path: &StatePath) -> usize {
        self.find(path)
            .map(|node| self.nodes[node].listeners.len())
            .unwrap_or(0)
    }

    /// Collect and run every delivery for `notice`.
    pub fn notify(&self, notice: &Notice, root: &StateTree) {
        for delivery in self.collect(notice, root) {
            delivery.dispatch();
        }
    }

    /// Work out who hears about `notice`, without running any callback.
    ///
    /// Order: exact-path listeners, then ancestors nearest first, then
    /// descendants of a replaced subtree. `root` is the tree after the
    /// change and supplies ancestor values.
    pub fn collect(&self, notice: &Notice, root: &StateTree) -> Vec<Delivery> {
        let segments = notice.path.segments();
        let mut chain = vec![ROOT];
        let mut node = ROOT;
        for segment in segments {
            match self.nodes[node].children.get(segment) {
                Some(&child) => {
                    chain.push(child);
                    node = child;
                }
                None => break,
            }
        }
        let exact = if chain.len() == segments.len() + 1 {
            chain.pop()
        } else {
            None
        };

        let mut deliveries = Vec::new();

        if let Some(node) = exact {
            for (id, listener) in &self.nodes[node].listeners {
                let payload = match listener {
                    Listener::Value(_) => Payload::Value(notice.value.clone()),
                    Listener::Diff(_) => Payload::Delta(Delta::Direct(notice.diff.clone())),
                };
                deliveries.push(Delivery::new(
                    *id,
                    notice.path.clone(),
                    listener.clone(),
                    payload,
                ));
            }
        }

        for (depth, &ancestor) in chain.iter().enumerate().rev() {
            let listeners = &self.nodes[ancestor].listeners;
            if listeners.is_empty() {
                continue;
            }
            let prefix = StatePath::from_segments(&segments[..depth]);
            let relative_path = segments[depth..].join(".");
            for (id, listener) in listeners {
                let payload = match listener {
                    Listener::Value(_) => Payload::Value(subtree(root, &prefix)),
                    Listener::Diff(_) => Payload::Delta(Delta::Nested(NestedDelta {
                        relative_path: relative_path.clone(),
                        inner: notice.diff.clone(),
                    })),
                };
                deliveries.push(Delivery::new(*id, prefix.clone(), listener.clone(), payload));
            }
        }

        if let Some(node) = exact {
            if self.notify_descendants
                && matches!(notice.diff, DiffNode::Replace(_) | DiffNode::Remove)
            {
                self.collect_descendants(node, notice, &mut deliveries);
            }
        }

        deliveries
    }

    /// Notify listeners below a replaced subtree whose value actually changed.
    fn collect_descendants(&self, start: NodeId, notice: &Notice, deliveries: &mut Vec<Delivery>) {
        let mut stack: Vec<(NodeId, StatePath)> = self.nodes[start]
            .children
            .iter()
            .map(|(segment, &child)| (child, StatePath::root().child(segment.clone())))
            .collect();

        while let Some((node, relative)) = stack.pop() {
            for (segment, &child) in &self.nodes[node].children {
                stack.push((child, relative.child(segment.clone())));
            }

            let listeners = &self.nodes[node].listeners;
            if listeners.is_empty() {
                continue;
            }

            let before = notice
                .previous
                .as_ref()
                .and_then(|previous| relative.resolve_value(previous));
            let after = relative.resolve_value(&notice.value);
            if before == after {
                continue;
            }

            let path = notice.path.join(&relative);
            let diff = match after {
                Some(value) => DiffNode::Replace(value.clone()),
                None => DiffNode::Remove,
            };

            for (id, listener) in listeners {
                let payload = match listener {
                    Listener::Value(_) => Payload::Value(after.cloned().unwrap_or(Value::Null)),
                    Listener::Diff(_) => Payload::Delta(Delta::Direct(diff.clone())),
                };
                deliveries.push(Delivery::new(*id, path.clone(), listener.clone(), payload));
            }
        }
    }

    fn find(&self, path: &StatePath) -> Option<NodeId> {
        let mut node = ROOT;
        for segment in path.segments() {
            node = *self.nodes[node].children.get(segment)?;
        }
        Some(node)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn subtree(root: &StateTree, prefix: &StatePath) -> Value {
    if prefix.is_root() {
        return Value::Object(root.clone());
    }
    prefix.resolve(root).cloned().unwrap_or(Value::Null)
}
