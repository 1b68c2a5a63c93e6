//! Delta types produced by the diff engine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of a structural delta.
///
/// Serialized adjacently tagged, e.g. `{"kind": "replace", "value": 2}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DiffNode {
    /// Assign the value wholesale.
    Replace(Value),
    /// Recurse into a nested mapping.
    Object(ObjectDelta),
    /// Positional transformation of a sequence.
    Array(ArrayDiff),
    /// The key no longer exists.
    Remove,
}

impl DiffNode {
    pub fn is_replace(&self) -> bool {
        matches!(self, DiffNode::Replace(_))
    }
}

/// Per-key deltas of a mapping, in key order of the trees they came from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectDelta {
    entries: IndexMap<String, DiffNode>,
}

impl ObjectDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Add a node for `key`, replacing any node already recorded for it.
    /// A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, node: DiffNode) {
        self.entries.insert(key.into(), node);
    }

    pub fn get(&self, key: &str) -> Option<&DiffNode> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DiffNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Positional delta between two sequences.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayDiff {
    pub removed: Vec<RemovedItem>,
    pub added: Vec<AddedItem>,
    pub changed: Vec<ChangedItem>,
}

impl ArrayDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemovedItem {
    pub index: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddedItem {
    pub index: usize,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangedItem {
    pub index: usize,
    pub value: DiffNode,
}

/// What a diff-mode subscriber receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delta {
    /// The change landed exactly on the subscribed path.
    Direct(DiffNode),
    /// The change landed below the subscribed path.
    Nested(NestedDelta),
}

/// A change below a subscribed ancestor, relative to that ancestor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "nested", rename_all = "camelCase")]
pub struct NestedDelta {
    pub relative_path: String,
    pub inner: DiffNode,
}
