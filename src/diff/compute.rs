//! Structural diffing of state trees.

use super::types::{AddedItem, ArrayDiff, ChangedItem, DiffNode, ObjectDelta, RemovedItem};
use crate::types::StateTree;
use serde_json::Value;

/// How sequence-valued keys are diffed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArrayDiffMode {
    /// Any changed array is replaced wholesale.
    #[default]
    Replace,
    /// Changed arrays produce a positional [`ArrayDiff`].
    Positional,
}

/// Compute the delta turning `old` into `new`, replacing changed arrays.
pub fn compute_diff(old: &StateTree, new: &StateTree) -> ObjectDelta {
    compute_diff_with(old, new, ArrayDiffMode::Replace)
}

/// Compute the delta turning `old` into `new`.
///
/// Unchanged keys are skipped. Keys missing from `new` become
/// [`DiffNode::Remove`]. Two mappings recurse and contribute nothing when
/// equal; arrays follow `mode`; everything else (nulls, type changes,
/// primitives) becomes [`DiffNode::Replace`].
pub fn compute_diff_with(old: &StateTree, new: &StateTree, mode: ArrayDiffMode) -> ObjectDelta {
    let mut delta = ObjectDelta::new();

    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) => {
                if let Some(node) = diff_values(old_value, new_value, mode) {
                    delta.insert(key.clone(), node);
                }
            }
            None => delta.insert(key.clone(), DiffNode::Remove),
        }
    }

    for (key, new_value) in new {
        if !old.contains_key(key) {
            delta.insert(key.clone(), DiffNode::Replace(new_value.clone()));
        }
    }

    delta
}

/// Positional diff of two sequences, replacing nested arrays.
pub fn compute_array_diff(old: &[Value], new: &[Value]) -> ArrayDiff {
    compute_array_diff_with(old, new, ArrayDiffMode::Replace)
}

/// Positional diff of two sequences.
///
/// Indices past the end of `old` are added, indices past the end of `new`
/// are removed, and indices present in both with unequal content are changed.
pub fn compute_array_diff_with(old: &[Value], new: &[Value], mode: ArrayDiffMode) -> ArrayDiff {
    let mut diff = ArrayDiff::default();

    for index in 0..old.len().max(new.len()) {
        match (old.get(index), new.get(index)) {
            (None, Some(value)) => diff.added.push(AddedItem {
                index,
                value: value.clone(),
            }),
            (Some(_), None) => diff.removed.push(RemovedItem { index }),
            (Some(before), Some(after)) => {
                if let Some(value) = diff_values(before, after, mode) {
                    diff.changed.push(ChangedItem { index, value });
                }
            }
            (None, None) => {}
        }
    }

    diff
}

fn diff_values(old: &Value, new: &Value, mode: ArrayDiffMode) -> Option<DiffNode> {
    if old == new {
        return None;
    }

    match (old, new) {
        (Value::Object(before), Value::Object(after)) => {
            let nested = compute_diff_with(before, after, mode);
            if nested.is_empty() {
                None
            } else {
                Some(DiffNode::Object(nested))
            }
        }
        (Value::Array(before), Value::Array(after)) if mode == ArrayDiffMode::Positional => {
            Some(DiffNode::Array(compute_array_diff_with(before, after, mode)))
        }
        _ => Some(DiffNode::Replace(new.clone())),
    }
}
