//! In-place delta application.

use crate::diff::{ArrayDiff, DiffNode, ObjectDelta};
use crate::error::{Result, StoreError};
use crate::types::{StatePath, StateTree};
use serde_json::{Map, Value};

/// A change recorded while a delta is applied.
///
/// Notices are dispatched to subscribers only after the whole delta landed,
/// so listeners always observe a consistent tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    /// Where the change landed.
    pub path: StatePath,
    /// The value now stored at `path` (`Null` after a removal).
    pub value: Value,
    /// The delta node that produced the change.
    pub diff: DiffNode,
    /// The value displaced by a `Replace` or `Remove`, if there was one.
    pub previous: Option<Value>,
}

/// Apply `delta` to `target`, which lives at `prefix` in the full tree.
///
/// `Replace` assigns, `Remove` deletes, `Object` recurses (creating the
/// mapping when absent), and `Array` applies a positional diff. Every leaf
/// change and every touched array is recorded in `notices`.
pub fn apply_diff(
    delta: &ObjectDelta,
    target: &mut StateTree,
    prefix: &StatePath,
    notices: &mut Vec<Notice>,
) -> Result<()> {
    for (key, node) in delta.iter() {
        let path = prefix.child(key);
        match node {
            DiffNode::Replace(value) => {
                let previous = target.insert(key.to_string(), value.clone());
                notices.push(Notice {
                    path,
                    value: value.clone(),
                    diff: node.clone(),
                    previous,
                });
            }
            DiffNode::Remove => {
                let previous = target.shift_remove(key);
                notices.push(Notice {
                    path,
                    value: Value::Null,
                    diff: DiffNode::Remove,
                    previous,
                });
            }
            DiffNode::Object(_) | DiffNode::Array(_) => {
                let slot = target.entry(key).or_insert(Value::Null);
                apply_node(node, slot, &path, notices)?;
            }
        }
    }
    Ok(())
}

/// Apply a positional diff: removals (descending), insertions (ascending),
/// then per-element changes. One notice covers the whole array.
pub fn apply_array_diff(
    diff: &ArrayDiff,
    items: &mut Vec<Value>,
    path: &StatePath,
    notices: &mut Vec<Notice>,
) -> Result<()> {
    let mut removed: Vec<usize> = diff.removed.iter().map(|r| r.index).collect();
    removed.sort_unstable_by(|a, b| b.cmp(a));
    removed.dedup();
    for index in removed {
        if index >= items.len() {
            return Err(invalid(
                path,
                format!("remove index {} out of bounds (len {})", index, items.len()),
            ));
        }
        items.remove(index);
    }

    let mut added: Vec<_> = diff.added.iter().collect();
    added.sort_by_key(|item| item.index);
    for item in added {
        if item.index > items.len() {
            return Err(invalid(
                path,
                format!("insert index {} out of bounds (len {})", item.index, items.len()),
            ));
        }
        items.insert(item.index, item.value.clone());
    }

    for change in &diff.changed {
        let element_path = path.child(change.index.to_string());
        let len = items.len();
        let slot = items.get_mut(change.index).ok_or_else(|| {
            invalid(
                path,
                format!("change index {} out of bounds (len {})", change.index, len),
            )
        })?;
        apply_node(&change.value, slot, &element_path, notices)?;
    }

    notices.push(Notice {
        path: path.clone(),
        value: Value::Array(items.clone()),
        diff: DiffNode::Array(diff.clone()),
        previous: None,
    });
    Ok(())
}

fn apply_node(
    node: &DiffNode,
    slot: &mut Value,
    path: &StatePath,
    notices: &mut Vec<Notice>,
) -> Result<()> {
    match node {
        DiffNode::Replace(value) => {
            let previous = std::mem::replace(slot, value.clone());
            notices.push(Notice {
                path: path.clone(),
                value: value.clone(),
                diff: node.clone(),
                previous: Some(previous),
            });
            Ok(())
        }
        DiffNode::Object(nested) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(map) => apply_diff(nested, map, path, notices),
                _ => Ok(()),
            }
        }
        DiffNode::Array(array) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            match slot {
                Value::Array(items) => apply_array_diff(array, items, path, notices),
                _ => Ok(()),
            }
        }
        DiffNode::Remove => Err(invalid(
            path,
            "remove is only valid for mapping keys".to_string(),
        )),
    }
}

fn invalid(path: &StatePath, reason: String) -> StoreError {
    StoreError::InvalidDiff {
        path: path.to_string(),
        reason,
    }
}
