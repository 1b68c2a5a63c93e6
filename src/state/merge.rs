//! Reconciling trees against the statically known default shape.

use crate::types::StateTree;
use serde_json::Value;

/// Deep-merge a loaded document over the defaults.
///
/// Keys only present in the defaults are kept. Where both sides hold a
/// mapping the merge recurses; otherwise the loaded value wins. This lets an
/// older persisted file load cleanly after new keys were added to the shape.
pub fn merge_with_defaults(defaults: &StateTree, loaded: StateTree) -> StateTree {
    let mut merged = defaults.clone();
    for (key, value) in loaded {
        let value = match (merged.get(&key), value) {
            (Some(Value::Object(base)), Value::Object(incoming)) => {
                Value::Object(merge_with_defaults(base, incoming))
            }
            (_, value) => value,
        };
        merged.insert(key, value);
    }
    merged
}

/// Re-insert any default key missing from `tree`, recursing into mappings.
///
/// Returns true when something was filled in.
pub fn fill_defaults(tree: &mut StateTree, defaults: &StateTree) -> bool {
    let mut filled = false;
    for (key, default) in defaults {
        match (tree.get_mut(key), default) {
            (None, _) => {
                tree.insert(key.clone(), default.clone());
                filled = true;
            }
            (Some(Value::Object(present)), Value::Object(nested)) => {
                filled |= fill_defaults(present, nested);
            }
            _ => {}
        }
    }
    filled
}
