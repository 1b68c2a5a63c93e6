//! Durable storage of the state tree.
//!
//! The store talks to storage only through [`PersistenceAdapter`]. Writes are
//! funnelled through a [`PersistenceQueue`] so they run serially off the
//! caller's thread; each submit hands back a [`PersistTicket`] the caller may
//! wait on or ignore.

mod file;
mod memory;
mod queue;

pub use file::JsonFileAdapter;
pub use memory::MemoryAdapter;
pub use queue::{PersistTicket, PersistenceQueue};

use crate::error::Result;
use crate::state::merge_with_defaults;
use crate::types::StateTree;

/// Storage boundary for the canonical tree.
pub trait PersistenceAdapter: Send + Sync {
    /// Load the persisted document. `Ok(None)` means nothing was saved yet.
    fn load(&self) -> Result<Option<StateTree>>;

    /// Durably replace the persisted document with `tree`.
    fn save(&self, tree: &StateTree) -> Result<()>;

    /// The root key under which the store keeps its version token. Called
    /// once when a store is opened over this adapter.
    fn set_version_key(&self, _key: &str) {}
}

/// Where the initial tree came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOrigin {
    /// A persisted document merged over the defaults.
    Stored,
    /// Nothing was saved yet.
    Missing,
    /// The persisted document could not be read.
    Failed,
}

/// Load through `adapter` and merge over `defaults`.
///
/// Read failures are logged and fall back to the defaults.
pub fn load_or_defaults(
    adapter: &dyn PersistenceAdapter,
    defaults: &StateTree,
) -> (StateTree, LoadOrigin) {
    match adapter.load() {
        Ok(Some(document)) => (merge_with_defaults(defaults, document), LoadOrigin::Stored),
        Ok(None) => {
            tracing::debug!("no persisted state, starting from defaults");
            (defaults.clone(), LoadOrigin::Missing)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load persisted state, starting from defaults");
            (defaults.clone(), LoadOrigin::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_load_merges_over_defaults() {
        let adapter = MemoryAdapter::with_document(tree(json!({"a": {"b": 5}})));
        let defaults = tree(json!({"a": {"b": 0}, "c": {"d": []}}));
        let (loaded, origin) = load_or_defaults(&adapter, &defaults);
        assert_eq!(origin, LoadOrigin::Stored);
        assert_eq!(Value::Object(loaded), json!({"a": {"b": 5}, "c": {"d": []}}));
    }

    #[test]
    fn test_load_failure_falls_back_to_defaults() {
        let adapter = MemoryAdapter::new();
        adapter.set_fail_loads(true);
        let defaults = tree(json!({"a": 1}));
        assert_eq!(
            load_or_defaults(&adapter, &defaults),
            (defaults.clone(), LoadOrigin::Failed)
        );
    }

    #[test]
    fn test_nothing_saved_is_missing() {
        let adapter = MemoryAdapter::new();
        let defaults = tree(json!({"a": 1}));
        assert_eq!(
            load_or_defaults(&adapter, &defaults),
            (defaults.clone(), LoadOrigin::Missing)
        );
    }
}
