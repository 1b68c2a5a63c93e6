//! In-memory persistence for tests and ephemeral hosts.

use super::PersistenceAdapter;
use crate::error::{Result, StoreError};
use crate::types::StateTree;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Keeps the last saved tree in memory. Failures can be injected.
#[derive(Default)]
pub struct MemoryAdapter {
    document: Mutex<Option<StateTree>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously "persisted" document.
    pub fn with_document(tree: StateTree) -> Self {
        Self {
            document: Mutex::new(Some(tree)),
            ..Default::default()
        }
    }

    /// The last successfully saved tree.
    pub fn saved(&self) -> Option<StateTree> {
        self.document.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn load(&self) -> Result<Option<StateTree>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence("injected load failure".into()));
        }
        Ok(self.document.lock().clone())
    }

    fn save(&self, tree: &StateTree) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence("injected save failure".into()));
        }
        *self.document.lock() = Some(tree.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
