//! # statetree
//!
//! A hierarchical JSON state tree kept in sync by diffs.
//!
//! ## Core Concepts
//!
//! - **State tree**: one canonical JSON document, addressed by dot paths
//! - **Diffs**: every mutation is reduced to a minimal delta and applied in place
//! - **Subscriptions**: listeners on a path hear about changes at, below, or
//!   (on wholesale replacement) above it
//! - **History**: bounded undo/redo of whole-tree snapshots
//! - **Persistence**: serialized, crash-safe saves behind an adapter trait
//!
//! ## Example
//!
//! ```ignore
//! use statetree::{JsonFileAdapter, StateStore, StoreConfig};
//!
//! let adapter = Arc::new(JsonFileAdapter::open("./state.json")?);
//! let store = StateStore::open(defaults, StoreConfig::default(), adapter)?;
//!
//! store.subscribe_value("view.tools", |tools| println!("tools: {}", tools))?;
//! store.set_path("view.tools", json!(["pen", "eraser"]))?;
//!
//! store.undo()?;
//! store.flush()?;
//! ```

pub mod bridge;
pub mod diff;
pub mod error;
pub mod persistence;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod wal;

// Re-exports
pub use bridge::{ClientHandle, ClientId, Message, MessageBridge, DEFAULT_CLIENT_BUFFER};
pub use diff::{
    compute_array_diff, compute_diff, compute_diff_with, ArrayDiff, ArrayDiffMode, Delta,
    DiffNode, NestedDelta, ObjectDelta,
};
pub use error::{Result, StoreError};
pub use persistence::{
    JsonFileAdapter, LoadOrigin, MemoryAdapter, PersistTicket, PersistenceAdapter,
    PersistenceQueue,
};
pub use state::{apply_diff, merge_with_defaults, HistoryManager, Notice};
pub use store::{Commit, StateStore, StoreConfig, DEFAULT_VERSION_KEY, MAX_NESTED_COMMITS};
pub use subscriptions::{Listener, SubscriptionId, SubscriptionRegistry};
pub use types::*;
pub use wal::{WalEntry, WalEntryStatus, WalOperation, WriteAheadLog};
