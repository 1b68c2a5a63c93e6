//! State tree mechanics: delta application, default reconciliation, and
//! undo/redo history.
//!
//! These pieces are independent of locking and persistence; the
//! [`StateStore`](crate::StateStore) composes them into the commit pipeline.

mod apply;
mod history;
mod merge;

pub use apply::{apply_array_diff, apply_diff, Notice};
pub use history::{HistoryManager, DEFAULT_HISTORY_CAPACITY};
pub use merge::{fill_defaults, merge_with_defaults};
