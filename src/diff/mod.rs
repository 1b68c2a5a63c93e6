//! Structural diffing of JSON state trees.
//!
//! The functions here are pure: they read two trees and describe how to turn
//! one into the other. Applying a delta is the store's job
//! (see [`crate::state::apply_diff`]).

mod compute;
mod types;

pub use compute::{
    compute_array_diff, compute_array_diff_with, compute_diff, compute_diff_with, ArrayDiffMode,
};
pub use types::{
    AddedItem, ArrayDiff, ChangedItem, Delta, DiffNode, NestedDelta, ObjectDelta, RemovedItem,
};
