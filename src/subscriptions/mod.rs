//! Path-scoped change subscriptions.
//!
//! Listeners register at a dot-separated path and hear about:
//! - changes at exactly that path
//! - changes anywhere below it (value listeners get the whole subtree,
//!   diff listeners get a nested delta)
//! - a wholesale replacement of an ancestor that altered their value
//!
//! The registry only works out *who* is told *what*; the store decides when
//! callbacks run. A panicking listener is logged and skipped.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = SubscriptionRegistry::new();
//! let id = registry.subscribe(
//!     &StatePath::parse("view.tools")?,
//!     Listener::value(|tools| println!("tools now {}", tools)),
//! );
//! registry.unsubscribe(id);
//! ```

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{
    DiffCallback, Delivery, Listener, ListenerMode, Payload, SubscriptionId, ValueCallback,
};
