//! Subscription types for path-scoped change notification.

use crate::diff::Delta;
use crate::types::StatePath;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Unique identifier for a subscription. Passing it to `unsubscribe`
/// removes exactly that callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback receiving the new value at the subscribed path.
pub type ValueCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback receiving the delta that reached the subscribed path.
pub type DiffCallback = Arc<dyn Fn(&Delta) + Send + Sync>;

/// Which payload a listener wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerMode {
    Value,
    Diff,
}

/// A registered callback.
#[derive(Clone)]
pub enum Listener {
    Value(ValueCallback),
    Diff(DiffCallback),
}

impl Listener {
    pub fn value<F>(callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Listener::Value(Arc::new(callback))
    }

    pub fn diff<F>(callback: F) -> Self
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        Listener::Diff(Arc::new(callback))
    }

    pub fn mode(&self) -> ListenerMode {
        match self {
            Listener::Value(_) => ListenerMode::Value,
            Listener::Diff(_) => ListenerMode::Diff,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener::{:?}", self.mode())
    }
}

/// What a delivery hands to its callback.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Value(Value),
    Delta(Delta),
}

/// A callback paired with its payload, ready to run.
///
/// Deliveries are collected while the store holds its locks and dispatched
/// after they are released, so callbacks may read the store.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    /// The subscribed path (not necessarily where the change landed).
    pub path: StatePath,
    pub payload: Payload,
    listener: Listener,
}

impl Delivery {
    pub(crate) fn new(
        subscription: SubscriptionId,
        path: StatePath,
        listener: Listener,
        payload: Payload,
    ) -> Self {
        Self {
            subscription,
            path,
            payload,
            listener,
        }
    }

    /// Run the callback. A panicking callback is logged and swallowed so the
    /// remaining deliveries still run.
    pub fn dispatch(self) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| match (&self.listener, &self.payload) {
            (Listener::Value(callback), Payload::Value(value)) => callback(value),
            (Listener::Diff(callback), Payload::Delta(delta)) => callback(delta),
            _ => {}
        }));

        if outcome.is_err() {
            tracing::error!(
                subscription = self.subscription.0,
                path = %self.path,
                "subscriber panicked during notification"
            );
            return false;
        }
        true
    }
}
