//! The state store tying diffing, subscriptions, history and persistence
//! together.

use crate::diff::{compute_diff_with, ArrayDiffMode, Delta, DiffNode, ObjectDelta};
use crate::error::{Result, StoreError};
use crate::persistence::{
    load_or_defaults, LoadOrigin, PersistTicket, PersistenceAdapter, PersistenceQueue,
};
use crate::state::{apply_diff, fill_defaults, HistoryManager, DEFAULT_HISTORY_CAPACITY};
use crate::subscriptions::{Delivery, Listener, SubscriptionId, SubscriptionRegistry};
use crate::types::{StatePath, StateTree, StateVersion};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Root key holding the version token unless configured otherwise.
pub const DEFAULT_VERSION_KEY: &str = "stateVersion";

/// How deep listeners may nest mutations inside other commits.
pub const MAX_NESTED_COMMITS: usize = 32;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Snapshots kept on each of the undo and redo stacks.
    pub history_capacity: usize,

    /// How arrays are diffed.
    pub array_diff: ArrayDiffMode,

    /// Root key holding the version token.
    pub version_key: String,

    /// Notify subscribers below a subtree that was replaced wholesale.
    pub notify_descendants: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            array_diff: ArrayDiffMode::Replace,
            version_key: DEFAULT_VERSION_KEY.to_string(),
            notify_descendants: true,
        }
    }
}

/// Outcome of a mutation.
pub enum Commit {
    /// The update produced no change; nothing was notified, recorded or saved.
    Unchanged,
    /// The update was applied.
    Applied {
        /// New version token.
        version: StateVersion,
        /// The delta that was applied, including the version bump.
        diff: ObjectDelta,
        /// Number of subscriber callbacks that ran.
        notified: usize,
        /// Completion of the queued write, when the store persists.
        persistence: Option<PersistTicket>,
    },
}

impl Commit {
    pub fn is_applied(&self) -> bool {
        matches!(self, Commit::Applied { .. })
    }

    pub fn diff(&self) -> Option<&ObjectDelta> {
        match self {
            Commit::Applied { diff, .. } => Some(diff),
            Commit::Unchanged => None,
        }
    }

    pub fn version(&self) -> Option<&StateVersion> {
        match self {
            Commit::Applied { version, .. } => Some(version),
            Commit::Unchanged => None,
        }
    }

    /// Block until the commit is durable. Immediate when nothing was queued.
    pub fn wait_persisted(self) -> Result<()> {
        match self {
            Commit::Applied {
                persistence: Some(ticket),
                ..
            } => ticket.wait(),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commit::Unchanged => f.write_str("Unchanged"),
            Commit::Applied {
                version,
                diff,
                notified,
                persistence,
            } => f
                .debug_struct("Applied")
                .field("version", version)
                .field("diff", diff)
                .field("notified", notified)
                .field("persisting", &persistence.is_some())
                .finish(),
        }
    }
}

/// The canonical state tree and everything that watches it.
///
/// All mutations go through [`set_state`](Self::set_state) and are committed
/// one at a time: apply, record history, queue persistence, notify.
/// Subscriber callbacks run after the tree lock is released. They may read
/// the store and may also mutate it: a nested mutation commits immediately on
/// the same thread, and its listeners run before the remaining listeners of
/// the outer commit. Nesting deeper than [`MAX_NESTED_COMMITS`] fails with
/// [`StoreError::NestingLimit`].
pub struct StateStore {
    config: StoreConfig,

    /// The shape every committed tree is a superset of.
    defaults: StateTree,

    tree: RwLock<StateTree>,

    registry: RwLock<SubscriptionRegistry>,

    history: Mutex<HistoryManager<StateTree>>,

    persistence: Option<PersistenceQueue>,

    /// Serializes commits, including their notification fan-out. Reentrant
    /// so listeners can commit; holds the current nesting depth.
    commit_lock: ReentrantMutex<Cell<usize>>,

    /// Commits so far, folded into version tokens.
    commits: AtomicU64,
}

impl StateStore {
    /// An in-memory store with default configuration.
    pub fn new(defaults: StateTree) -> Self {
        Self::with_config(defaults, StoreConfig::default())
    }

    /// An in-memory store.
    pub fn with_config(defaults: StateTree, config: StoreConfig) -> Self {
        let initial = defaults.clone();
        Self::build(defaults, config, initial, None)
    }

    /// A store that loads from and saves through `adapter`.
    ///
    /// A persisted document is deep-merged over `defaults`; if it cannot be
    /// read the store starts from the defaults. When nothing was saved yet
    /// the initial tree is written right away.
    pub fn open(
        defaults: StateTree,
        config: StoreConfig,
        adapter: Arc<dyn PersistenceAdapter>,
    ) -> Result<Self> {
        adapter.set_version_key(&config.version_key);
        let (initial, origin) = load_or_defaults(adapter.as_ref(), &defaults);
        let queue = PersistenceQueue::start(adapter)?;
        let store = Self::build(defaults, config, initial, Some(queue));

        if origin == LoadOrigin::Missing {
            if let Some(queue) = &store.persistence {
                let _ = queue.submit(store.get_state());
            }
        }
        Ok(store)
    }

    fn build(
        defaults: StateTree,
        config: StoreConfig,
        mut initial: StateTree,
        persistence: Option<PersistenceQueue>,
    ) -> Self {
        fill_defaults(&mut initial, &defaults);
        if !initial.contains_key(&config.version_key) {
            initial.insert(
                config.version_key.clone(),
                Value::String(StateVersion::generate(0).0),
            );
        }

        Self {
            registry: RwLock::new(SubscriptionRegistry::with_descendant_notification(
                config.notify_descendants,
            )),
            history: Mutex::new(HistoryManager::new(config.history_capacity)),
            tree: RwLock::new(initial),
            defaults,
            config,
            persistence,
            commit_lock: ReentrantMutex::new(Cell::new(0)),
            commits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Reads ---

    /// Deep copy of the whole tree.
    pub fn get_state(&self) -> StateTree {
        self.tree.read().clone()
    }

    /// Deep copy of the value at a dot-separated `path`.
    ///
    /// `None` means "not initialized yet", not failure; a diagnostic is
    /// logged so the missing key can be added to the default shape.
    pub fn get(&self, path: &str) -> Option<Value> {
        match StatePath::parse(path) {
            Ok(parsed) => self.get_path(&parsed),
            Err(e) => {
                tracing::warn!(path, error = %e, "invalid state path");
                None
            }
        }
    }

    /// Deep copy of the value at `path`.
    pub fn get_path(&self, path: &StatePath) -> Option<Value> {
        let value = path.resolve(&self.tree.read()).cloned();
        if value.is_none() {
            tracing::warn!(path = %path, "property is not present in the state tree; consider adding it to the defaults");
        }
        value
    }

    /// Typed read of the value at `path`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(format!("{}: {}", path, e))),
            None => Ok(None),
        }
    }

    /// The current version token.
    pub fn version(&self) -> Option<StateVersion> {
        StateVersion::read(&self.tree.read(), &self.config.version_key)
    }

    // --- Subscriptions ---

    /// Register `listener` at `path`.
    pub fn subscribe(&self, path: &str, listener: Listener) -> Result<SubscriptionId> {
        let path = StatePath::parse(path)?;
        Ok(self.registry.write().subscribe(&path, listener))
    }

    /// Receive the value at `path` whenever it or anything below it changes.
    pub fn subscribe_value<F>(&self, path: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(path, Listener::value(callback))
    }

    /// Receive the delta reaching `path` whenever it or anything below it
    /// changes.
    pub fn subscribe_diff<F>(&self, path: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        self.subscribe(path, Listener::diff(callback))
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.write().unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.read().subscription_count()
    }

    // --- Mutations ---

    /// Commit the tree returned by `updater`.
    ///
    /// If the update changes nothing but the version token the call is a
    /// no-op. An `Err` or panic from `updater` abandons the mutation and
    /// leaves the tree untouched.
    pub fn set_state<F>(&self, updater: F, record_history: bool) -> Result<Commit>
    where
        F: FnOnce(&StateTree) -> Result<StateTree>,
    {
        self.serialized(|| self.commit_locked(updater, record_history))
    }

    /// Commit `tree` wholesale, recording history.
    pub fn replace_state(&self, tree: StateTree) -> Result<Commit> {
        self.set_state(move |_| Ok(tree), true)
    }

    /// Commit `value` at `path`, creating intermediate mappings as needed.
    pub fn set_path(&self, path: &str, value: Value) -> Result<Commit> {
        let path = StatePath::parse(path)?;
        self.set_state(
            move |current| {
                let mut next = current.clone();
                path.assign(&mut next, value)?;
                Ok(next)
            },
            true,
        )
    }

    /// Commit an externally computed delta.
    pub fn apply_delta(&self, delta: &ObjectDelta, record_history: bool) -> Result<Commit> {
        self.set_state(
            |current| {
                let mut next = current.clone();
                apply_diff(delta, &mut next, &StatePath::root(), &mut Vec::new())?;
                Ok(next)
            },
            record_history,
        )
    }

    /// Restore the snapshot before the last recorded mutation.
    pub fn undo(&self) -> Result<Commit> {
        self.serialized(|| {
            let current = self.tree.read().clone();
            let previous = self.history.lock().undo(current);
            match previous {
                Some(snapshot) => self.commit_locked(move |_| Ok(snapshot), false),
                None => Ok(Commit::Unchanged),
            }
        })
    }

    /// Re-apply the snapshot most recently undone.
    pub fn redo(&self) -> Result<Commit> {
        self.serialized(|| {
            let current = self.tree.read().clone();
            let next = self.history.lock().redo(current);
            match next {
                Some(snapshot) => self.commit_locked(move |_| Ok(snapshot), false),
                None => Ok(Commit::Unchanged),
            }
        })
    }

    pub fn can_undo(&self) -> bool {
        self.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.lock().can_redo()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Block until every queued write has reached storage.
    pub fn flush(&self) -> Result<()> {
        match &self.persistence {
            Some(queue) => queue.flush(),
            None => Ok(()),
        }
    }

    /// Run `commit` under the commit lock, tracking how deeply commits nest.
    fn serialized<T>(&self, commit: impl FnOnce() -> Result<T>) -> Result<T> {
        let depth = self.commit_lock.lock();
        if depth.get() >= MAX_NESTED_COMMITS {
            tracing::error!(
                limit = MAX_NESTED_COMMITS,
                "nested commit limit reached, mutation abandoned"
            );
            return Err(StoreError::NestingLimit(MAX_NESTED_COMMITS));
        }
        let _nested = Nested::enter(&depth);
        commit()
    }

    /// The commit pipeline. Callers hold `commit_lock`.
    fn commit_locked<F>(&self, updater: F, record_history: bool) -> Result<Commit>
    where
        F: FnOnce(&StateTree) -> Result<StateTree>,
    {
        let current = self.tree.read().clone();

        let mut next = match catch_unwind(AssertUnwindSafe(|| updater(&current))) {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "state update failed, mutation abandoned");
                return Err(e);
            }
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(message = %message, "state updater panicked, mutation abandoned");
                return Err(StoreError::Mutation(message));
            }
        };

        fill_defaults(&mut next, &self.defaults);

        // Diff against the current version so a version-only change is empty.
        let version_key = &self.config.version_key;
        match current.get(version_key) {
            Some(version) => {
                next.insert(version_key.clone(), version.clone());
            }
            None => {
                next.shift_remove(version_key);
            }
        }

        let mut diff = compute_diff_with(&current, &next, self.config.array_diff);
        if diff.is_empty() {
            tracing::trace!("update produced no changes");
            return Ok(Commit::Unchanged);
        }

        let version = StateVersion::generate(self.commits.fetch_add(1, Ordering::SeqCst) + 1);
        diff.insert(
            version_key.clone(),
            DiffNode::Replace(Value::String(version.0.clone())),
        );

        let mut notices = Vec::new();
        let (deliveries, persisted_tree) = {
            let mut tree = self.tree.write();
            if let Err(e) = apply_diff(&diff, &mut tree, &StatePath::root(), &mut notices) {
                *tree = current;
                tracing::warn!(error = %e, "failed to apply diff, mutation rolled back");
                return Err(e);
            }

            let registry = self.registry.read();
            let deliveries: Vec<Delivery> = notices
                .iter()
                .flat_map(|notice| registry.collect(notice, &tree))
                .collect();
            let persisted_tree = self.persistence.as_ref().map(|_| tree.clone());
            (deliveries, persisted_tree)
        };

        if record_history {
            self.history.lock().push(current);
        }

        tracing::debug!(
            version = %version,
            changes = notices.len(),
            subscribers = deliveries.len(),
            record_history,
            "state committed"
        );

        // Queued before dispatch so writes from nested commits land later.
        let persistence = match (&self.persistence, persisted_tree) {
            (Some(queue), Some(tree)) => Some(queue.submit(tree)),
            _ => None,
        };

        let notified = deliveries.len();
        for delivery in deliveries {
            delivery.dispatch();
        }

        Ok(Commit::Applied {
            version,
            diff,
            notified,
            persistence,
        })
    }
}

/// Depth counter held for the duration of one commit.
struct Nested<'a>(&'a Cell<usize>);

impl<'a> Nested<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Nested(depth)
    }
}

impl Drop for Nested<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "state updater panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::NestedDelta;
    use crate::persistence::MemoryAdapter;
    use serde_json::json;

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn without_version(mut t: StateTree) -> StateTree {
        t.shift_remove(DEFAULT_VERSION_KEY);
        t
    }

    #[test]
    fn test_nested_update_diff_and_read() {
        let store = StateStore::new(tree(json!({"a": {"b": 1}})));

        let commit = store
            .set_state(|_| Ok(tree(json!({"a": {"b": 2}}))), true)
            .unwrap();

        let diff = commit.diff().unwrap();
        assert_eq!(
            serde_json::to_value(diff.get("a").unwrap()).unwrap(),
            json!({"kind": "object", "value": {"b": {"kind": "replace", "value": 2}}})
        );
        assert!(diff.contains_key(DEFAULT_VERSION_KEY));
        assert_eq!(diff.len(), 2);
        assert_eq!(store.get("a.b"), Some(json!(2)));
    }

    #[test]
    fn test_undo_restores_previous_value() {
        let store = StateStore::new(tree(json!({"a": {"b": 1}})));
        store
            .set_state(|_| Ok(tree(json!({"a": {"b": 2}}))), true)
            .unwrap();

        assert!(store.undo().unwrap().is_applied());
        assert_eq!(store.get("a.b"), Some(json!(1)));
        assert!(store.can_redo());

        store.redo().unwrap();
        assert_eq!(store.get("a.b"), Some(json!(2)));
    }

    #[test]
    fn test_identity_update_is_noop() {
        let adapter = Arc::new(MemoryAdapter::with_document(tree(json!({"a": {"b": 1}}))));
        let store = StateStore::open(
            tree(json!({"a": {"b": 1}})),
            StoreConfig::default(),
            adapter.clone(),
        )
        .unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        store
            .subscribe_value("a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let before = store.version();
        let commit = store.set_state(|t| Ok(t.clone()), true).unwrap();
        assert!(!commit.is_applied());
        store.flush().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.save_count(), 0);
        assert!(!store.can_undo());
        assert_eq!(store.version(), before);
    }

    #[test]
    fn test_every_commit_bumps_version() {
        let store = StateStore::new(tree(json!({"n": 0})));
        let mut seen = vec![store.version().unwrap()];
        for n in 1..5 {
            store.set_path("n", json!(n)).unwrap();
            let version = store.version().unwrap();
            assert!(!seen.contains(&version));
            seen.push(version);
        }
    }

    #[test]
    fn test_failed_updater_leaves_tree_untouched() {
        let store = StateStore::new(tree(json!({"a": 1})));
        let before = store.get_state();

        let result = store.set_state(|_| Err(StoreError::mutation("rejected")), true);
        assert!(matches!(result, Err(StoreError::Mutation(_))));
        assert_eq!(store.get_state(), before);
        assert!(!store.can_undo());
    }

    #[test]
    fn test_panicking_updater_is_contained() {
        let store = StateStore::new(tree(json!({"a": 1})));
        let before = store.get_state();

        let result = store.set_state(|_| panic!("updater blew up"), true);
        match result {
            Err(StoreError::Mutation(message)) => assert!(message.contains("blew up")),
            other => panic!("expected mutation error, got {:?}", other),
        }
        assert_eq!(store.get_state(), before);

        // The store keeps working afterwards.
        store.set_path("a", json!(2)).unwrap();
        assert_eq!(store.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_returned_state_is_a_copy() {
        let store = StateStore::new(tree(json!({"a": {"b": 1}})));
        let mut copy = store.get_state();
        copy.insert("a".into(), json!("clobbered"));
        let mut sub = store.get("a").unwrap();
        sub["b"] = json!(99);

        assert_eq!(store.get("a.b"), Some(json!(1)));
    }

    #[test]
    fn test_missing_path_reads_none() {
        let store = StateStore::new(tree(json!({"a": {"b": 1}})));
        assert_eq!(store.get("a.c"), None);
        assert_eq!(store.get("x.y.z"), None);
        assert_eq!(store.get("bad..path"), None);
    }

    #[test]
    fn test_defaults_are_backfilled() {
        let store = StateStore::new(tree(json!({"view": {"name": "", "tools": []}, "other": 1})));
        store
            .set_state(|_| Ok(tree(json!({"view": {"name": "x"}}))), true)
            .unwrap();

        assert_eq!(store.get("view.tools"), Some(json!([])));
        assert_eq!(store.get("other"), Some(json!(1)));
        assert_eq!(store.get("view.name"), Some(json!("x")));
    }

    #[test]
    fn test_replays_do_not_record_history() {
        let store = StateStore::new(tree(json!({"n": 0})));
        store.set_path("n", json!(1)).unwrap();
        store.set_path("n", json!(2)).unwrap();

        store.undo().unwrap();
        store.undo().unwrap();
        assert!(!store.can_undo());
        assert_eq!(store.get("n"), Some(json!(0)));

        store.redo().unwrap();
        store.redo().unwrap();
        assert!(!store.can_redo());
        assert_eq!(store.get("n"), Some(json!(2)));
    }

    #[test]
    fn test_new_mutation_discards_redo() {
        let store = StateStore::new(tree(json!({"n": 0})));
        store.set_path("n", json!(1)).unwrap();
        store.undo().unwrap();
        assert!(store.can_redo());

        store.set_path("n", json!(5)).unwrap();
        assert!(!store.can_redo());
        assert!(!store.redo().unwrap().is_applied());
    }

    #[test]
    fn test_undo_round_trip_restores_tree() {
        let store = StateStore::new(tree(json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"})));
        let before = without_version(store.get_state());

        store
            .set_state(|_| Ok(tree(json!({"a": {"b": 3, "c": [2]}, "d": null, "e": 1}))), true)
            .unwrap();
        let after = without_version(store.get_state());

        store.undo().unwrap();
        assert_eq!(without_version(store.get_state()), before);
        store.redo().unwrap();
        assert_eq!(without_version(store.get_state()), after);
    }

    #[test]
    fn test_history_capacity_is_bounded() {
        let config = StoreConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let store = StateStore::with_config(tree(json!({"n": 0})), config);
        for n in 1..=5 {
            store.set_path("n", json!(n)).unwrap();
        }

        store.undo().unwrap();
        store.undo().unwrap();
        assert!(!store.can_undo());
        assert_eq!(store.get("n"), Some(json!(3)));
    }

    #[test]
    fn test_diff_subscriber_sees_nested_change() {
        let store = StateStore::new(tree(json!({"a": {"b": {"c": 0}}})));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .subscribe_diff("a", move |delta| sink.lock().push(delta.clone()))
            .unwrap();

        store.set_path("a.b.c", json!(1)).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Delta::Nested(NestedDelta {
                relative_path: "b.c".to_string(),
                inner: DiffNode::Replace(json!(1)),
            })]
        );
    }

    #[test]
    fn test_subscriber_may_read_store() {
        let store = Arc::new(StateStore::new(tree(json!({"a": 0, "b": 0}))));
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let reader = Arc::clone(&store);
        store
            .subscribe_value("a", move |_| *sink.lock() = reader.get("a"))
            .unwrap();

        store.set_path("a", json!(7)).unwrap();
        assert_eq!(*seen.lock(), Some(json!(7)));
    }

    #[test]
    fn test_apply_delta_commits_external_diff() {
        let store = StateStore::new(tree(json!({"a": {"b": 1}})));
        let mut inner = ObjectDelta::new();
        inner.insert("b", DiffNode::Replace(json!(10)));
        let mut delta = ObjectDelta::new();
        delta.insert("a", DiffNode::Object(inner));

        assert!(store.apply_delta(&delta, true).unwrap().is_applied());
        assert_eq!(store.get("a.b"), Some(json!(10)));
        assert!(store.can_undo());
    }

    #[test]
    fn test_typed_read() {
        let store = StateStore::new(tree(json!({"view": {"tools": ["a", "b"]}})));
        let tools: Option<Vec<String>> = store.get_as("view.tools").unwrap();
        assert_eq!(tools, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(store.get_as::<u32>("view.tools").is_err());
    }

    #[test]
    fn test_listener_may_commit_derived_state() {
        let store = Arc::new(StateStore::new(tree(json!({"a": 0, "derived": 0}))));
        let inner = Arc::downgrade(&store);
        store
            .subscribe_value("a", move |value| {
                if let Some(store) = inner.upgrade() {
                    let doubled = json!(value.as_i64().unwrap_or(0) * 2);
                    store.set_path("derived", doubled).unwrap();
                }
            })
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .subscribe_value("derived", move |value| sink.lock().push(value.clone()))
            .unwrap();

        assert!(store.set_path("a", json!(21)).unwrap().is_applied());
        assert_eq!(store.get("derived"), Some(json!(42)));
        assert_eq!(*seen.lock(), vec![json!(42)]);

        // Both commits are undoable, newest first.
        store.undo().unwrap();
        assert_eq!(store.get("a"), Some(json!(21)));
        assert_eq!(store.get("derived"), Some(json!(0)));
    }

    #[test]
    fn test_runaway_nested_commits_are_cut_off() {
        let store = Arc::new(StateStore::new(tree(json!({"n": 0}))));
        let inner = Arc::downgrade(&store);
        let failures = Arc::new(AtomicU64::new(0));
        let failed = Arc::clone(&failures);
        store
            .subscribe_value("n", move |value| {
                if let Some(store) = inner.upgrade() {
                    let next = json!(value.as_i64().unwrap_or(0) + 1);
                    if let Err(StoreError::NestingLimit(_)) = store.set_path("n", next) {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .unwrap();

        store.set_path("n", json!(1)).unwrap();
        assert_eq!(store.get("n"), Some(json!(MAX_NESTED_COMMITS)));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // The store stays usable from the outside.
        store.set_path("n", json!(-1)).unwrap();
    }

    #[test]
    fn test_nested_commit_is_persisted_last() {
        let adapter = Arc::new(MemoryAdapter::with_document(tree(json!({"a": 0, "b": 0}))));
        let store = Arc::new(
            StateStore::open(
                tree(json!({"a": 0, "b": 0})),
                StoreConfig::default(),
                adapter.clone(),
            )
            .unwrap(),
        );
        let inner = Arc::downgrade(&store);
        store
            .subscribe_value("a", move |value| {
                if let Some(store) = inner.upgrade() {
                    store.set_path("b", value.clone()).unwrap();
                }
            })
            .unwrap();

        store.set_path("a", json!(5)).unwrap();
        store.flush().unwrap();

        let saved = adapter.saved().unwrap();
        assert_eq!(saved["a"], json!(5));
        assert_eq!(saved["b"], json!(5));
    }

    #[test]
    fn test_missing_document_is_written_on_open() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = StateStore::open(
            tree(json!({"a": {"b": 1}})),
            StoreConfig::default(),
            adapter.clone(),
        )
        .unwrap();
        store.flush().unwrap();

        let saved = adapter.saved().unwrap();
        assert_eq!(saved["a"], json!({"b": 1}));
        assert_eq!(saved.get(DEFAULT_VERSION_KEY), store.get_state().get(DEFAULT_VERSION_KEY));
        assert_eq!(adapter.save_count(), 1);
    }

    #[test]
    fn test_stored_document_is_not_rewritten_on_open() {
        let adapter = Arc::new(MemoryAdapter::with_document(tree(json!({"a": 2}))));
        let store =
            StateStore::open(tree(json!({"a": 1})), StoreConfig::default(), adapter.clone())
                .unwrap();
        store.flush().unwrap();
        assert_eq!(adapter.save_count(), 0);
    }
}
