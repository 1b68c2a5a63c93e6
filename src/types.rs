//! Core types for the state store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// The canonical state tree: an ordered mapping of keys to JSON values.
pub type StateTree = Map<String, Value>;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Opaque token stored at the tree root and bumped on every commit.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(pub String);

impl StateVersion {
    /// Build a fresh token from the clock and a per-store commit counter.
    ///
    /// The counter keeps tokens distinct when two commits land in the same
    /// millisecond.
    pub fn generate(counter: u64) -> Self {
        let millis = Timestamp::now().as_millis().max(0) as u64;
        StateVersion(format!("{}-{}", base36(millis), base36(counter)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the token stored under `key`, if it is a string.
    pub fn read(tree: &StateTree, key: &str) -> Option<Self> {
        tree.get(key)
            .and_then(Value::as_str)
            .map(|s| StateVersion(s.to_string()))
    }
}

impl fmt::Debug for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateVersion({})", self.0)
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// A dot-separated location inside the state tree.
///
/// The empty path addresses the root and is only produced internally; parsing
/// a user-supplied string always yields at least one non-empty segment.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct StatePath(Vec<String>);

impl StatePath {
    /// Parse a dot-separated path such as `"settings.theme.mode"`.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(StatePath(segments))
    }

    /// The root path (no segments).
    pub fn root() -> Self {
        StatePath(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a path from already-validated segments.
    pub fn from_segments(segments: &[String]) -> Self {
        StatePath(segments.to_vec())
    }

    /// Concatenate `other` below this path.
    pub fn join(&self, other: &StatePath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        StatePath(segments)
    }

    /// Extend the path by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        StatePath(segments)
    }

    /// Segment-wise prefix test; `a.b` starts with `a` but `ab` does not.
    pub fn starts_with(&self, prefix: &StatePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The remainder of this path below `prefix`.
    pub fn strip_prefix(&self, prefix: &StatePath) -> Option<StatePath> {
        if self.starts_with(prefix) {
            Some(StatePath(self.0[prefix.0.len()..].to_vec()))
        } else {
            None
        }
    }

    /// Borrow the value at this path under `tree`.
    pub fn resolve<'a>(&self, tree: &'a StateTree) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        resolve_segments(tree.get(first)?, rest)
    }

    /// Borrow the value at this path under an arbitrary JSON value.
    pub fn resolve_value<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        resolve_segments(value, &self.0)
    }

    /// Write `value` at this path, creating missing intermediate maps.
    ///
    /// Array segments must address an existing index, or one past the end for
    /// the final segment. Descending through a primitive is an error.
    pub fn assign(&self, tree: &mut StateTree, value: Value) -> Result<()> {
        let (last, parents) = self
            .0
            .split_last()
            .ok_or_else(|| StoreError::InvalidPath(String::new()))?;

        let Some((first, middle)) = parents.split_first() else {
            tree.insert(last.clone(), value);
            return Ok(());
        };

        let mut cursor = tree
            .entry(first.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in middle {
            cursor = self.descend_mut(cursor, segment)?;
        }

        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        match cursor {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index = self.parse_index(last)?;
                if index < items.len() {
                    items[index] = value;
                    Ok(())
                } else if index == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(StoreError::InvalidPath(self.to_string()))
                }
            }
            _ => Err(StoreError::InvalidPath(self.to_string())),
        }
    }

    fn descend_mut<'a>(&self, cursor: &'a mut Value, segment: &str) -> Result<&'a mut Value> {
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        match cursor {
            Value::Object(map) => Ok(map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()))),
            Value::Array(items) => {
                let index = self.parse_index(segment)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| StoreError::InvalidPath(self.to_string()))
            }
            _ => Err(StoreError::InvalidPath(self.to_string())),
        }
    }

    fn parse_index(&self, segment: &str) -> Result<usize> {
        segment
            .parse::<usize>()
            .map_err(|_| StoreError::InvalidPath(self.to_string()))
    }
}

fn resolve_segments<'a>(mut value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl fmt::Debug for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatePath({})", self)
    }
}

impl FromStr for StatePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        StatePath::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(StatePath::parse("").is_err());
        assert!(StatePath::parse("a..b").is_err());
        assert!(StatePath::parse(".a").is_err());
        assert_eq!(StatePath::parse("a.b.c").unwrap().len(), 3);
    }

    #[test]
    fn test_prefix_is_segment_wise() {
        let ab = StatePath::parse("ab.c").unwrap();
        let a = StatePath::parse("a").unwrap();
        assert!(!ab.starts_with(&a));

        let abc = StatePath::parse("a.b.c").unwrap();
        assert!(abc.starts_with(&a));
        assert_eq!(abc.strip_prefix(&a).unwrap().to_string(), "b.c");
    }

    #[test]
    fn test_resolve_through_arrays() {
        let t = tree(json!({"tests": [{"name": "one"}, {"name": "two"}]}));
        let path = StatePath::parse("tests.1.name").unwrap();
        assert_eq!(path.resolve(&t), Some(&json!("two")));
        assert_eq!(StatePath::parse("tests.9").unwrap().resolve(&t), None);
    }

    #[test]
    fn test_assign_creates_intermediate_maps() {
        let mut t = tree(json!({"a": {}}));
        StatePath::parse("a.b.c").unwrap().assign(&mut t, json!(3)).unwrap();
        StatePath::parse("x.y").unwrap().assign(&mut t, json!(true)).unwrap();
        assert_eq!(Value::Object(t), json!({"a": {"b": {"c": 3}}, "x": {"y": true}}));
    }

    #[test]
    fn test_assign_through_primitive_fails() {
        let mut t = tree(json!({"a": 1}));
        let result = StatePath::parse("a.b").unwrap().assign(&mut t, json!(2));
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[test]
    fn test_version_tokens_differ() {
        let a = StateVersion::generate(1);
        let b = StateVersion::generate(2);
        assert_ne!(a, b);
        assert!(a.as_str().contains('-'));
    }
}
