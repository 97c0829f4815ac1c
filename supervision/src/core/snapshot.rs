//! Immutable point-in-time view of the agency tree.
//!
//! A [`Snapshot`] is addressed by slash-separated paths (`/Plan/Version`).
//! Reads never fail: a missing or mistyped value is `None`. The free
//! functions at the bottom are the mutable tree primitives the in-memory
//! agency uses to apply operations; they are kept here so both sides agree
//! on how paths are split.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Cheaply clonable, read-only agency tree.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: Arc<Value>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl Snapshot {
    pub fn new(root: Value) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    /// The whole tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn string(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn uint(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    pub fn bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn array(&self, path: &str) -> Option<&Vec<Value>> {
        self.get(path).and_then(Value::as_array)
    }

    /// Array of strings at `path`; non-string entries are skipped.
    pub fn string_array(&self, path: &str) -> Option<Vec<String>> {
        self.array(path).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    /// Child keys of the object at `path`, in lexicographic order.
    ///
    /// Returns an empty list when `path` is missing or not an object.
    pub fn children(&self, path: &str) -> Vec<&str> {
        match self.get(path) {
            Some(Value::Object(map)) => {
                let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                keys.sort_unstable();
                keys
            }
            _ => Vec::new(),
        }
    }
}

/// Split a slash path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|seg| !seg.is_empty()).collect()
}

/// Resolve `path` inside `root`. The empty path and `/` resolve to `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Mutable access to the node at `path`, creating intermediate objects.
///
/// Non-object intermediates are replaced by empty objects, matching the
/// store's "set wins" semantics.
pub fn lookup_or_create<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
    let mut node = root;
    for seg in segments(path) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = &mut node[seg];
    }
    node
}

/// Replace the value at `path` (the root itself for `/`).
pub fn store(root: &mut Value, path: &str, value: Value) {
    *lookup_or_create(root, path) = value;
}

/// Remove the value at `path`. Removing the root empties the tree.
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        return Some(std::mem::replace(root, Value::Object(Map::new())));
    };
    let mut node = root;
    for seg in parents {
        node = node.as_object_mut()?.get_mut(*seg)?;
    }
    node.as_object_mut()?.remove(*last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Snapshot {
        Snapshot::new(json!({
            "Plan": {
                "Version": 7,
                "Collections": {"db": {"c": {"shards": {"s1": ["a", "b"]}}}}
            },
            "Supervision": {"Health": {"b": {"Status": "GOOD"}, "a": {"Status": "BAD"}}},
            "Flag": true
        }))
    }

    #[test]
    fn typed_reads_resolve_nested_paths() {
        let snap = sample();
        assert_eq!(snap.uint("/Plan/Version"), Some(7));
        assert_eq!(
            snap.string_array("/Plan/Collections/db/c/shards/s1"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(snap.string("/Supervision/Health/a/Status"), Some("BAD"));
        assert_eq!(snap.bool("/Flag"), Some(true));
    }

    #[test]
    fn missing_or_mistyped_reads_are_none() {
        let snap = sample();
        assert!(snap.get("/Plan/Nope").is_none());
        assert!(snap.uint("/Flag").is_none());
        assert!(snap.children("/Plan/Version").is_empty());
    }

    #[test]
    fn children_are_sorted() {
        let snap = sample();
        assert_eq!(snap.children("/Supervision/Health"), vec!["a", "b"]);
    }

    #[test]
    fn store_creates_intermediate_objects() {
        let mut root = json!({"a": 1});
        store(&mut root, "/a/b/c", json!("x"));
        assert_eq!(root, json!({"a": {"b": {"c": "x"}}}));
    }

    #[test]
    fn remove_detaches_subtree() {
        let mut root = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(remove(&mut root, "/a/b"), Some(json!(1)));
        assert_eq!(root, json!({"a": {"c": 2}}));
        assert_eq!(remove(&mut root, "/a/zzz"), None);
    }
}
