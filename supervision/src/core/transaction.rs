//! Conditional multi-key transactions.
//!
//! A [`Transaction`] is a set of write operations plus a set of preconditions,
//! both keyed by agency path. The store applies every operation or none of
//! them: if any precondition fails against the store's state at apply time
//! the whole transaction is rejected.
//!
//! Evaluation and application are pure functions over a JSON tree so that the
//! in-memory agency and the unit tests share a single definition of every
//! operation's semantics.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::core::snapshot;

const READ_LOCK_IDS: &str = "readLockIds";

/// One write against a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set(Value),
    Delete,
    /// Add one to an unsigned counter (absent counts as zero).
    Increment,
    /// Append to an array, creating it when absent.
    Push(Value),
    /// Remove every array entry equal to the value.
    Erase(Value),
    WriteLock { by: String },
    WriteUnlock { by: String },
    ReadLock { by: String },
    ReadUnlock { by: String },
}

/// One assertion against a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Exact equality with the stored value.
    Old(Value),
    /// `true`: the path must be absent. `false`: it must exist.
    OldEmpty(bool),
    IsArray(bool),
    CanReadLock,
    CanWriteLock,
    IsReadLocked(String),
    IsWriteLocked(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    operations: BTreeMap<String, Operation>,
    preconditions: BTreeMap<String, Precondition>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, &Operation)> {
        self.operations.iter().map(|(path, op)| (path.as_str(), op))
    }

    pub fn preconditions(&self) -> impl Iterator<Item = (&str, &Precondition)> {
        self.preconditions.iter().map(|(path, pre)| (path.as_str(), pre))
    }

    pub fn operation(&self, path: &str) -> Option<&Operation> {
        self.operations.get(path)
    }

    pub fn precondition(&self, path: &str) -> Option<&Precondition> {
        self.preconditions.get(path)
    }

    pub fn operate(&mut self, path: impl Into<String>, op: Operation) -> &mut Self {
        self.operations.insert(path.into(), op);
        self
    }

    pub fn require(&mut self, path: impl Into<String>, pre: Precondition) -> &mut Self {
        self.preconditions.insert(path.into(), pre);
        self
    }

    pub fn set(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.operate(path, Operation::Set(value))
    }

    pub fn delete(&mut self, path: impl Into<String>) -> &mut Self {
        self.operate(path, Operation::Delete)
    }

    pub fn increment(&mut self, path: impl Into<String>) -> &mut Self {
        self.operate(path, Operation::Increment)
    }

    pub fn push(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.operate(path, Operation::Push(value))
    }

    pub fn erase(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.operate(path, Operation::Erase(value))
    }

    pub fn write_lock(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.operate(path, Operation::WriteLock { by: by.to_string() })
    }

    pub fn write_unlock(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.operate(path, Operation::WriteUnlock { by: by.to_string() })
    }

    pub fn read_lock(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.operate(path, Operation::ReadLock { by: by.to_string() })
    }

    pub fn read_unlock(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.operate(path, Operation::ReadUnlock { by: by.to_string() })
    }

    pub fn old(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.require(path, Precondition::Old(value))
    }

    pub fn old_empty(&mut self, path: impl Into<String>, empty: bool) -> &mut Self {
        self.require(path, Precondition::OldEmpty(empty))
    }

    pub fn is_array(&mut self, path: impl Into<String>, expected: bool) -> &mut Self {
        self.require(path, Precondition::IsArray(expected))
    }

    pub fn can_read_lock(&mut self, path: impl Into<String>) -> &mut Self {
        self.require(path, Precondition::CanReadLock)
    }

    pub fn can_write_lock(&mut self, path: impl Into<String>) -> &mut Self {
        self.require(path, Precondition::CanWriteLock)
    }

    pub fn is_read_locked(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.require(path, Precondition::IsReadLocked(by.to_string()))
    }

    pub fn is_write_locked(&mut self, path: impl Into<String>, by: &str) -> &mut Self {
        self.require(path, Precondition::IsWriteLocked(by.to_string()))
    }

    /// Fold `other` into `self`.
    ///
    /// Identical entries for the same path collapse into one; differing
    /// entries are a conflict and leave `self` unchanged.
    pub fn merge(&mut self, other: Transaction) -> Result<(), String> {
        for (path, op) in &other.operations {
            if let Some(existing) = self.operations.get(path) {
                if existing != op {
                    return Err(format!("conflicting operations for {path}"));
                }
            }
        }
        for (path, pre) in &other.preconditions {
            if let Some(existing) = self.preconditions.get(path) {
                if existing != pre {
                    return Err(format!("conflicting preconditions for {path}"));
                }
            }
        }
        self.operations.extend(other.operations);
        self.preconditions.extend(other.preconditions);
        Ok(())
    }

    /// Whether every precondition holds against `root`.
    pub fn check(&self, root: &Value) -> Result<(), String> {
        for (path, pre) in &self.preconditions {
            if !pre.holds(snapshot::lookup(root, path)) {
                return Err(format!("precondition {pre:?} failed for {path}"));
            }
        }
        Ok(())
    }

    /// Apply every operation to `root`. Preconditions are not consulted.
    pub fn apply(&self, root: &mut Value) {
        for (path, op) in &self.operations {
            op.apply(root, path);
        }
    }

    /// Store wire form: `[{path: operation}, {path: precondition}]`.
    pub fn to_json(&self) -> Value {
        let writes: Map<String, Value> = self
            .operations
            .iter()
            .map(|(path, op)| (path.clone(), op.to_json()))
            .collect();
        let preconditions: Map<String, Value> = self
            .preconditions
            .iter()
            .map(|(path, pre)| (path.clone(), pre.to_json()))
            .collect();
        Value::Array(vec![Value::Object(writes), Value::Object(preconditions)])
    }
}

impl Operation {
    pub fn to_json(&self) -> Value {
        match self {
            Operation::Set(value) => json!({"op": "set", "new": value}),
            Operation::Delete => json!({"op": "delete"}),
            Operation::Increment => json!({"op": "increment"}),
            Operation::Push(value) => json!({"op": "push", "new": value}),
            Operation::Erase(value) => json!({"op": "erase", "val": value}),
            Operation::WriteLock { by } => json!({"op": "write-lock", "by": by}),
            Operation::WriteUnlock { by } => json!({"op": "write-unlock", "by": by}),
            Operation::ReadLock { by } => json!({"op": "read-lock", "by": by}),
            Operation::ReadUnlock { by } => json!({"op": "read-unlock", "by": by}),
        }
    }

    pub fn apply(&self, root: &mut Value, path: &str) {
        match self {
            Operation::Set(value) => snapshot::store(root, path, value.clone()),
            Operation::Delete => {
                snapshot::remove(root, path);
            }
            Operation::Increment => {
                let next = snapshot::lookup(root, path)
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    + 1;
                snapshot::store(root, path, json!(next));
            }
            Operation::Push(value) => {
                let node = snapshot::lookup_or_create(root, path);
                match node {
                    Value::Array(items) => items.push(value.clone()),
                    other => *other = Value::Array(vec![value.clone()]),
                }
            }
            Operation::Erase(value) => {
                if let Some(Value::Array(items)) = lookup_mut(root, path) {
                    items.retain(|item| item != value);
                }
            }
            Operation::WriteLock { by } => snapshot::store(root, path, json!(by)),
            Operation::WriteUnlock { by } => {
                if snapshot::lookup(root, path).and_then(Value::as_str) == Some(by.as_str()) {
                    snapshot::remove(root, path);
                }
            }
            Operation::ReadLock { by } => {
                let node = snapshot::lookup_or_create(root, path);
                let mut holders = read_lock_ids(node).unwrap_or_default();
                if !holders.contains(by) {
                    holders.push(by.clone());
                }
                *node = json!({ READ_LOCK_IDS: holders });
            }
            Operation::ReadUnlock { by } => {
                let Some(node) = lookup_mut(root, path) else {
                    return;
                };
                let Some(mut holders) = read_lock_ids(node) else {
                    return;
                };
                holders.retain(|holder| holder != by);
                if holders.is_empty() {
                    snapshot::remove(root, path);
                } else {
                    *node = json!({ READ_LOCK_IDS: holders });
                }
            }
        }
    }
}

impl Precondition {
    pub fn to_json(&self) -> Value {
        match self {
            Precondition::Old(value) => json!({"old": value}),
            Precondition::OldEmpty(empty) => json!({"oldEmpty": empty}),
            Precondition::IsArray(expected) => json!({"isArray": expected}),
            Precondition::CanReadLock => json!({"can-read-lock": true}),
            Precondition::CanWriteLock => json!({"can-write-lock": true}),
            Precondition::IsReadLocked(by) => json!({"is-read-locked": by}),
            Precondition::IsWriteLocked(by) => json!({"is-write-locked": by}),
        }
    }

    /// Evaluate against the value currently stored at the path.
    pub fn holds(&self, current: Option<&Value>) -> bool {
        match self {
            Precondition::Old(expected) => current == Some(expected),
            Precondition::OldEmpty(empty) => current.is_none() == *empty,
            Precondition::IsArray(expected) => current.is_some_and(Value::is_array) == *expected,
            Precondition::CanReadLock => match current {
                None => true,
                Some(node) => read_lock_ids(node).is_some(),
            },
            Precondition::CanWriteLock => match current {
                None => true,
                Some(node) => read_lock_ids(node).is_some_and(|holders| holders.is_empty()),
            },
            Precondition::IsReadLocked(by) => current
                .and_then(read_lock_ids)
                .is_some_and(|holders| holders.contains(by)),
            Precondition::IsWriteLocked(by) => {
                current.and_then(Value::as_str) == Some(by.as_str())
            }
        }
    }
}

/// Holders of a read-lock marker; `None` when the node is not a read lock.
pub fn read_lock_ids(node: &Value) -> Option<Vec<String>> {
    let ids = node.as_object()?.get(READ_LOCK_IDS)?.as_array()?;
    Some(
        ids.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn lookup_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut node = root;
    for seg in snapshot::segments(path) {
        node = node.as_object_mut()?.get_mut(seg)?;
    }
    Some(node)
}
