//! Structural JSON diff producing JSON-Patch style operations.
//!
//! `diff` walks two documents and emits an ordered list of `add`, `remove` and
//! `replace` operations addressed by JSON Pointer. Objects are compared key by
//! key; arrays and scalars that differ are replaced whole. `apply` is the
//! inverse and is mostly used to check patches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, TwinCdcError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOperation {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOpKind::Remove,
            path: path.into(),
            value: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Decoded pointer segments of this operation's path.
    pub fn segments(&self) -> Vec<String> {
        parse_pointer(&self.path)
    }

    /// True if the operation targets `path` itself, one of its ancestors or
    /// one of its descendants.
    pub fn touches(&self, path: &str) -> bool {
        let own = self.path.as_str();
        own == path
            || own.is_empty()
            || path.starts_with(&format!("{}/", own))
            || own.starts_with(&format!("{}/", path))
    }
}

/// Escape one pointer segment (`~` → `~0`, `/` → `~1`).
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Build a JSON Pointer from raw segments.
pub fn to_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| format!("/{}", escape_segment(s.as_ref())))
        .collect()
}

/// Split a JSON Pointer into raw segments. The empty pointer is the root.
pub fn parse_pointer(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.trim_start_matches('/')
        .split('/')
        .map(unescape_segment)
        .collect()
}

/// Compute the operations turning `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_into(&mut path, old, new, &mut ops);
    ops
}

fn diff_into(path: &mut Vec<String>, old: &Value, new: &Value, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => diff_objects(path, old_map, new_map, ops),
        _ => ops.push(PatchOperation::replace(to_pointer(path), new.clone())),
    }
}

fn diff_objects(
    path: &mut Vec<String>,
    old_map: &Map<String, Value>,
    new_map: &Map<String, Value>,
    ops: &mut Vec<PatchOperation>,
) {
    for key in old_map.keys().filter(|k| !new_map.contains_key(*k)) {
        path.push(key.clone());
        ops.push(PatchOperation::remove(to_pointer(path)));
        path.pop();
    }

    for (key, new_value) in new_map {
        if let Some(old_value) = old_map.get(key) {
            path.push(key.clone());
            diff_into(path, old_value, new_value, ops);
            path.pop();
        }
    }

    for (key, new_value) in new_map.iter().filter(|(k, _)| !old_map.contains_key(*k)) {
        path.push(key.clone());
        ops.push(PatchOperation::add(to_pointer(path), new_value.clone()));
        path.pop();
    }
}

/// Apply operations to `doc` in order.
pub fn apply(doc: &mut Value, ops: &[PatchOperation]) -> Result<()> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> Result<()> {
    let segments = op.segments();
    let Some((last, parents)) = segments.split_last() else {
        return match op.op {
            PatchOpKind::Remove => Err(patch_error(op, "cannot remove the document root")),
            _ => {
                *doc = op.value.clone().unwrap_or(Value::Null);
                Ok(())
            }
        };
    };

    let target = doc
        .pointer_mut(&to_pointer(parents))
        .ok_or_else(|| patch_error(op, "missing parent"))?;

    let value = op.value.clone().unwrap_or(Value::Null);
    match (target, op.op) {
        (Value::Object(map), PatchOpKind::Add) => {
            map.insert(last.clone(), value);
        }
        (Value::Object(map), PatchOpKind::Replace) => {
            let slot = map.get_mut(last).ok_or_else(|| patch_error(op, "missing target"))?;
            *slot = value;
        }
        (Value::Object(map), PatchOpKind::Remove) => {
            map.remove(last).ok_or_else(|| patch_error(op, "missing target"))?;
        }
        (Value::Array(items), PatchOpKind::Add) => {
            if last == "-" {
                items.push(value);
            } else {
                let index = parse_index(last, items.len() + 1).ok_or_else(|| patch_error(op, "bad index"))?;
                items.insert(index, value);
            }
        }
        (Value::Array(items), PatchOpKind::Replace) => {
            let index = parse_index(last, items.len()).ok_or_else(|| patch_error(op, "bad index"))?;
            items[index] = value;
        }
        (Value::Array(items), PatchOpKind::Remove) => {
            let index = parse_index(last, items.len()).ok_or_else(|| patch_error(op, "bad index"))?;
            items.remove(index);
        }
        _ => return Err(patch_error(op, "target is not a container")),
    }
    Ok(())
}

fn parse_index(segment: &str, len: usize) -> Option<usize> {
    segment.parse::<usize>().ok().filter(|i| *i < len)
}

fn patch_error(op: &PatchOperation, reason: &str) -> TwinCdcError {
    TwinCdcError::InternalError(format!("cannot apply {:?} at '{}': {}", op.op, op.path, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pointer_escaping() {
        let pointer = to_pointer(&["a/b", "c~d"]);
        assert_eq!(pointer, "/a~1b/c~0d");
        assert_eq!(parse_pointer(&pointer), vec!["a/b", "c~d"]);
        assert!(parse_pointer("").is_empty());
    }

    #[test]
    fn test_diff_nested_objects() {
        let old = json!({"a": 1, "b": {"c": 2, "d": 3}, "gone": true});
        let new = json!({"a": 1, "b": {"c": 5, "d": 3}, "fresh": [1, 2]});

        let ops = diff(&old, &new);
        assert_eq!(
            ops,
            vec![
                PatchOperation::remove("/gone"),
                PatchOperation::replace("/b/c", json!(5)),
                PatchOperation::add("/fresh", json!([1, 2])),
            ]
        );
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let doc = json!({"x": {"y": [1, {"z": null}]}});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_arrays_replaced_whole() {
        let ops = diff(&json!({"l": [1, 2]}), &json!({"l": [1, 3]}));
        assert_eq!(ops, vec![PatchOperation::replace("/l", json!([1, 3]))]);
    }

    #[test]
    fn test_apply_reproduces_target() {
        let old = json!({
            "$dtId": "room-1",
            "temperature": 20,
            "settings": {"mode": "auto", "limits": {"max": 30}},
            "tags": ["a"]
        });
        let new = json!({
            "$dtId": "room-1",
            "humidity": 40,
            "settings": {"mode": "manual", "limits": {}},
            "tags": ["a", "b"]
        });

        let mut doc = old.clone();
        apply(&mut doc, &diff(&old, &new)).unwrap();
        assert_eq!(doc, new);
    }

    #[test]
    fn test_apply_rejects_missing_target() {
        let mut doc = json!({});
        let err = apply(&mut doc, &[PatchOperation::replace("/nope", json!(1))]);
        assert!(err.is_err());
    }

    #[test]
    fn test_touches() {
        let op = PatchOperation::replace("/settings/mode", json!("x"));
        assert!(op.touches("/settings"));
        assert!(op.touches("/settings/mode"));
        assert!(!op.touches("/set"));
        assert!(!op.touches("/temperature"));
    }

    #[test]
    fn test_serialized_shape() {
        let wire = serde_json::to_value(PatchOperation::remove("/a")).unwrap();
        assert_eq!(wire, json!({"op": "remove", "path": "/a"}));
    }
}
