//! RFC 6902 JSON Patch construction by document diff.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    /// RFC 6901 JSON pointer.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
        }
    }
}

/// Operations that turn `from` into `to`. Empty when they are equal.
///
/// Object keys are visited in sorted order, so the output is stable.
/// Arrays are never diffed element-wise; a changed array is replaced whole.
pub fn diff(from: &Value, to: &Value) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    diff_at("", from, to, &mut ops);
    ops
}

fn diff_at(path: &str, from: &Value, to: &Value, ops: &mut Vec<PatchOperation>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => diff_objects(path, a, b, ops),
        _ => ops.push(PatchOperation::replace(path, to.clone())),
    }
}

fn diff_objects(path: &str, from: &Map<String, Value>, to: &Map<String, Value>, ops: &mut Vec<PatchOperation>) {
    let mut keys: Vec<&String> = from.keys().chain(to.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let child = format!("{path}/{}", escape(key));
        match (from.get(key), to.get(key)) {
            (Some(_), None) => ops.push(PatchOperation::remove(child)),
            (None, Some(value)) => ops.push(PatchOperation::add(child, value.clone())),
            (Some(a), Some(b)) => diff_at(&child, a, b, ops),
            (None, None) => {}
        }
    }
}

/// Escapes one reference token: `~` → `~0`, `/` → `~1`.
pub fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
