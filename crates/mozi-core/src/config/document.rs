//! In-memory mutation primitives for the config document.
//!
//! The document is plain JSON once loaded (comments are accepted on read
//! via json5). All mutations operate on `serde_json::Value` and are pure —
//! the store layer decides when the result hits disk.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path::{format_path, parse_path, PathSegment};

/// Literal placed at a sensitive path to mean "keep the existing value".
pub const REDACTION_SENTINEL: &str = "__MOZI_REDACTED__";

/// Parse JSON-with-comments text into a JSON value.
pub fn parse_jsonc(text: &str) -> Result<Value, String> {
    json5::from_str(text).map_err(|e| format!("config parse error: {e}"))
}

/// Read the node addressed by `path`, if present.
pub fn get_at<'a>(doc: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut node = doc;
    for seg in path {
        node = match seg {
            PathSegment::Key(k) => node.as_object()?.get(k)?,
            PathSegment::Index(i) => node.as_array()?.get(*i)?,
        };
    }
    Some(node)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Array indices must address an existing element or the position one past
/// the end (append). Anything else is a structural error.
pub fn set_at(doc: &mut Value, path: &[PathSegment], value: Value) -> Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        return Err("cannot set the document root; use patch".to_string());
    };

    let mut node = doc;
    for (depth, seg) in parents.iter().enumerate() {
        match seg {
            PathSegment::Key(k) => {
                if node.is_null() {
                    *node = Value::Object(serde_json::Map::new());
                }
                let obj = node.as_object_mut().ok_or_else(|| {
                    format!(
                        "cannot descend into non-object at '{}'",
                        format_path(&path[..depth])
                    )
                })?;
                node = obj.entry(k.clone()).or_insert(Value::Null);
            }
            PathSegment::Index(i) => {
                let arr = node.as_array_mut().ok_or_else(|| {
                    format!(
                        "cannot index into non-array at '{}'",
                        format_path(&path[..depth])
                    )
                })?;
                node = arr.get_mut(*i).ok_or_else(|| {
                    format!("array index {i} out of bounds at '{}'", format_path(&path[..depth]))
                })?;
            }
        }
    }

    match last {
        PathSegment::Key(k) => {
            if node.is_null() {
                *node = Value::Object(serde_json::Map::new());
            }
            let obj = node
                .as_object_mut()
                .ok_or_else(|| format!("cannot set key on non-object at '{}'", format_path(parents)))?;
            obj.insert(k.clone(), value);
        }
        PathSegment::Index(i) => {
            let arr = node
                .as_array_mut()
                .ok_or_else(|| format!("cannot index non-array at '{}'", format_path(parents)))?;
            if *i < arr.len() {
                arr[*i] = value;
            } else if *i == arr.len() {
                arr.push(value);
            } else {
                return Err(format!(
                    "array index {i} out of bounds at '{}' (len {})",
                    format_path(parents),
                    arr.len()
                ));
            }
        }
    }
    Ok(())
}

/// Remove the node at `path`. Returns whether anything was removed.
pub fn delete_at(doc: &mut Value, path: &[PathSegment]) -> Result<bool, String> {
    let Some((last, parents)) = path.split_last() else {
        return Err("cannot delete the document root".to_string());
    };

    let Some(parent) = get_at_mut(doc, parents) else {
        return Ok(false);
    };
    match last {
        PathSegment::Key(k) => Ok(parent
            .as_object_mut()
            .map(|obj| obj.remove(k).is_some())
            .unwrap_or(false)),
        PathSegment::Index(i) => match parent.as_array_mut() {
            Some(arr) if *i < arr.len() => {
                arr.remove(*i);
                Ok(true)
            }
            _ => Ok(false),
        },
    }
}

fn get_at_mut<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    let mut node = doc;
    for seg in path {
        node = match seg {
            PathSegment::Key(k) => node.as_object_mut()?.get_mut(k)?,
            PathSegment::Index(i) => node.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(node)
}

/// Deep merge: objects recurse, everything else replaces.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (key, pv) in p {
                match t.get_mut(key) {
                    Some(tv) if tv.is_object() && pv.is_object() => deep_merge(tv, pv),
                    _ => {
                        t.insert(key.clone(), pv.clone());
                    }
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

/// One step in an ordered mutation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ConfigOp {
    Set { path: String, value: Value },
    Delete { path: String },
    Patch { path: Option<String>, value: Value },
}

/// Apply an ordered list of operations to a running document.
///
/// Redaction sentinels inside incoming values are resolved against the
/// document state *at the time each op applies*, so an `apply` that sets a
/// secret and then patches around it behaves like two sequential calls.
pub fn apply_ops(doc: &mut Value, ops: &[ConfigOp]) -> Result<(), String> {
    for op in ops {
        match op {
            ConfigOp::Set { path, value } => {
                let segments = parse_path(path)?;
                let mut value = value.clone();
                resolve_redactions(&mut value, doc, &segments)?;
                set_at(doc, &segments, value)?;
            }
            ConfigOp::Delete { path } => {
                let segments = parse_path(path)?;
                delete_at(doc, &segments)?;
            }
            ConfigOp::Patch { path, value } => {
                let segments = match path {
                    Some(p) => parse_path(p)?,
                    None => Vec::new(),
                };
                let mut value = value.clone();
                resolve_redactions(&mut value, doc, &segments)?;
                if segments.is_empty() {
                    deep_merge(doc, &value);
                } else {
                    let mut target = get_at(doc, &segments).cloned().unwrap_or(Value::Null);
                    if target.is_object() && value.is_object() {
                        deep_merge(&mut target, &value);
                    } else {
                        target = value;
                    }
                    set_at(doc, &segments, target)?;
                }
            }
        }
    }
    Ok(())
}

/// Whether a key names a secret the redaction sentinel may stand in for.
pub fn is_sensitive_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("apikey")
        || key.eq_ignore_ascii_case("bottoken")
        || key.eq_ignore_ascii_case("authtoken")
}

/// Replace every redaction sentinel in `incoming` with the value currently
/// stored at the same path in `existing`.
///
/// Sentinels are honored only at sensitive leaves (last segment `apiKey`,
/// `botToken`, or `authToken`, case-insensitive); elsewhere the literal
/// passes through untouched. A sentinel with no existing value is an error.
pub fn resolve_redactions(
    incoming: &mut Value,
    existing: &Value,
    base_path: &[PathSegment],
) -> Result<(), String> {
    match incoming {
        Value::String(s) if s == REDACTION_SENTINEL => {
            let sensitive = matches!(base_path.last(), Some(PathSegment::Key(k)) if is_sensitive_key(k));
            if !sensitive {
                return Ok(());
            }
            match get_at(existing, base_path) {
                Some(prev) => {
                    *incoming = prev.clone();
                    Ok(())
                }
                None => Err(format!(
                    "redaction sentinel at '{}' but no existing value to keep",
                    format_path(base_path)
                )),
            }
        }
        Value::Object(map) => {
            let mut path = base_path.to_vec();
            for (key, child) in map.iter_mut() {
                path.push(PathSegment::Key(key.clone()));
                resolve_redactions(child, existing, &path)?;
                path.pop();
            }
            Ok(())
        }
        Value::Array(items) => {
            let mut path = base_path.to_vec();
            for (i, child) in items.iter_mut().enumerate() {
                path.push(PathSegment::Index(i));
                resolve_redactions(child, existing, &path)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
