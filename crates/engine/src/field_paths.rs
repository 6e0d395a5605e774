//! Field path parsing and JSON tree helpers.
//!
//! A field path addresses one scalar slot in the form tree using `.` for object
//! nesting and `[i]` for array positions, e.g. `riskItems[2].address.suburb`.
//! These helpers are shared by the data store (merge traversal, removal), the
//! metadata index (top-level key derivation) and the expression runtime
//! (dependency snapshots), so all three agree on one grammar.

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

/// One step of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Raised when a field path does not follow the dot/bracket grammar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid field path '{path}': {reason}")]
pub struct FieldPathError {
    pub path: String,
    pub reason: String,
}

impl FieldPathError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parses `path` into segments.
///
/// Keys may contain any character except `.`, `[` and `]`; indices must be
/// plain decimal numbers. A path must start with a key.
pub fn parse_field_path(path: &str) -> Result<Vec<PathSegment>, FieldPathError> {
    if path.trim().is_empty() {
        return Err(FieldPathError::new(path, "path cannot be empty"));
    }

    let mut segments = Vec::new();
    let mut key = String::new();
    let mut characters = path.chars().peekable();
    let mut expect_key = true;

    while let Some(character) = characters.next() {
        match character {
            '.' => {
                if key.is_empty() {
                    if expect_key {
                        return Err(FieldPathError::new(path, "empty key segment"));
                    }
                } else {
                    segments.push(PathSegment::Key(std::mem::take(&mut key)));
                }
                expect_key = true;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut key)));
                } else if segments.is_empty() {
                    return Err(FieldPathError::new(path, "path must start with a key"));
                } else if expect_key {
                    return Err(FieldPathError::new(path, "empty key segment before index"));
                }
                let mut digits = String::new();
                loop {
                    match characters.next() {
                        Some(']') => break,
                        Some(digit) if digit.is_ascii_digit() => digits.push(digit),
                        Some(other) => return Err(FieldPathError::new(path, format!("unexpected '{other}' inside index"))),
                        None => return Err(FieldPathError::new(path, "unterminated index")),
                    }
                }
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| FieldPathError::new(path, "index must be a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                expect_key = false;
                if let Some(next) = characters.peek()
                    && *next != '.'
                    && *next != '['
                {
                    return Err(FieldPathError::new(path, "index must be followed by '.' or '['"));
                }
            }
            ']' => return Err(FieldPathError::new(path, "unexpected ']'")),
            other => {
                key.push(other);
                expect_key = false;
            }
        }
    }

    if !key.is_empty() {
        segments.push(PathSegment::Key(key));
    } else if expect_key {
        return Err(FieldPathError::new(path, "path cannot end with '.'"));
    }

    Ok(segments)
}

/// Formats segments back into the canonical dot/bracket form.
pub fn format_field_path(segments: &[PathSegment]) -> String {
    let mut path = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
            }
            PathSegment::Index(index) => {
                path.push('[');
                path.push_str(&index.to_string());
                path.push(']');
            }
        }
    }
    path
}

/// Appends an object key to a path prefix.
pub fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Appends an array index to a path prefix.
pub fn join_index(prefix: &str, index: usize) -> String {
    format!("{prefix}[{index}]")
}

/// Splits a field path into the top-level question key and the remainder.
///
/// Everything after the first `.` is the remainder; a trailing `[n]` on the
/// key part is stripped, so `riskItems[2].address.suburb` yields
/// `("riskItems", Some("address.suburb"))` and `drivers[0]` yields
/// `("drivers", None)`.
pub fn split_top_level_key(path: &str) -> (&str, Option<&str>) {
    let (head, remainder) = match path.split_once('.') {
        Some((head, remainder)) => (head, Some(remainder)),
        None => (path, None),
    };
    let key = head.split('[').next().unwrap_or(head);
    (key, remainder)
}

/// Returns true when `candidate` is `ancestor` itself or lies beneath it.
pub fn is_same_or_descendant(candidate: &str, ancestor: &str) -> bool {
    match candidate.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || rest.starts_with('['),
        None => false,
    }
}

/// Returns true for JSON values treated as field leaves.
pub fn is_scalar_json_value(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null)
}

/// Reads the value stored at `segments`, if any.
pub fn value_at<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable counterpart of [`value_at`].
pub fn value_at_mut<'a>(root: &'a mut Value, segments: &[PathSegment]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at `segments`, creating intermediate objects and arrays.
///
/// Arrays grow with `null` padding when the index is past the end. Existing
/// scalars standing in the way are replaced by containers.
pub fn set_value_at(root: &mut Value, segments: &[PathSegment], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for (position, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(segments[position + 1], PathSegment::Index(_));
        current = child_container(current, segment, next_is_index);
    }

    match last {
        PathSegment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(JsonMap::new());
            }
            if let Value::Object(map) = current {
                map.insert(key.clone(), value);
            }
        }
        PathSegment::Index(index) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            if let Value::Array(items) = current {
                if items.len() <= *index {
                    items.resize(index + 1, Value::Null);
                }
                items[*index] = value;
            }
        }
    }
}

fn child_container<'a>(current: &'a mut Value, segment: &PathSegment, next_is_index: bool) -> &'a mut Value {
    let empty = || if next_is_index { Value::Array(Vec::new()) } else { Value::Object(JsonMap::new()) };
    let child = match segment {
        PathSegment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(JsonMap::new());
            }
            match current {
                Value::Object(map) => map.entry(key.clone()).or_insert_with(empty),
                other => return other,
            }
        }
        PathSegment::Index(index) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            match current {
                Value::Array(items) => {
                    if items.len() <= *index {
                        items.resize(index + 1, Value::Null);
                    }
                    &mut items[*index]
                }
                other => return other,
            }
        }
    };
    if !child.is_object() && !child.is_array() {
        *child = empty();
    }
    child
}

/// Removes and returns the value at `segments`.
///
/// Removing an array element shifts later elements down by one position.
pub fn remove_value_at(root: &mut Value, segments: &[PathSegment]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut current = root;
    for segment in parents {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    match (last, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.remove(key),
        (PathSegment::Index(index), Value::Array(items)) if *index < items.len() => Some(items.remove(*index)),
        _ => None,
    }
}

/// Collects every scalar leaf under `value` as `(path, value)` pairs, depth-first.
pub fn scalar_leaves(value: &Value, prefix: &str) -> Vec<(String, Value)> {
    let mut leaves = Vec::new();
    collect_scalar_leaves(value, prefix, &mut leaves);
    leaves
}

fn collect_scalar_leaves(value: &Value, current_path: &str, leaves: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, nested_value) in map {
                collect_scalar_leaves(nested_value, &join_key(current_path, key), leaves);
            }
        }
        Value::Array(items) => {
            for (index, nested_value) in items.iter().enumerate() {
                collect_scalar_leaves(nested_value, &join_index(current_path, index), leaves);
            }
        }
        scalar => {
            if !current_path.is_empty() {
                leaves.push((current_path.to_string(), scalar.clone()));
            }
        }
    }
}

/// Builds a sparse tree holding `value` at `path`.
pub fn tree_from_path(path: &str, value: Value) -> Result<Value, FieldPathError> {
    let segments = parse_field_path(path)?;
    let mut root = Value::Object(JsonMap::new());
    set_value_at(&mut root, &segments, value);
    Ok(root)
}
