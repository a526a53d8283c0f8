//! Dot-delimited path addressing into nested document trees.
//!
//! A path like `arr.0.name` descends through object keys and numeric array
//! indices. These helpers are the single place the crate resolves paths, so
//! tracker, store and document all agree on addressing semantics.

use serde_json::{Map, Value};

/// Field-to-value mapping backing a document's state.
pub type FieldMap = Map<String, Value>;

/// Iterate the `.`-separated segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// True when `ancestor` is a strict prefix of `path` at a segment boundary.
///
/// `arr` is a strict ancestor of `arr.0` and `arr.0.name`, but not of
/// `arrivals` and not of itself.
pub fn is_strict_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

/// Parent path of `path`, or `None` for a top-level field.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(head, _)| head)
}

/// Read the value at `path`, if the full path resolves.
pub fn get_value<'a>(root: &'a FieldMap, path: &str) -> Option<&'a Value> {
    let mut segs = segments(path);
    let first = segs.next()?;
    let mut node = root.get(first)?;
    for seg in segs {
        node = match node {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Writing past the end of an existing array pads the gap with nulls, the
/// same way the destination store materializes indexed `$set`s.
pub fn set_value(root: &mut FieldMap, path: &str, value: Value) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.len() == 1 {
        root.insert(segs[0].to_string(), value);
        return;
    }
    let child = root.entry(segs[0].to_string()).or_insert(Value::Null);
    if !child.is_object() && !child.is_array() {
        *child = Value::Object(Map::new());
    }
    set_in(child, &segs[1..], value);
}

fn set_in(node: &mut Value, segs: &[&str], value: Value) {
    let (head, rest) = match segs.split_first() {
        Some(split) => split,
        None => return,
    };

    if rest.is_empty() {
        match node {
            Value::Object(map) => {
                map.insert(head.to_string(), value);
            }
            Value::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    if index >= items.len() {
                        items.resize(index + 1, Value::Null);
                    }
                    items[index] = value;
                }
            }
            _ => {}
        }
        return;
    }

    let child = match node {
        Value::Object(map) => map.entry(head.to_string()).or_insert(Value::Null),
        Value::Array(items) => {
            let Ok(index) = head.parse::<usize>() else {
                return;
            };
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        _ => return,
    };
    if !child.is_object() && !child.is_array() {
        *child = Value::Object(Map::new());
    }
    set_in(child, rest, value);
}

/// Remove the value at `path`, returning it if the path resolved.
///
/// Removing an array element leaves a null in place rather than shifting
/// later elements, matching store-side `$unset` semantics.
pub fn remove_value(root: &mut FieldMap, path: &str) -> Option<Value> {
    let segs: Vec<&str> = segments(path).collect();
    if segs.len() == 1 {
        return root.remove(segs[0]);
    }
    let node = root.get_mut(segs[0])?;
    remove_in(node, &segs[1..])
}

fn remove_in(node: &mut Value, segs: &[&str]) -> Option<Value> {
    let (head, rest) = segs.split_first()?;

    if rest.is_empty() {
        return match node {
            Value::Object(map) => map.remove(*head),
            Value::Array(items) => {
                let index = head.parse::<usize>().ok()?;
                let slot = items.get_mut(index)?;
                Some(std::mem::replace(slot, Value::Null))
            }
            _ => None,
        };
    }

    let child = match node {
        Value::Object(map) => map.get_mut(*head)?,
        Value::Array(items) => items.get_mut(head.parse::<usize>().ok()?)?,
        _ => return None,
    };
    remove_in(child, rest)
}
