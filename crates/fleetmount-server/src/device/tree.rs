//! JSON data-tree helpers addressed by `DataPath`.

use fleetmount_core::{DataPath, NormalizedNode};
use serde_json::{Map, Value};

pub fn get<'a>(root: &'a Value, path: &DataPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

fn get_mut_or_create<'a>(root: &'a mut Value, segments: &[String]) -> &'a mut Value {
    segments.iter().fold(root, |node, segment| {
        // Indexing a null node turns it into an object.
        if !node.is_object() {
            *node = Value::Null;
        }
        &mut node[segment.as_str()]
    })
}

/// Replaces whatever exists at `path`, creating parents as needed.
pub fn put(root: &mut Value, path: &DataPath, data: NormalizedNode) {
    *get_mut_or_create(root, path.segments()) = data;
}

/// Deep-merges `data` into the node at `path`.
pub fn merge(root: &mut Value, path: &DataPath, data: NormalizedNode) {
    merge_into(get_mut_or_create(root, path.segments()), data);
}

fn merge_into(target: &mut Value, data: Value) {
    match (target, data) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge_into(existing.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, data) => *target = data,
    }
}

/// Removes the node at `path`. Deleting the root empties the tree.
pub fn delete(root: &mut Value, path: &DataPath) -> bool {
    let Some((parent, leaf)) = path.split_last() else {
        let existed = !is_empty(root);
        *root = Value::Object(Map::new());
        return existed;
    };
    let mut node = root;
    for segment in parent.segments() {
        match node.as_object_mut().and_then(|map| map.get_mut(segment)) {
            Some(child) => node = child,
            None => return false,
        }
    }
    node.as_object_mut().is_some_and(|map| map.remove(leaf).is_some())
}

pub fn exists(root: &Value, path: &DataPath) -> bool {
    get(root, path).is_some_and(|node| !node.is_null())
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Projects `node` down to `fields` (paths relative to `node`). No fields
/// means the whole node.
pub fn select(node: &Value, fields: &[DataPath]) -> Value {
    if fields.is_empty() {
        return node.clone();
    }
    let mut projected = Value::Object(Map::new());
    for field in fields {
        if let Some(value) = get(node, field) {
            put(&mut projected, field, value.clone());
        }
    }
    projected
}
