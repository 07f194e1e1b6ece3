//! Dotted-path lookup over heterogeneous JSON values.

use serde_json::Value;

/// Resolve a dotted path (`"device.sensors.temperature"`) inside `root`.
///
/// Returns `None` when any segment is absent or a non-object is traversed.
/// A present-but-null field returns `Some(&Value::Null)`, keeping "absent"
/// distinguishable from a legitimate null.
#[must_use]
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
