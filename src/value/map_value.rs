use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;
use crate::value::{Value, ValueKind};

/// Ordered field map; also the top-level payload of a document.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, Value>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value stored at `path`, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = match current.kind() {
                ValueKind::Map(child) => child.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map value met on the way.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the field at `path`; missing intermediate maps are left alone.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_segments(&mut self.fields, path.segments());
    }

    /// Every leaf path, treating empty maps as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut acc = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut acc);
        acc
    }
}

fn set_segments(fields: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| Value::from_map(BTreeMap::new()));
    let mut child = match entry.kind() {
        ValueKind::Map(map) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_segments(&mut child, rest, value);
    *entry = Value::from_map(child);
}

fn delete_segments(fields: &mut BTreeMap<String, Value>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(entry) = fields.get_mut(first) {
        if let ValueKind::Map(map) = entry.kind() {
            let mut child = map.fields.clone();
            delete_segments(&mut child, rest);
            *entry = Value::from_map(child);
        }
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, Value>,
    prefix: &mut Vec<String>,
    acc: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.is_empty() => collect_leaf_paths(&map.fields, prefix, acc),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    acc.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn set_creates_nested_maps() {
        let mut map = MapValue::empty();
        map.set(&path("address.city"), Value::from_string("Paris"));
        map.set(&path("address.zip"), Value::from_string("75001"));
        assert_eq!(
            map.get(&path("address.city")),
            Some(&Value::from_string("Paris"))
        );
        assert_eq!(map.leaf_paths(), vec![path("address.city"), path("address.zip")]);
    }

    #[test]
    fn set_replaces_scalar_parents() {
        let mut map = MapValue::empty();
        map.set(&path("a"), Value::from_integer(1));
        map.set(&path("a.b"), Value::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&Value::from_integer(2)));
    }

    #[test]
    fn delete_removes_nested_field() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), Value::from_integer(1));
        map.set(&path("a.c"), Value::from_integer(2));
        map.delete(&path("a.b"));
        assert!(map.get(&path("a.b")).is_none());
        assert!(map.get(&path("a.c")).is_some());
        map.delete(&path("missing.field"));
    }
}
