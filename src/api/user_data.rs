//! Turns application data into mutations.
//!
//! Sentinel values are pulled out of the data and become field transforms;
//! `delete_field` sentinels become masked paths without a value.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{invalid_argument, SyncResult};
use crate::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::value::{MapValue, SentinelValue, Value, ValueKind};

/// How `set_document` treats fields already stored in the document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    /// Merge every field present in the data instead of replacing the document.
    pub merge: bool,
    /// Merge only these paths. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let unique: BTreeSet<FieldPath> = fields.into_iter().collect();
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique.into_iter().collect()),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[derive(Default)]
struct ParsedFields {
    data: BTreeMap<String, Value>,
    transforms: Vec<FieldTransform>,
    /// Leaf paths written or deleted. Transformed paths are only in `transforms`.
    paths: Vec<FieldPath>,
}

/// Mutation for `set_document(key, data, options)`.
pub fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, Value>,
    options: &SetOptions,
) -> SyncResult<Mutation> {
    let parsed = parse_fields(data, options.is_merge())?;

    let mutation = if let Some(mask) = &options.merge_fields {
        let available: Vec<&FieldPath> = parsed
            .paths
            .iter()
            .chain(parsed.transforms.iter().map(FieldTransform::field_path))
            .collect();
        for field in mask {
            if !available.iter().any(|path| field.is_prefix_of(path)) {
                return Err(invalid_argument(format!(
                    "Field '{field}' is in merge_fields but missing from the data"
                )));
            }
        }
        let transforms = parsed
            .transforms
            .into_iter()
            .filter(|transform| mask.iter().any(|field| field.is_prefix_of(transform.field_path())))
            .collect();
        let data_mask = FieldMask::new(mask.iter().cloned());
        Mutation::patch(key, MapValue::new(parsed.data), data_mask, Precondition::None)
            .with_transforms(transforms)
    } else if options.merge {
        let mask = FieldMask::new(parsed.paths.iter().cloned());
        Mutation::patch(key, MapValue::new(parsed.data), mask, Precondition::None)
            .with_transforms(parsed.transforms)
    } else {
        Mutation::set(key, MapValue::new(parsed.data)).with_transforms(parsed.transforms)
    };
    Ok(mutation)
}

/// Mutation for `update_document(key, fields)`. Keys are dot-separated field
/// paths; the document must exist.
pub fn parse_update_data(key: DocumentKey, fields: BTreeMap<String, Value>) -> SyncResult<Mutation> {
    if fields.is_empty() {
        return Err(invalid_argument("update_document requires at least one field"));
    }
    let mut data = MapValue::empty();
    let mut mask = FieldMask::empty();
    let mut transforms = Vec::new();

    for (dotted, value) in fields {
        let path = FieldPath::from_dot_separated(&dotted)?;
        match value.into_kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => mask.insert(path),
            ValueKind::Sentinel(sentinel) => {
                transforms.push(transform_from_sentinel(path, sentinel)?);
            }
            ValueKind::Map(map) => {
                let parsed = parse_map(map.into_fields(), &path, &mut transforms, false)?;
                data.set(&path, Value::from_map(parsed));
                mask.insert(path);
            }
            kind => {
                let value = Value::from_kind(kind);
                assert_no_sentinel(&value, &path)?;
                data.set(&path, value);
                mask.insert(path);
            }
        }
    }

    Ok(Mutation::patch(key, data, mask, Precondition::Exists(true)).with_transforms(transforms))
}

fn parse_fields(data: BTreeMap<String, Value>, allow_delete: bool) -> SyncResult<ParsedFields> {
    let mut parsed = ParsedFields::default();
    parsed.data = parse_map_collect(data, &[], &mut parsed, allow_delete)?;
    Ok(parsed)
}

fn parse_map_collect(
    data: BTreeMap<String, Value>,
    parent: &[String],
    parsed: &mut ParsedFields,
    allow_delete: bool,
) -> SyncResult<BTreeMap<String, Value>> {
    let mut cleaned = BTreeMap::new();
    for (field, value) in data {
        let mut segments = parent.to_vec();
        segments.push(field.clone());
        let path = FieldPath::new(segments.clone())?;
        match value.into_kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => {
                if !allow_delete {
                    return Err(invalid_argument(format!(
                        "delete_field() cannot be used in a non-merge set (field '{path}')"
                    )));
                }
                parsed.paths.push(path);
            }
            ValueKind::Sentinel(sentinel) => {
                parsed.transforms.push(transform_from_sentinel(path, sentinel)?);
            }
            ValueKind::Map(map) if !map.is_empty() => {
                let nested = parse_map_collect(map.into_fields(), &segments, parsed, allow_delete)?;
                if !nested.is_empty() {
                    cleaned.insert(field, Value::from_map(nested));
                }
            }
            kind => {
                let value = Value::from_kind(kind);
                assert_no_sentinel(&value, &path)?;
                parsed.paths.push(path);
                cleaned.insert(field, value);
            }
        }
    }
    Ok(cleaned)
}

/// Nested map inside an update: sentinels become transforms under `parent`.
fn parse_map(
    data: BTreeMap<String, Value>,
    parent: &FieldPath,
    transforms: &mut Vec<FieldTransform>,
    allow_delete: bool,
) -> SyncResult<BTreeMap<String, Value>> {
    let mut parsed = ParsedFields::default();
    let cleaned = parse_map_collect(data, parent.segments(), &mut parsed, allow_delete)?;
    transforms.extend(parsed.transforms);
    Ok(cleaned)
}

fn transform_from_sentinel(path: FieldPath, sentinel: SentinelValue) -> SyncResult<FieldTransform> {
    let operation = match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            elements.iter().try_for_each(|element| assert_no_sentinel(element, &path))?;
            TransformOperation::ArrayUnion(elements)
        }
        SentinelValue::ArrayRemove(elements) => {
            elements.iter().try_for_each(|element| assert_no_sentinel(element, &path))?;
            TransformOperation::ArrayRemove(elements)
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument(format!(
                    "increment() needs a numeric operand (field '{path}')"
                )));
            }
            TransformOperation::NumericIncrement(*operand)
        }
        SentinelValue::Delete => {
            return Err(invalid_argument(format!(
                "delete_field() is not a transform (field '{path}')"
            )))
        }
    };
    Ok(FieldTransform::new(path, operation))
}

fn assert_no_sentinel(value: &Value, path: &FieldPath) -> SyncResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Sentinel values cannot be nested in arrays (field '{path}')"
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, path)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, path)),
        _ => Ok(()),
    }
}
