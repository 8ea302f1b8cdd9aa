use serde::{Deserialize, Serialize};

use crate::error::{internal_error, SyncResult};
use crate::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{ArrayValue, MapValue, Value, ValueKind};

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Server-evaluated operations applied to a single field at commit time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Value),
}

impl TransformOperation {
    /// Speculative result computed before the server has seen the write.
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => Value::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => {
                Value::from_array(coerce_array(previous).union_with(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => {
                Value::from_array(coerce_array(previous).remove_all(elements).values().to_vec())
            }
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Increments are not idempotent, so replaying one twice double counts.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the masked fields; masked paths absent from `data` are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Only checks the precondition.
    Verify,
}

/// A single write against one document. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Outcome of a mutation as reported by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<Value>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { data, mask },
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Applies the mutation speculatively and returns the accumulated field
    /// mask. `None` means the whole document was overwritten.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                self.write_transform_results(&mut data, results);
                let version = post_mutation_version(document);
                document
                    .convert_to_found(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let results = self.local_transform_results(document, local_write_time);
                let mut patched = document.data().clone();
                apply_patch(&mut patched, data, mask);
                self.write_transform_results(&mut patched, results);
                let version = post_mutation_version(document);
                document
                    .convert_to_found(version, patched)
                    .set_has_local_mutations();
                let mut merged = previous_mask?.union(mask);
                for transform in &self.field_transforms {
                    merged.insert(transform.field_path().clone());
                }
                Some(merged)
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document,
    /// using the server-computed transform results.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> SyncResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let results = self.server_transform_results(&result.transform_results)?;
                let mut data = value.clone();
                self.write_transform_results(&mut data, results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown(result.version);
                    return Ok(());
                }
                let results = self.server_transform_results(&result.transform_results)?;
                let mut patched = document.data().clone();
                apply_patch(&mut patched, data, mask);
                self.write_transform_results(&mut patched, results);
                document
                    .convert_to_found(result.version, patched)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
        Ok(())
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, Value)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    /// Fails unless the server sent exactly one result per field transform.
    pub(crate) fn check_transform_results(&self, server_results: &[Value]) -> SyncResult<()> {
        if server_results.len() == self.field_transforms.len() {
            return Ok(());
        }
        Err(internal_error(format!(
            "Server returned {} transform results for {} transforms on {}",
            server_results.len(),
            self.field_transforms.len(),
            self.key
        )))
    }

    fn server_transform_results(&self, server_results: &[Value]) -> SyncResult<Vec<(FieldPath, Value)>> {
        self.check_transform_results(server_results)?;
        Ok(self
            .field_transforms
            .iter()
            .zip(server_results)
            .map(|(transform, value)| (transform.field_path().clone(), value.clone()))
            .collect())
    }

    fn write_transform_results(&self, data: &mut MapValue, results: Vec<(FieldPath, Value)>) {
        for (path, value) in results {
            data.set(&path, value);
        }
    }
}

fn post_mutation_version(document: &MutableDocument) -> SnapshotVersion {
    if document.is_found_document() {
        document.version()
    } else {
        SnapshotVersion::min()
    }
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match data.get(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn coerce_array(previous: Option<&Value>) -> ArrayValue {
    match previous.map(Value::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => ArrayValue::default(),
    }
}

fn numeric_increment(previous: Option<&Value>, operand: &Value) -> Value {
    let base = match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => Value::from_integer(0),
    };
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            Value::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            Value::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            Value::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => Value::from_double(current + delta),
        _ => operand.clone(),
    }
}
