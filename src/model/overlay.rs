use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{BatchId, DocumentKey, FieldMask, FieldPath, Mutation, MutableDocument, Precondition};
use crate::value::MapValue;

/// The squashed effect of every pending mutation on one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// Builds the single mutation that turns the remote document into `document`.
///
/// `mask` is the accumulated mask from folding the queued batches; `None`
/// means the local view replaced the whole document.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = MapValue::empty();
    let mut written: BTreeSet<FieldPath> = BTreeSet::new();
    for path in mask.fields() {
        if written.iter().any(|done| done.is_prefix_of(path)) {
            continue;
        }
        let mut target = path.clone();
        let mut value = document.field(&target).cloned();
        // Nested entries under a missing parent collapse to the parent.
        if value.is_none() {
            if let Some(parent) = target.parent() {
                value = document.field(&parent).cloned();
                if value.is_some() {
                    target = parent;
                }
            }
        }
        if let Some(value) = value {
            patch.set(&target, value);
        }
        written.insert(target);
    }
    Some(Mutation::patch(
        document.key().clone(),
        patch,
        FieldMask::new(written),
        Precondition::None,
    ))
}
