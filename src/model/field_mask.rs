use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }

    /// True when `path` equals or is nested below one of the mask entries.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }
}
