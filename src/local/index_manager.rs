use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::query::{FilterOperator, Query};
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::settings::FieldIndexSettings;
use crate::value::canonical_id;

/// Equality index over one field of one collection group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub collection_group: String,
    pub field: FieldPath,
    entries: BTreeMap<String, BTreeSet<DocumentKey>>,
}

impl FieldIndex {
    fn new(collection_group: String, field: FieldPath) -> Self {
        Self {
            collection_group,
            field,
            entries: BTreeMap::new(),
        }
    }

    fn applies_to(&self, key: &DocumentKey) -> bool {
        key.has_collection_id(&self.collection_group)
    }

    fn index_value(&self, document: &MutableDocument) -> Option<String> {
        if !document.is_found_document() || !self.applies_to(document.key()) {
            return None;
        }
        document.field(&self.field).map(canonical_id)
    }

    fn insert(&mut self, document: &MutableDocument) {
        if let Some(value_id) = self.index_value(document) {
            self.entries
                .entry(value_id)
                .or_default()
                .insert(document.key().clone());
        }
    }

    fn remove(&mut self, document: &MutableDocument) {
        if let Some(value_id) = self.index_value(document) {
            if let Some(keys) = self.entries.get_mut(&value_id) {
                keys.remove(document.key());
                if keys.is_empty() {
                    self.entries.remove(&value_id);
                }
            }
        }
    }
}

/// Collection-parent index plus the configured field indexes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    field_indexes: Vec<FieldIndex>,
}

impl IndexManager {
    /// Records the parent of `collection_path` under its collection id.
    pub(crate) fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    pub(crate) fn has_collection_parent(&self, collection_path: &ResourcePath) -> bool {
        let Some(collection_id) = collection_path.last_segment() else {
            return true;
        };
        self.collection_parents
            .get(collection_id)
            .is_some_and(|parents| parents.contains(&collection_path.without_last()))
    }

    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes the set of field indexes match `configured`, backfilling new
    /// ones from `documents`.
    pub(crate) fn configure<'a>(
        &mut self,
        configured: &[FieldIndexSettings],
        documents: impl Iterator<Item = &'a MutableDocument> + Clone,
    ) {
        self.field_indexes.retain(|index| {
            configured.iter().any(|settings| {
                settings.collection_group == index.collection_group && settings.field == index.field
            })
        });
        for settings in configured {
            let exists = self.field_indexes.iter().any(|index| {
                index.collection_group == settings.collection_group && index.field == settings.field
            });
            if exists {
                continue;
            }
            let mut index = FieldIndex::new(settings.collection_group.clone(), settings.field.clone());
            for document in documents.clone() {
                index.insert(document);
            }
            log::debug!(
                "created field index {}.{} with {} values",
                index.collection_group,
                index.field,
                index.entries.len()
            );
            self.field_indexes.push(index);
        }
    }

    pub(crate) fn on_document_written(
        &mut self,
        previous: Option<&MutableDocument>,
        current: &MutableDocument,
    ) {
        for index in &mut self.field_indexes {
            if let Some(previous) = previous {
                index.remove(previous);
            }
            index.insert(current);
        }
    }

    pub(crate) fn on_document_removed(&mut self, document: &MutableDocument) {
        for index in &mut self.field_indexes {
            index.remove(document);
        }
    }

    pub fn field_index_count(&self) -> usize {
        self.field_indexes.len()
    }

    /// Candidate keys for `query` from an equality index, or `None` when no
    /// configured index serves any of its filters.
    pub fn candidate_keys(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        let collection_group = match query.collection_group_id() {
            Some(group) => group.to_string(),
            None => query.path().last_segment()?.to_string(),
        };
        query
            .filters()
            .iter()
            .filter(|filter| filter.op() == FilterOperator::Equal)
            .find_map(|filter| {
                let index = self.field_indexes.iter().find(|index| {
                    index.collection_group == collection_group && &index.field == filter.field()
                })?;
                Some(
                    index
                        .entries
                        .get(&canonical_id(filter.value()))
                        .cloned()
                        .unwrap_or_default(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::value::{MapValue, Value};
    use std::collections::BTreeMap as Map;

    fn doc(path: &str, city: &str) -> MutableDocument {
        let mut fields = Map::new();
        fields.insert("city".to_string(), Value::from_string(city));
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::new(fields),
        )
    }

    fn city() -> FieldPath {
        FieldPath::from_dot_separated("city").unwrap()
    }

    #[test]
    fn collection_parents_are_recorded() {
        let mut index = IndexManager::default();
        index.add_to_collection_parent_index(&ResourcePath::from_string("rooms/a/messages").unwrap());
        index.add_to_collection_parent_index(&ResourcePath::from_string("messages").unwrap());
        let parents = index.get_collection_parents("messages");
        assert_eq!(parents.len(), 2);
    }

    #[test]
    fn equality_index_backfills_and_tracks_writes() {
        let mut index = IndexManager::default();
        let sf = doc("users/a", "SF");
        let docs = [sf.clone(), doc("users/b", "LA")];
        index.configure(&[FieldIndexSettings::new("users", city())], docs.iter());

        let query = Query::collection("users")
            .unwrap()
            .where_field("city", FilterOperator::Equal, Value::from_string("SF"))
            .unwrap();
        assert_eq!(index.candidate_keys(&query).unwrap().len(), 1);

        let moved = doc("users/a", "LA");
        index.on_document_written(Some(&sf), &moved);
        assert!(index.candidate_keys(&query).unwrap().is_empty());

        let unindexed = Query::collection("rooms").unwrap();
        assert!(index.candidate_keys(&unindexed).is_none());
    }
}
