use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, DocumentMap, MutableDocument, ResourcePath, SnapshotVersion};

/// Last known server state of every cached document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocumentCache {
    documents: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentCache {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    /// Stores `document` stamped with `read_time`. Returns the previous entry.
    pub(crate) fn add(
        &mut self,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> Option<MutableDocument> {
        document.set_read_time(read_time);
        self.documents.insert(document.key().clone(), document)
    }

    pub(crate) fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        self.documents.remove(key)
    }

    /// The cached entry, or an invalid document when nothing is cached.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn get_all<'a>(&self, keys: impl IntoIterator<Item = &'a DocumentKey>) -> DocumentMap {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents stored directly under `collection`.
    pub fn documents_in_collection(&self, collection: &ResourcePath) -> DocumentMap {
        self.documents
            .iter()
            .filter(|(key, _)| {
                key.path().len() == collection.len() + 1 && collection.is_prefix_of(key.path())
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }

    pub fn documents(&self) -> impl Iterator<Item = &MutableDocument> + Clone {
        self.documents.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn missing_entries_are_invalid_documents() {
        let cache = RemoteDocumentCache::default();
        let doc = cache.get(&key("rooms/a"));
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn collection_scan_skips_nested_documents() {
        let mut cache = RemoteDocumentCache::default();
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        for path in ["rooms/a", "rooms/b", "rooms/a/messages/1", "users/x"] {
            cache.add(
                MutableDocument::new_found(key(path), version, MapValue::empty()),
                version,
            );
        }
        let rooms = cache.documents_in_collection(&ResourcePath::from_string("rooms").unwrap());
        assert_eq!(rooms.len(), 2);
        assert_eq!(cache.get(&key("rooms/a")).read_time(), version);
    }
}
