use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::query::Query;
use crate::model::{BatchId, DocumentKey, Mutation, Overlay};

/// Current overlay per document for one user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn get(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    /// Replaces the overlay for `key`; `None` clears it.
    pub(crate) fn save(
        &mut self,
        key: &DocumentKey,
        largest_batch_id: BatchId,
        mutation: Option<Mutation>,
    ) {
        self.remove(key);
        if let Some(mutation) = mutation {
            self.keys_by_batch
                .entry(largest_batch_id)
                .or_default()
                .insert(key.clone());
            self.overlays
                .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        }
    }

    pub(crate) fn remove(&mut self, key: &DocumentKey) {
        if let Some(previous) = self.overlays.remove(key) {
            if let Some(keys) = self.keys_by_batch.get_mut(&previous.largest_batch_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch.remove(&previous.largest_batch_id);
                }
            }
        }
    }

    /// Drops every overlay last written by `batch_id`.
    pub(crate) fn remove_for_batch(&mut self, batch_id: BatchId) -> BTreeSet<DocumentKey> {
        let keys = self.keys_by_batch.remove(&batch_id).unwrap_or_default();
        for key in &keys {
            self.overlays.remove(key);
        }
        keys
    }

    /// Keys with an overlay whose path could match `query`.
    pub fn keys_matching_query_path(&self, query: &Query) -> BTreeSet<DocumentKey> {
        self.overlays
            .keys()
            .filter(|key| query.matches_path(key))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.overlays.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn saving_moves_overlay_between_batches() {
        let mut cache = DocumentOverlayCache::default();
        let k = key("rooms/a");
        cache.save(&k, 3, Some(Mutation::set(k.clone(), MapValue::empty())));
        cache.save(&k, 4, Some(Mutation::delete(k.clone())));

        assert!(cache.remove_for_batch(3).is_empty());
        assert_eq!(cache.get(&k).unwrap().largest_batch_id, 4);
        assert_eq!(cache.remove_for_batch(4).len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn saving_none_clears() {
        let mut cache = DocumentOverlayCache::default();
        let k = key("rooms/a");
        cache.save(&k, 1, Some(Mutation::delete(k.clone())));
        cache.save(&k, 1, None);
        assert!(cache.get(&k).is_none());
    }
}
