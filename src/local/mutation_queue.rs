use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::query::Query;
use crate::model::{BatchId, DocumentKey, MutationBatch};

/// Unacknowledged batches for one user, in batch id order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationQueue {
    batches: BTreeMap<BatchId, MutationBatch>,
    batches_by_key: BTreeMap<DocumentKey, BTreeSet<BatchId>>,
    #[serde(default, with = "crate::util::base64_serde")]
    last_stream_token: Vec<u8>,
}

impl MutationQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub(crate) fn add_batch(&mut self, batch: MutationBatch) {
        for key in batch.keys() {
            self.batches_by_key
                .entry(key)
                .or_default()
                .insert(batch.batch_id);
        }
        self.batches.insert(batch.batch_id, batch);
    }

    pub(crate) fn remove_batch(&mut self, batch_id: BatchId) -> Option<MutationBatch> {
        let batch = self.batches.remove(&batch_id)?;
        for key in batch.keys() {
            if let Some(ids) = self.batches_by_key.get_mut(&key) {
                ids.remove(&batch_id);
                if ids.is_empty() {
                    self.batches_by_key.remove(&key);
                }
            }
        }
        Some(batch)
    }

    pub fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id strictly greater than `batch_id`.
    pub fn next_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn highest_batch_id(&self) -> Option<BatchId> {
        self.batches.keys().next_back().copied()
    }

    pub fn batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.values()
    }

    pub fn batches_affecting_key(&self, key: &DocumentKey) -> Vec<&MutationBatch> {
        self.batches_by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.batches.get(id))
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key.contains_key(key)
    }

    /// Keys written by any queued batch that could match `query`.
    pub fn keys_matching_query_path(&self, query: &Query) -> BTreeSet<DocumentKey> {
        self.batches_by_key
            .keys()
            .filter(|key| query.matches_path(key))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.batches_by_key.keys()
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub(crate) fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mutation, Timestamp};
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn batch(id: BatchId, paths: &[&str]) -> MutationBatch {
        MutationBatch::new(
            id,
            Timestamp::now(),
            paths
                .iter()
                .map(|path| Mutation::set(key(path), MapValue::empty()))
                .collect(),
        )
    }

    #[test]
    fn batches_are_indexed_by_key() {
        let mut queue = MutationQueue::default();
        queue.add_batch(batch(1, &["rooms/a"]));
        queue.add_batch(batch(2, &["rooms/a", "rooms/b"]));

        let affecting: Vec<_> = queue
            .batches_affecting_key(&key("rooms/a"))
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(affecting, vec![1, 2]);

        queue.remove_batch(2);
        assert!(!queue.contains_key(&key("rooms/b")));
        assert!(queue.contains_key(&key("rooms/a")));
    }

    #[test]
    fn next_batch_after_walks_in_order() {
        let mut queue = MutationQueue::default();
        queue.add_batch(batch(5, &["rooms/a"]));
        queue.add_batch(batch(9, &["rooms/b"]));
        assert_eq!(queue.next_batch_after(-1).unwrap().batch_id, 5);
        assert_eq!(queue.next_batch_after(5).unwrap().batch_id, 9);
        assert!(queue.next_batch_after(9).is_none());
        assert_eq!(queue.highest_batch_id(), Some(9));
    }

    #[test]
    fn stream_token_survives_json() {
        let mut queue = MutationQueue::default();
        queue.set_last_stream_token(vec![9, 8, 7]);
        let json = serde_json::to_string(&queue).unwrap();
        let decoded: MutationQueue = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.last_stream_token(), &[9, 8, 7]);
    }
}
