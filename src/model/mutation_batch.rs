use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, SyncResult};
use crate::model::{
    DocumentKey, FieldMask, Mutation, MutableDocument, MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Marker for "no batch", used when asking for the first batch in the queue.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations committed atomically, in the order they were written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation for the document's key, threading the field mask through.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the acknowledged results of this batch to the remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> SyncResult<()> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            let result = batch_result.mutation_results.get(index).ok_or_else(|| {
                internal_error(format!(
                    "batch {} acknowledged with {} results for {} mutations",
                    self.batch_id,
                    batch_result.mutation_results.len(),
                    self.mutations.len()
                ))
            })?;
            mutation.apply_to_remote_document(document, result)?;
        }
        Ok(())
    }
}

/// Server acknowledgement of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each document was written at, keyed by document.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> SyncResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        for (mutation, result) in batch.mutations.iter().zip(&mutation_results) {
            mutation.check_transform_results(&result.transform_results)?;
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MapValue, Value};
    use std::collections::BTreeMap as Map;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(x: i64) -> MapValue {
        let mut fields = Map::new();
        fields.insert("x".to_string(), Value::from_integer(x));
        MapValue::new(fields)
    }

    #[test]
    fn result_length_must_match_mutations() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![Mutation::set(key("a/1"), data(1)), Mutation::delete(key("a/2"))],
        );
        let err = MutationBatchResult::new(batch, SnapshotVersion::min(), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "docsync/internal");
    }

    #[test]
    fn local_view_only_touches_matching_key() {
        let batch = MutationBatch::new(
            7,
            Timestamp::now(),
            vec![Mutation::set(key("a/1"), data(1)), Mutation::set(key("a/2"), data(2))],
        );
        let mut doc = MutableDocument::new_invalid(key("a/2"));
        batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert_eq!(doc.data(), &data(2));
        assert_eq!(batch.keys().len(), 2);
    }
}
