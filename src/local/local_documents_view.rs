use std::collections::BTreeSet;

use crate::core::query::Query;
use crate::local::persistence::{LocalState, Transaction};
use crate::model::{
    calculate_overlay_mutation, DocumentKey, DocumentMap, FieldMask, MutableDocument, Timestamp,
    User, BATCH_ID_UNKNOWN,
};

/// Read-side merge of the remote document cache with a user's overlays.
pub struct LocalDocumentsView<'a> {
    state: &'a LocalState,
    user: &'a User,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(state: &'a LocalState, user: &'a User) -> Self {
        Self { state, user }
    }

    fn apply_overlay(&self, document: &mut MutableDocument) {
        if let Some(overlay) = self.state.overlays(self.user).get(document.key()) {
            overlay
                .mutation
                .apply_to_local_view(document, Some(FieldMask::empty()), Timestamp::now());
        }
    }

    /// The local view of `key`; invalid when neither cache nor overlay knows it.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut document = self.state.remote_documents().get(key);
        self.apply_overlay(&mut document);
        document
    }

    pub fn get_documents<'k>(&self, keys: impl IntoIterator<Item = &'k DocumentKey>) -> DocumentMap {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_document(key)))
            .collect()
    }

    /// Every document the local view says matches `query`.
    ///
    /// `candidates` narrows the remote documents considered (index lookups);
    /// keys with overlays are always considered.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        candidates: Option<&BTreeSet<DocumentKey>>,
    ) -> DocumentMap {
        if query.is_document_query() {
            let mut result = DocumentMap::new();
            if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
                let document = self.get_document(&key);
                if document.is_found_document() {
                    result.insert(key, document);
                }
            }
            return result;
        }
        if let Some(group) = query.collection_group_id() {
            let mut result = DocumentMap::new();
            for parent in self.state.index().get_collection_parents(group) {
                let collection = query.as_collection_query_at(parent.child([group]));
                result.extend(self.collection_documents(&collection, candidates));
            }
            return result;
        }
        self.collection_documents(query, candidates)
    }

    fn collection_documents(
        &self,
        query: &Query,
        candidates: Option<&BTreeSet<DocumentKey>>,
    ) -> DocumentMap {
        let remote = self.state.remote_documents();
        let mut documents = match candidates {
            Some(keys) => keys
                .iter()
                .filter(|key| query.matches_path(key))
                .map(|key| (key.clone(), remote.get(key)))
                .collect(),
            None => remote.documents_in_collection(query.path()),
        };
        for key in self
            .state
            .overlays(self.user)
            .keys_matching_query_path(query)
        {
            documents
                .entry(key.clone())
                .or_insert_with(|| remote.get(&key));
        }
        for document in documents.values_mut() {
            self.apply_overlay(document);
        }
        documents.retain(|_, document| query.matches(document));
        documents
    }
}

/// Recomputes and stores the overlay of each key by folding the queued
/// batches, oldest first, over the cached remote document.
pub(crate) fn recalculate_and_save_overlays(
    transaction: &mut Transaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) {
    for key in keys {
        let mut document = transaction.remote_documents().get(key);
        let mut mask = Some(FieldMask::empty());
        let mut largest_batch_id = BATCH_ID_UNKNOWN;
        for batch in transaction.mutation_queue().batches_affecting_key(key) {
            mask = batch.apply_to_local_view(&mut document, mask);
            largest_batch_id = batch.batch_id;
        }
        let overlay = if largest_batch_id == BATCH_ID_UNKNOWN {
            None
        } else {
            calculate_overlay_mutation(&document, mask.as_ref())
        };
        transaction.save_overlay(key, largest_batch_id, overlay);
    }
}
