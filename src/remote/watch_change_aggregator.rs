use std::collections::{BTreeMap, BTreeSet};

use crate::core::target::{TargetData, TargetId, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, DocumentMap, MutableDocument, SnapshotVersion};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Data of an active listen or limbo target.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Record of the most recent existence filter disagreement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistenceFilterMismatch {
    pub target_id: TargetId,
    pub local_count: usize,
    pub expected_count: i32,
    /// Whether a bloom filter was usable for this mismatch.
    pub bloom_filter_applied: bool,
    /// `None` when the bloom filter reconciled the counts.
    pub requery_purpose: Option<TargetPurpose>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

struct TargetState {
    /// Outstanding add/remove requests; changes are ignored until zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes into coherent [`RemoteEvent`]s.
///
/// Nothing leaves the aggregator until [`create_remote_event`] is called at a
/// consistent snapshot boundary.
///
/// [`create_remote_event`]: WatchChangeAggregator::create_remote_event
#[derive(Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
    last_mismatch: Option<ExistenceFilterMismatch>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_mismatch(&self) -> Option<&ExistenceFilterMismatch> {
        self.last_mismatch.as_ref()
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    /// Called for every add or remove request sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    fn target_contains_document(
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if Self::target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contains = Self::target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contains {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata)
                }
                other => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    other.clone(),
                    metadata,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &change.key,
                change.document.clone(),
                metadata,
            );
        }
    }

    pub fn handle_document_delete(
        &mut self,
        delete: DocumentDelete,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let version = delete.read_time.unwrap_or_else(SnapshotVersion::min);
        let tombstone = MutableDocument::new_no_document(delete.key.clone(), version);
        for target_id in &delete.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &delete.key,
                Some(tombstone.clone()),
                metadata,
            );
        }
    }

    pub fn handle_document_remove(
        &mut self,
        remove: DocumentRemove,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &remove.removed_target_ids {
            self.remove_document_from_target(*target_id, &remove.key, None, metadata);
        }
    }

    fn target_ids_for_change(
        &self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|id| self.is_active_target(*id, metadata))
            .collect()
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.target_ids_for_change(change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A fresh add starts from an empty result set.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Forgets accumulated changes and marks every cached key as removed;
    /// the server resends whatever still matches.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let existing = metadata.get_remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return existing;
        };
        let added = state
            .document_changes
            .values()
            .filter(|change| **change == ChangeType::Added)
            .count();
        let removed = state
            .document_changes
            .values()
            .filter(|change| **change == ChangeType::Removed)
            .count();
        (existing + added).saturating_sub(removed)
    }

    pub fn handle_existence_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document is gone; no requery needed.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                }
            } else if expected_count != 1 {
                log::warn!(
                    "single document target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let local_count = self.current_document_count_for_target(target_id, metadata);
        if local_count as i64 == expected_count as i64 {
            return;
        }

        let application = self.apply_bloom_filter(filter, local_count, metadata);
        let requery_purpose = match application {
            BloomFilterApplication::Success => None,
            BloomFilterApplication::Skipped => Some(TargetPurpose::ExistenceFilterMismatch),
            BloomFilterApplication::FalsePositive => {
                Some(TargetPurpose::ExistenceFilterMismatchBloom)
            }
        };
        if let Some(purpose) = requery_purpose {
            log::debug!(
                "existence filter mismatch on target {target_id}: {local_count} cached, {expected_count} expected"
            );
            self.reset_target(target_id, metadata);
            self.pending_target_resets.insert(target_id, purpose);
        }
        self.last_mismatch = Some(ExistenceFilterMismatch {
            target_id,
            local_count,
            expected_count,
            bloom_filter_applied: application != BloomFilterApplication::Skipped,
            requery_purpose,
        });
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        local_count: usize,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let Some(payload) = &filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom = match BloomFilter::new(
            payload.bitmap.clone(),
            payload.padding,
            payload.hash_count,
        ) {
            Ok(bloom) => bloom,
            Err(err) => {
                log::warn!("ignoring unusable bloom filter: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom, filter.target_id, metadata);
        if filter.count as i64 == local_count as i64 - removed as i64 {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached key the filter says is definitely gone.
    fn filter_removed_documents(
        &mut self,
        bloom: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let database = metadata.database_id().clone();
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            if !bloom.might_contain(&database.document_name(&key)) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Drains everything accumulated so far into one event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target that never saw its document
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !Self::target_contains_document(target_id, &key, metadata)
                    {
                        let tombstone =
                            MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(
                            target_id,
                            &key,
                            Some(tombstone),
                            metadata,
                        );
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::core::target::Target;
    use crate::model::Timestamp;
    use crate::remote::watch_change::BloomFilterPayload;
    use crate::value::MapValue;

    struct TestMetadata {
        database: DatabaseId,
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn new() -> Self {
            Self {
                database: DatabaseId::default_for("test-project"),
                targets: BTreeMap::new(),
                remote_keys: BTreeMap::new(),
            }
        }

        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection("rooms").unwrap().to_target();
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::Listen, 1),
            );
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            let target = Target::for_document(&key(path));
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }

        fn database_id(&self) -> &DatabaseId {
            &self.database
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found(key(path), version(seconds), MapValue::empty())
    }

    fn change(updated: Vec<TargetId>, path: &str, seconds: i64) -> DocumentChange {
        DocumentChange {
            updated_target_ids: updated,
            removed_target_ids: Vec::new(),
            key: key(path),
            document: Some(doc(path, seconds)),
        }
    }

    #[test]
    fn aggregates_document_changes_per_target() {
        let metadata = TestMetadata::new().with_query_target(2, &["rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(change(vec![2], "rooms/a", 1), &metadata);
        aggregator.handle_document_change(change(vec![2], "rooms/b", 1), &metadata);
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Current, vec![2])
                .with_resume_token(vec![9]),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(1), &metadata);
        let target = &event.target_changes[&2];
        assert!(target.current);
        assert_eq!(target.resume_token, vec![9]);
        assert!(target.added_documents.contains(&key("rooms/a")));
        assert!(target.modified_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(1));
    }

    #[test]
    fn add_then_remove_in_one_batch_cancels_out() {
        let metadata = TestMetadata::new().with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(change(vec![2], "rooms/a", 1), &metadata);
        aggregator.handle_document_remove(
            DocumentRemove {
                key: key("rooms/a"),
                read_time: None,
                removed_target_ids: vec![2],
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(1), &metadata);
        assert!(!event.target_changes[&2].has_document_changes());
    }

    #[test]
    fn pending_targets_ignore_changes_until_acknowledged() {
        let metadata = TestMetadata::new().with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(change(vec![2], "rooms/a", 1), &metadata);
        assert!(aggregator
            .create_remote_event(version(1), &metadata)
            .document_updates
            .is_empty());

        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Add, vec![2]),
            &metadata,
        );
        aggregator.handle_document_change(change(vec![2], "rooms/a", 2), &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_changes[&2]
            .added_documents
            .contains(&key("rooms/a")));
    }

    #[test]
    fn mismatch_without_bloom_filter_requests_requery() {
        let metadata =
            TestMetadata::new().with_query_target(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: None,
            },
            &metadata,
        );
        let mismatch = aggregator.last_mismatch().unwrap().clone();
        assert_eq!(mismatch.local_count, 3);
        assert!(!mismatch.bloom_filter_applied);

        let event = aggregator.create_remote_event(version(3), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 3);
    }

    #[test]
    fn bloom_filter_removes_absent_documents_without_requery() {
        let metadata =
            TestMetadata::new().with_query_target(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut bloom = BloomFilter::with_bit_count(512, 8);
        for path in ["rooms/a", "rooms/b"] {
            bloom.insert(&metadata.database.document_name(&key(path)));
        }
        assert!(!bloom.might_contain(&metadata.database.document_name(&key("rooms/c"))));
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                count: 2,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: bloom.bitmap().to_vec(),
                    padding: bloom.padding() as i32,
                    hash_count: bloom.hash_count() as i32,
                }),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(3), &metadata);
        let removed = &event.target_changes[&2].removed_documents;
        assert!(!removed.contains(&key("rooms/a")));
        assert!(!removed.contains(&key("rooms/b")));
        assert!(removed.contains(&key("rooms/c")));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(aggregator.last_mismatch().unwrap().requery_purpose, None);
    }

    #[test]
    fn undecodable_bloom_filter_falls_back_to_requery() {
        let metadata = TestMetadata::new().with_query_target(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: vec![0xff],
                    padding: 9,
                    hash_count: 1,
                }),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(3), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    #[test]
    fn single_document_filter_with_zero_count_synthesizes_delete() {
        let metadata = TestMetadata::new().with_limbo_target(3, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 3,
                count: 0,
                unchanged_names: None,
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(4), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn current_document_target_without_document_reports_deletion() {
        let metadata = TestMetadata::new().with_limbo_target(3, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Current, vec![3]),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(5), &metadata);
        let document = &event.document_updates[&key("rooms/a")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(5));
    }

    #[test]
    fn reset_marks_cached_documents_removed() {
        let metadata = TestMetadata::new().with_query_target(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Reset, vec![2]),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_changes[&2]
            .removed_documents
            .contains(&key("rooms/a")));
    }
}
