//! Entry point to everything the client keeps on disk or in memory.
//!
//! The local store owns the [`Persistence`] layer and the in-memory target
//! registry. Every mutating call runs as one transaction; garbage collection
//! sees the active targets and the keys pinned by views at that moment.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::core::target::{Target, TargetData, TargetId, TargetIdGenerator, TargetPurpose};
use crate::error::{internal_error, SyncResult};
use crate::local::local_documents_view::{recalculate_and_save_overlays, LocalDocumentsView};
use crate::local::persistence::{GcReferences, LocalState, Persistence, Transaction};
use crate::local::query_engine::{QueryEngine, QueryStrategy};
use crate::local::reference_set::ReferenceSet;
use crate::model::{
    BatchId, DocumentKey, DocumentMap, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp, User, BATCH_ID_UNKNOWN,
};
use crate::remote::remote_event::RemoteEvent;
use crate::settings::{FieldIndexSettings, GarbageCollectionPolicy, SyncSettings};

/// Result of queueing a batch locally.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Documents matching a query plus the keys the server last reported for it.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys that entered or left a view, reported back so the store can pin them.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

pub struct LocalStore {
    persistence: Persistence,
    user: User,
    field_indexes: Vec<FieldIndexSettings>,
    target_data_by_id: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
    /// Keys unpinned by views since the last transaction.
    pending_orphans: BTreeSet<DocumentKey>,
    target_ids: TargetIdGenerator,
    query_engine: QueryEngine,
    last_query_strategy: Option<QueryStrategy>,
}

impl LocalStore {
    pub fn new(settings: &SyncSettings, user: User) -> Self {
        Self::with_persistence(
            Persistence::from_settings(settings),
            settings.field_indexes.clone(),
            user,
        )
    }

    pub fn with_persistence(
        persistence: Persistence,
        field_indexes: Vec<FieldIndexSettings>,
        user: User,
    ) -> Self {
        Self {
            persistence,
            user,
            field_indexes,
            target_data_by_id: BTreeMap::new(),
            target_id_by_canonical: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
            pending_orphans: BTreeSet::new(),
            target_ids: TargetIdGenerator::for_target_cache(0),
            query_engine: QueryEngine,
            last_query_strategy: None,
        }
    }

    /// Loads persisted state and builds the configured field indexes.
    pub fn start(&mut self) -> SyncResult<()> {
        self.persistence.start()?;
        self.target_ids =
            TargetIdGenerator::for_target_cache(self.state().targets().highest_target_id());
        if !self.field_indexes.is_empty() {
            let indexes = self.field_indexes.clone();
            self.run("Configure field indexes", move |txn| {
                txn.configure_field_indexes(&indexes);
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> SyncResult<()> {
        self.persistence.shutdown()
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn state(&self) -> &LocalState {
        self.persistence.state()
    }

    pub fn gc_policy(&self) -> GarbageCollectionPolicy {
        self.persistence.gc_policy()
    }

    fn run<T>(
        &mut self,
        action: &str,
        work: impl FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let references = GcReferences {
            active_targets: self.target_data_by_id.keys().copied().collect(),
            pinned: &self.local_view_references,
            released: &self.pending_orphans,
        };
        let result = self
            .persistence
            .run_transaction(action, &self.user, &references, work);
        if result.is_ok() {
            self.pending_orphans.clear();
        }
        result
    }

    fn local_documents(&self, keys: &BTreeSet<DocumentKey>) -> DocumentMap {
        LocalDocumentsView::new(self.persistence.state(), &self.user).get_documents(keys)
    }

    /// Switches to `user`'s mutation queue. Returns the local view of every
    /// document either user had pending writes for.
    pub fn handle_user_change(&mut self, user: User) -> DocumentMap {
        let mut keys: BTreeSet<DocumentKey> =
            self.state().mutation_queue(&self.user).keys().cloned().collect();
        log::debug!("switching local store from '{}' to '{}'", self.user, user);
        self.user = user;
        keys.extend(self.state().mutation_queue(&self.user).keys().cloned());
        self.local_documents(&keys)
    }

    /// Queues `mutations` as one batch and updates the overlays of its keys.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();
        let overlay_keys = keys.clone();
        let batch = self.run("Locally write mutations", move |txn| {
            let batch = txn.add_mutation_batch(local_write_time, mutations);
            recalculate_and_save_overlays(txn, &overlay_keys);
            Ok(batch)
        })?;
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes: self.local_documents(&keys),
        })
    }

    /// Applies a server acknowledgement: the batch's committed results reach
    /// the remote document cache and the batch leaves the queue.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> SyncResult<DocumentMap> {
        let keys = result.batch.keys();
        let batch_id = result.batch.batch_id;
        self.run("Acknowledge batch", |txn| {
            for key in &keys {
                let mut document = txn.remote_documents().get(key);
                let ack_version = result
                    .doc_versions
                    .get(key)
                    .copied()
                    .unwrap_or(result.commit_version);
                if document.version() < ack_version {
                    result.batch.apply_to_remote_document(&mut document, result)?;
                    if document.is_valid_document() {
                        txn.add_remote_document(document, result.commit_version);
                    }
                }
            }
            if txn.remove_mutation_batch(batch_id).is_none() {
                return Err(internal_error(format!(
                    "Acknowledged batch {batch_id} is not in the queue"
                )));
            }
            txn.set_last_stream_token(result.stream_token.clone());
            txn.remove_overlays_for_batch(batch_id);
            recalculate_and_save_overlays(txn, &keys);
            Ok(())
        })?;
        Ok(self.local_documents(&keys))
    }

    /// Drops a batch the server refused. Cached documents are untouched.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> SyncResult<DocumentMap> {
        let keys = self
            .state()
            .mutation_queue(&self.user)
            .lookup(batch_id)
            .map(MutationBatch::keys)
            .ok_or_else(|| internal_error(format!("Rejected batch {batch_id} is not in the queue")))?;
        self.run("Reject batch", |txn| {
            txn.remove_mutation_batch(batch_id);
            txn.remove_overlays_for_batch(batch_id);
            recalculate_and_save_overlays(txn, &keys);
            Ok(())
        })?;
        Ok(self.local_documents(&keys))
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.state()
            .mutation_queue(&self.user)
            .last_stream_token()
            .to_vec()
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) -> SyncResult<()> {
        self.run("Set last stream token", move |txn| {
            txn.set_last_stream_token(token);
            Ok(())
        })
    }

    /// First queued batch after `after`, or the head of the queue.
    pub fn next_mutation_batch(&self, after: Option<BatchId>) -> Option<MutationBatch> {
        self.state()
            .mutation_queue(&self.user)
            .next_batch_after(after.unwrap_or(BATCH_ID_UNKNOWN))
            .cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.state()
            .mutation_queue(&self.user)
            .highest_batch_id()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.state()
            .mutation_queue(&self.user)
            .lookup(batch_id)
            .cloned()
    }

    /// Writes a watch snapshot into the cache. Returns the local view of every
    /// document whose cached state changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> SyncResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let last_remote_version = self.state().targets().last_remote_snapshot_version();
        let mut target_data = self.target_data_by_id.clone();

        let changed = self.run("Apply remote event", |txn| {
            for (target_id, change) in &event.target_changes {
                let Some(old) = target_data.get(target_id).cloned() else {
                    // Limbo resolutions are not tracked by the store.
                    continue;
                };
                txn.remove_matching_keys(change.removed_documents.iter(), *target_id);
                txn.add_matching_keys(change.added_documents.iter(), *target_id);

                let sequence_number = txn.next_sequence_number();
                let mut updated = old.clone().with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    updated = updated
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    if remote_version < old.snapshot_version {
                        log::warn!(
                            "ignoring resume token for target {target_id}: version went backwards"
                        );
                    } else {
                        updated =
                            updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                }
                txn.targets_mut().save_target(updated.clone());
                target_data.insert(*target_id, updated);
            }

            let mut changed = BTreeSet::new();
            for (key, document) in &event.document_updates {
                let existing = txn.remote_documents().get(key);
                if document.is_no_document() && document.version().is_min() {
                    // Synthesized deletes carry no version; drop the entry.
                    txn.remove_remote_document(key);
                    changed.insert(key.clone());
                } else if !existing.is_valid_document()
                    || document.version() > existing.version()
                    || (document.version() == existing.version() && existing.has_pending_writes())
                {
                    let read_time = if document.read_time().is_min() {
                        remote_version
                    } else {
                        document.read_time()
                    };
                    txn.add_remote_document(document.clone(), read_time);
                    changed.insert(key.clone());
                } else {
                    log::debug!(
                        "ignoring outdated watch update for {}: cached {:?}, update {:?}",
                        key.path().canonical_string(),
                        existing.version(),
                        document.version()
                    );
                }
            }

            let with_mutations: BTreeSet<DocumentKey> = changed
                .iter()
                .filter(|key| txn.mutation_queue().contains_key(key))
                .cloned()
                .collect();
            recalculate_and_save_overlays(txn, &with_mutations);

            if !remote_version.is_min() {
                if remote_version < last_remote_version {
                    log::warn!("ignoring global snapshot version that moved backwards");
                } else {
                    txn.targets_mut()
                        .set_last_remote_snapshot_version(remote_version);
                }
            }
            Ok(changed)
        })?;

        self.target_data_by_id = target_data;
        Ok(self.local_documents(&changed))
    }

    /// Pins keys that entered views and releases those that left.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) {
        for change in changes {
            self.local_view_references
                .add_references(change.added_keys.iter(), change.target_id);
            self.local_view_references
                .remove_references(change.removed_keys.iter(), change.target_id);
            for key in &change.removed_keys {
                if !self.local_view_references.contains_key(key) {
                    self.pending_orphans.insert(key.clone());
                }
            }
            if !change.from_cache {
                if let Some(data) = self.target_data_by_id.get_mut(&change.target_id) {
                    data.last_limbo_free_snapshot_version = data.snapshot_version;
                }
            }
        }
    }

    /// Assigns a target id to `target`, reusing a cached allocation when the
    /// same target was listened to before.
    pub fn allocate_target(&mut self, target: Target) -> SyncResult<TargetData> {
        let canonical_id = target.canonical_id();
        if let Some(data) = self
            .target_id_by_canonical
            .get(&canonical_id)
            .and_then(|id| self.target_data_by_id.get(id))
        {
            return Ok(data.clone());
        }

        let cached = self.state().targets().get_target(&target).cloned();
        let target_id = match &cached {
            Some(data) => data.target_id,
            None => self.target_ids.next(),
        };
        let data = self.run("Allocate target", move |txn| {
            let sequence_number = txn.next_sequence_number();
            let data = match cached {
                Some(data) => data.with_sequence_number(sequence_number),
                None => TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number),
            };
            txn.targets_mut().save_target(data.clone());
            Ok(data)
        })?;
        log::debug!("allocated target {} for {canonical_id}", data.target_id);
        self.target_data_by_id.insert(data.target_id, data.clone());
        self.target_id_by_canonical.insert(canonical_id, data.target_id);
        Ok(data)
    }

    /// Stops tracking a target. Under eager collection its cached data is
    /// dropped unless `keep_persisted` is set.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted: bool) -> SyncResult<()> {
        let Some(data) = self.target_data_by_id.remove(&target_id) else {
            log::warn!("release of unknown target {target_id}");
            return Ok(());
        };
        self.target_id_by_canonical
            .remove(&data.target.canonical_id());
        for key in self.local_view_references.remove_references_for_id(target_id) {
            if !self.local_view_references.contains_key(&key) {
                self.pending_orphans.insert(key);
            }
        }
        let remove = !keep_persisted && self.gc_policy() == GarbageCollectionPolicy::Eager;
        self.run("Release target", move |txn| {
            if remove {
                txn.remove_target(target_id);
            } else {
                txn.targets_mut().save_target(data);
            }
            Ok(())
        })
    }

    /// Runs `query` against the cache.
    pub fn execute_query(&mut self, query: &Query) -> QueryResult {
        let state = self.persistence.state();
        let remote_keys = state
            .targets()
            .get_target(&query.to_target())
            .map(|data| state.targets().get_matching_keys(data.target_id))
            .unwrap_or_default();
        let (documents, strategy) =
            self.query_engine
                .get_documents_matching_query(state, &self.user, query);
        self.last_query_strategy = Some(strategy);
        QueryResult {
            documents,
            remote_keys,
        }
    }

    pub fn last_query_strategy(&self) -> Option<QueryStrategy> {
        self.last_query_strategy
    }

    pub fn read_document(&self, key: &DocumentKey) -> MutableDocument {
        LocalDocumentsView::new(self.persistence.state(), &self.user).get_document(key)
    }

    /// Data of an active target.
    pub fn get_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_id.get(&target_id)
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.state().targets().last_remote_snapshot_version()
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.state().targets().get_matching_keys(target_id)
    }
}
