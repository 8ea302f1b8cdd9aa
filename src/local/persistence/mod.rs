//! Transactional ownership of every local store.
//!
//! [`LocalState`] holds the remote document cache, target cache, indexes and
//! the per-user mutation queues and overlays. Each part sits behind an `Arc`,
//! so staging a transaction is cheap and only the parts it writes to are
//! copied. [`Persistence`] runs each unit of work against the staged state,
//! collects garbage, hands the changed parts to a [`PersistenceBackend`] and
//! only then makes the staged state current.

mod file;
mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Serialize};

use crate::core::target::{ListenSequenceNumber, TargetId};
use crate::error::SyncResult;
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::index_manager::IndexManager;
use crate::local::mutation_queue::MutationQueue;
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, ResourcePath, SnapshotVersion,
    Timestamp, User,
};
use crate::settings::{
    FieldIndexSettings, GarbageCollectionPolicy, PersistenceSettings, SyncSettings,
};

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Durable storage for [`LocalState`].
pub trait PersistenceBackend: Send + 'static {
    /// Previously committed state, if any.
    fn load(&mut self) -> SyncResult<Option<LocalState>>;
    /// Stores `state`. Only the parts named in `changes` differ from the
    /// previous commit.
    fn commit(&mut self, state: &LocalState, changes: &StateChanges) -> SyncResult<()>;
    fn acquire_lease(&mut self) -> SyncResult<()>;
    fn release_lease(&mut self) -> SyncResult<()>;
    fn is_durable(&self) -> bool;
}

/// Mutation queue and overlays of a single user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub mutation_queue: MutationQueue,
    pub overlays: DocumentOverlayCache,
}

static EMPTY_USER_STATE: LazyLock<UserState> = LazyLock::new(UserState::default);

#[derive(Clone, Debug, PartialEq)]
pub struct LocalState {
    pub(crate) remote_documents: Arc<RemoteDocumentCache>,
    pub(crate) targets: Arc<TargetCache>,
    pub(crate) index: Arc<IndexManager>,
    pub(crate) users: BTreeMap<String, Arc<UserState>>,
    pub(crate) next_batch_id: BatchId,
}

impl Default for LocalState {
    fn default() -> Self {
        Self {
            remote_documents: Arc::default(),
            targets: Arc::default(),
            index: Arc::default(),
            users: BTreeMap::new(),
            next_batch_id: 1,
        }
    }
}

/// Parts of a [`LocalState`] written by one transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateChanges {
    pub remote_documents: bool,
    pub targets: bool,
    pub index: bool,
    /// Storage keys of the users whose queue or overlays changed.
    pub users: BTreeSet<String>,
    pub next_batch_id: bool,
}

impl StateChanges {
    /// Every part of `state`, for backends that have nothing stored yet.
    pub fn everything(state: &LocalState) -> Self {
        Self {
            remote_documents: true,
            targets: true,
            index: true,
            users: state.users.keys().cloned().collect(),
            next_batch_id: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.remote_documents
            && !self.targets
            && !self.index
            && self.users.is_empty()
            && !self.next_batch_id
    }
}

impl LocalState {
    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    pub fn targets(&self) -> &TargetCache {
        &self.targets
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn user_state(&self, user: &User) -> &UserState {
        self.users
            .get(&user.storage_key())
            .map(Arc::as_ref)
            .unwrap_or(&EMPTY_USER_STATE)
    }

    pub fn mutation_queue(&self, user: &User) -> &MutationQueue {
        &self.user_state(user).mutation_queue
    }

    pub fn overlays(&self, user: &User) -> &DocumentOverlayCache {
        &self.user_state(user).overlays
    }

    fn is_referenced(
        &self,
        key: &DocumentKey,
        policy: GarbageCollectionPolicy,
        references: &GcReferences<'_>,
    ) -> bool {
        if references.pinned.contains_key(key) {
            return true;
        }
        if self
            .users
            .values()
            .any(|user| user.mutation_queue.contains_key(key))
        {
            return true;
        }
        match policy {
            GarbageCollectionPolicy::Eager => self.targets.contains_key(key),
            GarbageCollectionPolicy::Bounded { .. } => self
                .targets
                .is_key_matched_by(key, references.active_targets.iter()),
        }
    }

    fn evict(&mut self, key: &DocumentKey, changes: &mut StateChanges) {
        if !self.remote_documents.contains(key) {
            return;
        }
        if let Some(document) = Arc::make_mut(&mut self.remote_documents).remove(key) {
            changes.remote_documents = true;
            if self.index.field_index_count() > 0 {
                Arc::make_mut(&mut self.index).on_document_removed(&document);
                changes.index = true;
            }
        }
    }

    fn collect_garbage(
        &mut self,
        policy: GarbageCollectionPolicy,
        orphan_candidates: &BTreeSet<DocumentKey>,
        references: &GcReferences<'_>,
        changes: &mut StateChanges,
    ) {
        match policy {
            GarbageCollectionPolicy::Eager => {
                let mut evicted = 0;
                for key in orphan_candidates {
                    if self.remote_documents.contains(key)
                        && !self.is_referenced(key, policy, references)
                    {
                        self.evict(key, changes);
                        evicted += 1;
                    }
                }
                if evicted > 0 {
                    log::debug!("eager gc evicted {evicted} documents");
                }
            }
            GarbageCollectionPolicy::Bounded { max_documents } => {
                let excess = self.remote_documents.len().saturating_sub(max_documents);
                if excess == 0 {
                    return;
                }
                let mut candidates: Vec<(SnapshotVersion, DocumentKey)> = self
                    .remote_documents
                    .documents()
                    .filter(|document| !self.is_referenced(document.key(), policy, references))
                    .map(|document| (document.read_time(), document.key().clone()))
                    .collect();
                candidates.sort();
                for (_, key) in candidates.iter().take(excess) {
                    self.evict(key, changes);
                    // Inactive targets that matched the key can no longer resume.
                    let stale: Vec<TargetId> = self
                        .targets
                        .targets()
                        .map(|data| data.target_id)
                        .filter(|id| !references.active_targets.contains(id))
                        .filter(|id| self.targets.get_matching_keys(*id).contains(key))
                        .collect();
                    if !stale.is_empty() {
                        let targets = Arc::make_mut(&mut self.targets);
                        for target_id in stale {
                            targets.remove_target(target_id);
                        }
                        changes.targets = true;
                    }
                }
                log::debug!(
                    "bounded gc evicted {} documents",
                    excess.min(candidates.len())
                );
            }
        }
    }
}

/// What the in-memory layers still hold on to when garbage is collected.
pub struct GcReferences<'a> {
    pub active_targets: BTreeSet<TargetId>,
    pub pinned: &'a ReferenceSet,
    /// Keys unpinned since the last transaction.
    pub released: &'a BTreeSet<DocumentKey>,
}

/// Mutable view of the staged state for one unit of work.
pub struct Transaction<'a> {
    state: &'a mut LocalState,
    user_key: String,
    orphan_candidates: BTreeSet<DocumentKey>,
    changes: StateChanges,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a mut LocalState, user: &User) -> Self {
        Self {
            state,
            user_key: user.storage_key(),
            orphan_candidates: BTreeSet::new(),
            changes: StateChanges::default(),
        }
    }

    pub fn state(&self) -> &LocalState {
        self.state
    }

    fn user_mut(&mut self) -> &mut UserState {
        self.changes.users.insert(self.user_key.clone());
        Arc::make_mut(self.state.users.entry(self.user_key.clone()).or_default())
    }

    fn remote_documents_mut(&mut self) -> &mut RemoteDocumentCache {
        self.changes.remote_documents = true;
        Arc::make_mut(&mut self.state.remote_documents)
    }

    fn index_mut(&mut self) -> &mut IndexManager {
        self.changes.index = true;
        Arc::make_mut(&mut self.state.index)
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        self.state
            .users
            .get(&self.user_key)
            .map(|user| &user.mutation_queue)
            .unwrap_or(&EMPTY_USER_STATE.mutation_queue)
    }

    pub fn overlays(&self) -> &DocumentOverlayCache {
        self.state
            .users
            .get(&self.user_key)
            .map(|user| &user.overlays)
            .unwrap_or(&EMPTY_USER_STATE.overlays)
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.state.remote_documents
    }

    pub fn targets(&self) -> &TargetCache {
        &self.state.targets
    }

    pub fn targets_mut(&mut self) -> &mut TargetCache {
        self.changes.targets = true;
        Arc::make_mut(&mut self.state.targets)
    }

    fn add_collection_parent(&mut self, collection_path: &ResourcePath) {
        if !self.state.index.has_collection_parent(collection_path) {
            self.index_mut()
                .add_to_collection_parent_index(collection_path);
        }
    }

    pub fn add_remote_document(&mut self, document: MutableDocument, read_time: SnapshotVersion) {
        let key = document.key().clone();
        self.add_collection_parent(&key.collection_path());
        let previous = self.remote_documents_mut().add(document, read_time);
        if self.state.index.field_index_count() > 0 {
            let current = self.state.remote_documents.get(&key);
            self.index_mut()
                .on_document_written(previous.as_ref(), &current);
        }
        self.orphan_candidates.insert(key);
    }

    pub fn remove_remote_document(&mut self, key: &DocumentKey) {
        self.state.evict(key, &mut self.changes);
    }

    pub fn add_matching_keys<'k>(
        &mut self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) {
        self.targets_mut().add_matching_keys(keys, target_id);
    }

    pub fn remove_matching_keys<'k>(
        &mut self,
        keys: impl IntoIterator<Item = &'k DocumentKey> + Clone,
        target_id: TargetId,
    ) {
        self.targets_mut()
            .remove_matching_keys(keys.clone(), target_id);
        self.orphan_candidates.extend(keys.into_iter().cloned());
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        let keys = self.targets_mut().remove_target(target_id);
        self.orphan_candidates.extend(keys);
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.targets_mut().next_sequence_number()
    }

    /// Queues a batch under the next global batch id.
    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.state.next_batch_id;
        self.state.next_batch_id += 1;
        self.changes.next_batch_id = true;
        for mutation in &mutations {
            self.add_collection_parent(&mutation.key().collection_path());
        }
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        self.user_mut().mutation_queue.add_batch(batch.clone());
        batch
    }

    pub fn remove_mutation_batch(&mut self, batch_id: BatchId) -> Option<MutationBatch> {
        let batch = self.user_mut().mutation_queue.remove_batch(batch_id)?;
        self.orphan_candidates.extend(batch.keys());
        Some(batch)
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.user_mut().mutation_queue.set_last_stream_token(token);
    }

    pub fn save_overlay(
        &mut self,
        key: &DocumentKey,
        largest_batch_id: BatchId,
        mutation: Option<Mutation>,
    ) {
        self.user_mut()
            .overlays
            .save(key, largest_batch_id, mutation);
    }

    pub fn remove_overlays_for_batch(&mut self, batch_id: BatchId) -> BTreeSet<DocumentKey> {
        self.user_mut().overlays.remove_for_batch(batch_id)
    }

    pub fn configure_field_indexes(&mut self, settings: &[FieldIndexSettings]) {
        self.changes.index = true;
        let state = &mut *self.state;
        Arc::make_mut(&mut state.index).configure(settings, state.remote_documents.documents());
    }
}

/// Owner of the committed [`LocalState`] and its backend.
pub struct Persistence {
    backend: Box<dyn PersistenceBackend>,
    state: LocalState,
    gc_policy: GarbageCollectionPolicy,
    started: bool,
}

impl Persistence {
    pub fn new(backend: Box<dyn PersistenceBackend>, gc_policy: GarbageCollectionPolicy) -> Self {
        Self {
            backend,
            state: LocalState::default(),
            gc_policy,
            started: false,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        let backend: Box<dyn PersistenceBackend> = match &settings.persistence {
            PersistenceSettings::Memory => Box::new(MemoryPersistence::new()),
            PersistenceSettings::File { directory } => Box::new(FilePersistence::new(
                directory.clone(),
                settings.owner_id.clone(),
                settings.lease_duration,
            )),
        };
        Self::new(backend, settings.gc_policy)
    }

    /// Takes the primary lease and loads any committed state.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.started {
            return Ok(());
        }
        self.backend.acquire_lease()?;
        if let Some(state) = self.backend.load()? {
            log::debug!(
                "loaded {} cached documents and {} targets",
                state.remote_documents.len(),
                state.targets.target_count()
            );
            self.state = state;
        }
        self.started = true;
        Ok(())
    }

    pub fn shutdown(&mut self) -> SyncResult<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.backend.release_lease()
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn gc_policy(&self) -> GarbageCollectionPolicy {
        self.gc_policy
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Runs `work` atomically. Garbage is collected after `work` and before
    /// the commit; nothing changes when either step fails. A transaction
    /// that wrote nothing is not committed.
    pub fn run_transaction<T, F>(
        &mut self,
        action: &str,
        user: &User,
        references: &GcReferences<'_>,
        work: F,
    ) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
    {
        let mut staged = self.state.clone();
        let (result, mut orphan_candidates, mut changes) = {
            let mut transaction = Transaction::new(&mut staged, user);
            let result = work(&mut transaction)?;
            (result, transaction.orphan_candidates, transaction.changes)
        };
        orphan_candidates.extend(references.released.iter().cloned());
        staged.collect_garbage(self.gc_policy, &orphan_candidates, references, &mut changes);
        if changes.is_empty() {
            return Ok(result);
        }
        if let Err(err) = self.backend.commit(&staged, &changes) {
            log::warn!("transaction '{action}' failed to commit: {err}");
            return Err(err);
        }
        self.state = staged;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::{Target, TargetData, TargetPurpose};
    use crate::error::internal_error;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found(
            key(path),
            SnapshotVersion::new(Timestamp::new(seconds, 0)),
            MapValue::empty(),
        )
    }

    fn no_refs() -> ReferenceSet {
        ReferenceSet::new()
    }

    /// Records the change sets it is asked to commit.
    #[derive(Default)]
    struct RecordingBackend {
        commits: Arc<std::sync::Mutex<Vec<StateChanges>>>,
    }

    impl PersistenceBackend for RecordingBackend {
        fn load(&mut self) -> SyncResult<Option<LocalState>> {
            Ok(None)
        }

        fn commit(&mut self, _state: &LocalState, changes: &StateChanges) -> SyncResult<()> {
            self.commits.lock().unwrap().push(changes.clone());
            Ok(())
        }

        fn acquire_lease(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn release_lease(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn is_durable(&self) -> bool {
            true
        }
    }

    #[test]
    fn only_written_parts_are_committed_and_copied() {
        let backend = RecordingBackend::default();
        let commits = Arc::clone(&backend.commits);
        let mut persistence =
            Persistence::new(Box::new(backend), GarbageCollectionPolicy::default());
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let user = User::authenticated("alice");

        persistence
            .run_transaction("seed", &user, &refs, |txn| {
                txn.add_remote_document(found("rooms/a", 1), SnapshotVersion::min());
                Ok(())
            })
            .unwrap();
        let count = persistence
            .run_transaction("read", &user, &refs, |txn| Ok(txn.remote_documents().len()))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(commits.lock().unwrap().len(), 1);

        let before = persistence.state().clone();
        persistence
            .run_transaction("write", &user, &refs, |txn| {
                txn.add_mutation_batch(
                    Timestamp::now(),
                    vec![Mutation::set(key("rooms/b"), MapValue::empty())],
                );
                Ok(())
            })
            .unwrap();
        let after = persistence.state();
        assert!(Arc::ptr_eq(&before.remote_documents, &after.remote_documents));
        assert!(Arc::ptr_eq(&before.targets, &after.targets));
        assert!(Arc::ptr_eq(&before.index, &after.index));

        let recorded = commits.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        let last = &recorded[1];
        assert!(!last.remote_documents);
        assert!(!last.targets);
        assert!(!last.index);
        assert!(last.next_batch_id);
        assert_eq!(last.users, BTreeSet::from([user.storage_key()]));
    }

    #[test]
    fn failed_work_leaves_state_untouched() {
        let mut persistence = Persistence::new(
            Box::new(MemoryPersistence::new()),
            GarbageCollectionPolicy::default(),
        );
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let result: SyncResult<()> =
            persistence.run_transaction("fail", &User::unauthenticated(), &refs, |txn| {
                txn.add_remote_document(found("rooms/a", 1), SnapshotVersion::min());
                Err(internal_error("abort"))
            });
        assert!(result.is_err());
        assert!(persistence.state().remote_documents().is_empty());
    }

    #[test]
    fn eager_gc_evicts_documents_no_target_references() {
        let mut persistence = Persistence::new(
            Box::new(MemoryPersistence::new()),
            GarbageCollectionPolicy::Eager,
        );
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::from([2]),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let user = User::unauthenticated();
        persistence
            .run_transaction("seed", &user, &refs, |txn| {
                txn.targets_mut().save_target(TargetData::new(
                    Target::for_document(&key("rooms/a")),
                    2,
                    TargetPurpose::Listen,
                    1,
                ));
                txn.add_matching_keys([&key("rooms/a")], 2);
                txn.add_remote_document(found("rooms/a", 1), SnapshotVersion::min());
                txn.add_remote_document(found("rooms/b", 1), SnapshotVersion::min());
                Ok(())
            })
            .unwrap();
        let docs = persistence.state().remote_documents();
        assert!(docs.contains(&key("rooms/a")));
        assert!(!docs.contains(&key("rooms/b")));

        persistence
            .run_transaction("release", &user, &refs, |txn| {
                txn.remove_target(2);
                Ok(())
            })
            .unwrap();
        assert!(persistence.state().remote_documents().is_empty());
    }

    #[test]
    fn pending_mutations_pin_documents() {
        let mut persistence = Persistence::new(
            Box::new(MemoryPersistence::new()),
            GarbageCollectionPolicy::Eager,
        );
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let user = User::unauthenticated();
        let batch = persistence
            .run_transaction("write", &user, &refs, |txn| {
                let batch = txn.add_mutation_batch(
                    Timestamp::now(),
                    vec![Mutation::set(key("rooms/a"), MapValue::empty())],
                );
                txn.add_remote_document(found("rooms/a", 1), SnapshotVersion::min());
                Ok(batch)
            })
            .unwrap();
        assert_eq!(batch.batch_id, 1);
        assert!(persistence.state().remote_documents().contains(&key("rooms/a")));

        persistence
            .run_transaction("ack", &user, &refs, |txn| {
                txn.remove_mutation_batch(batch.batch_id);
                Ok(())
            })
            .unwrap();
        assert!(persistence.state().remote_documents().is_empty());
    }

    #[test]
    fn bounded_gc_evicts_oldest_unreferenced_first() {
        let mut persistence = Persistence::new(
            Box::new(MemoryPersistence::new()),
            GarbageCollectionPolicy::Bounded { max_documents: 2 },
        );
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let user = User::unauthenticated();
        persistence
            .run_transaction("fill", &user, &refs, |txn| {
                for (index, path) in ["rooms/a", "rooms/b", "rooms/c"].iter().enumerate() {
                    txn.add_remote_document(
                        found(path, 1),
                        SnapshotVersion::new(Timestamp::new(index as i64 + 1, 0)),
                    );
                }
                Ok(())
            })
            .unwrap();
        let docs = persistence.state().remote_documents();
        assert_eq!(docs.len(), 2);
        assert!(!docs.contains(&key("rooms/a")));
    }

    #[test]
    fn batch_ids_increase_across_users() {
        let mut persistence = Persistence::new(
            Box::new(MemoryPersistence::new()),
            GarbageCollectionPolicy::default(),
        );
        let pinned = no_refs();
        let refs = GcReferences {
            active_targets: BTreeSet::new(),
            pinned: &pinned,
            released: &BTreeSet::new(),
        };
        let write = |persistence: &mut Persistence, user: &User| {
            persistence
                .run_transaction("write", user, &refs, |txn| {
                    Ok(txn
                        .add_mutation_batch(
                            Timestamp::now(),
                            vec![Mutation::delete(key("rooms/a"))],
                        )
                        .batch_id)
                })
                .unwrap()
        };
        let first = write(&mut persistence, &User::authenticated("alice"));
        let second = write(&mut persistence, &User::authenticated("bob"));
        assert!(second > first);
        assert_eq!(
            persistence
                .state()
                .mutation_queue(&User::authenticated("alice"))
                .len(),
            1
        );
    }
}
