//! Glue between the local store, the remote store and the query views.
//!
//! The sync engine is the state owned by the client task queue. It maps
//! queries to targets, routes remote events through the local store into
//! every affected view, resolves limbo documents and settles pending writes.
//! Remote store calls return notifications; they are queued and applied in
//! order before any public operation returns. A notification whose local
//! transaction hits lease contention stays at the head of the queue and is
//! retried later.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::core::event_manager::{EventManager, ListenOptions, ListenerId, ViewSnapshotSink};
use crate::core::query::Query;
use crate::core::target::{Target, TargetData, TargetId, TargetIdGenerator, TargetPurpose};
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{internal_error, is_primary_lease_lost, SyncError, SyncResult};
use crate::local::local_store::{LocalStore, LocalViewChanges};
use crate::local::reference_set::ReferenceSet;
use crate::model::{
    BatchId, DocumentKey, DocumentMap, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, User,
};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::persistent_stream::EventSink;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::remote_store::{
    RemoteStore, RemoteStoreEvent, RemoteStoreNotification, RemoteSyncer,
};
use crate::settings::SyncSettings;
use crate::util::backoff::ExponentialBackoff;

/// Resolves once the server accepted or rejected a batch.
pub type WriteAcknowledgement = oneshot::Receiver<SyncResult<()>>;

/// Asks the owner of the engine to call
/// [`SyncEngine::retry_notifications`] after the given delay.
pub type RetryScheduler = Arc<dyn Fn(Duration) + Send + Sync>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Default)]
struct QueryViews {
    by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
}

impl QueryViews {
    fn insert(&mut self, query_view: QueryView) {
        let canonical_id = query_view.query.canonical_id();
        self.queries_by_target
            .entry(query_view.target_id)
            .or_default()
            .push(canonical_id.clone());
        self.by_query.insert(canonical_id, query_view);
    }
}

struct LimboResolution {
    key: DocumentKey,
    /// The resolution target has delivered the document at least once.
    received_document: bool,
}

/// Limbo keys waiting for, or undergoing, resolution.
struct LimboTracker {
    max_concurrent: usize,
    target_ids: TargetIdGenerator,
    enqueued: VecDeque<DocumentKey>,
    targets_by_key: BTreeMap<DocumentKey, TargetId>,
    resolutions: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets consider a key to be in limbo.
    references: ReferenceSet,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            target_ids: TargetIdGenerator::for_sync_engine(),
            enqueued: VecDeque::new(),
            targets_by_key: BTreeMap::new(),
            resolutions: BTreeMap::new(),
            references: ReferenceSet::new(),
        }
    }
}

/// What the remote store sees of the engine.
struct SyncerView<'a> {
    local_store: &'a LocalStore,
    views: &'a QueryViews,
    limbo: &'a LimboTracker,
}

impl<'a> SyncerView<'a> {
    fn new(local_store: &'a LocalStore, views: &'a QueryViews, limbo: &'a LimboTracker) -> Self {
        Self {
            local_store,
            views,
            limbo,
        }
    }
}

impl RemoteSyncer for SyncerView<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.limbo.resolutions.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        let Some(queries) = self.views.queries_by_target.get(&target_id) else {
            return self.local_store.get_remote_document_keys(target_id);
        };
        queries
            .iter()
            .filter_map(|canonical_id| self.views.by_query.get(canonical_id))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect()
    }

    fn next_mutation_batch(&self, after: Option<BatchId>) -> Option<MutationBatch> {
        self.local_store.next_mutation_batch(after)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let keys_of = |change_type: ChangeType| {
        snapshot
            .changes
            .iter()
            .filter(|change| change.change_type == change_type)
            .map(|change| change.document.key().clone())
            .collect()
    };
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys: keys_of(ChangeType::Added),
        removed_keys: keys_of(ChangeType::Removed),
    }
}

pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    views: QueryViews,
    limbo: LimboTracker,
    /// Write callbacks per user, so a sign-out does not settle the previous
    /// user's batches.
    pending_writes: BTreeMap<User, BTreeMap<BatchId, oneshot::Sender<SyncResult<()>>>>,
    notifications: VecDeque<RemoteStoreNotification>,
    retry_scheduler: Option<RetryScheduler>,
    retry_backoff: ExponentialBackoff,
    retry_scheduled: bool,
    online_state: OnlineState,
}

impl SyncEngine {
    pub fn new(settings: &SyncSettings, local_store: LocalStore, remote_store: RemoteStore) -> Self {
        Self {
            local_store,
            remote_store,
            event_manager: EventManager::new(),
            views: QueryViews::default(),
            limbo: LimboTracker::new(settings.max_concurrent_limbo_resolutions),
            pending_writes: BTreeMap::new(),
            notifications: VecDeque::new(),
            retry_scheduler: None,
            retry_backoff: ExponentialBackoff::new(settings.backoff.clone()),
            retry_scheduled: false,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn set_retry_scheduler(&mut self, scheduler: RetryScheduler) {
        self.retry_scheduler = Some(scheduler);
    }

    /// Routes stream callbacks and timers back to the engine.
    pub fn set_event_sink(&mut self, sink: EventSink<RemoteStoreEvent>) {
        self.remote_store.set_event_sink(sink);
    }

    pub fn start(&mut self) -> SyncResult<()> {
        self.local_store.start()?;
        let out = self
            .remote_store
            .start(&SyncerView::new(&self.local_store, &self.views, &self.limbo));
        self.apply_notifications(out);
        Ok(())
    }

    pub fn shutdown(&mut self) -> SyncResult<()> {
        log::debug!("shutting down sync engine");
        self.remote_store.shutdown();
        // Dropping the senders cancels anyone still awaiting a write.
        self.pending_writes.clear();
        self.local_store.shutdown()
    }

    pub fn user(&self) -> &User {
        self.local_store.user()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    /// Keys currently being resolved, and keys waiting for a free slot.
    pub fn limbo_keys(&self) -> (BTreeSet<DocumentKey>, Vec<DocumentKey>) {
        (
            self.limbo.targets_by_key.keys().cloned().collect(),
            self.limbo.enqueued.iter().cloned().collect(),
        )
    }

    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.views.queries_by_target.keys().copied().collect()
    }

    // Listening

    /// Attaches a listener to `query`. The first listener of a query
    /// allocates its target and starts watching it.
    pub fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        sink: ViewSnapshotSink,
    ) -> SyncResult<ListenerId> {
        let initial = if self.event_manager.is_listening(&query.canonical_id()) {
            None
        } else {
            Some(self.listen_to_query(&query)?)
        };
        let id = self.event_manager.add_listener(query, options, sink, initial);
        self.drain_notifications();
        Ok(id)
    }

    /// Detaches a listener; the last one for a query releases its target.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> SyncResult<()> {
        if let Some(query) = self.event_manager.remove_listener(listener_id) {
            self.unlisten_from_query(&query)?;
        }
        self.drain_notifications();
        Ok(())
    }

    fn listen_to_query(&mut self, query: &Query) -> SyncResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let snapshot =
            self.initialize_view(query.clone(), target_id, target_data.resume_token.clone())?;
        let out = self.remote_store.listen(
            target_data,
            &SyncerView::new(&self.local_store, &self.views, &self.limbo),
        );
        self.notifications.extend(out);
        Ok(snapshot)
    }

    fn initialize_view(
        &mut self,
        query: Query,
        target_id: TargetId,
        resume_token: Vec<u8>,
    ) -> SyncResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query);
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(false, resume_token);
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized));
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        self.views.insert(QueryView {
            query,
            target_id,
            view,
        });
        view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view produced no snapshot"))
    }

    fn unlisten_from_query(&mut self, query: &Query) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self
            .views
            .by_query
            .get(&canonical_id)
            .map(|query_view| query_view.target_id)
        else {
            log::warn!("unlisten for unknown query {canonical_id}");
            return Ok(());
        };

        if let Some(queries) = self.views.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|id| id != &canonical_id);
                self.views.by_query.remove(&canonical_id);
                return Ok(());
            }
        }

        self.local_store.release_target(target_id, false)?;
        let out = self.remote_store.unlisten(target_id);
        self.notifications.extend(out);
        self.remove_and_cleanup_target(target_id, None);
        Ok(())
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<SyncError>) {
        for canonical_id in self.views.queries_by_target.remove(&target_id).unwrap_or_default() {
            let Some(query_view) = self.views.by_query.remove(&canonical_id) else {
                continue;
            };
            if let Some(error) = &error {
                self.event_manager
                    .on_listen_error(&query_view.query, error.clone());
            }
        }
        for key in self.limbo.references.remove_references_for_id(target_id) {
            if !self.limbo.references.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    // Reads

    /// The cached version of `key` with local writes applied.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        self.local_store.read_document(key)
    }

    /// Runs `query` against the cache only.
    pub fn get_documents(&mut self, query: &Query) -> SyncResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query);
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let mut snapshot = view
            .apply_changes(doc_changes, false, None)
            .snapshot
            .ok_or_else(|| internal_error("A cache read produced no snapshot"))?;
        snapshot.online_state = self.online_state;
        Ok(snapshot)
    }

    // Writes

    /// Applies `mutations` locally and queues them for the server.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> SyncResult<(BatchId, WriteAcknowledgement)> {
        let result = self.local_store.write_locally(mutations)?;
        let (sender, receiver) = oneshot::channel();
        self.pending_writes
            .entry(self.local_store.user().clone())
            .or_default()
            .insert(result.batch_id, sender);
        self.emit_new_snapshots(&result.changes, None);
        let out = self
            .remote_store
            .fill_write_pipeline(&SyncerView::new(&self.local_store, &self.views, &self.limbo));
        self.apply_notifications(out);
        Ok((result.batch_id, receiver))
    }

    fn settle_pending_write(&mut self, batch_id: BatchId, outcome: SyncResult<()>) {
        let user = self.local_store.user().clone();
        let Some(sender) = self
            .pending_writes
            .get_mut(&user)
            .and_then(|callbacks| callbacks.remove(&batch_id))
        else {
            return;
        };
        // The writer may have stopped waiting.
        let _ = sender.send(outcome);
    }

    // Network and users

    pub fn enable_network(&mut self) {
        let out = self
            .remote_store
            .enable_network(&SyncerView::new(&self.local_store, &self.views, &self.limbo));
        self.apply_notifications(out);
    }

    pub fn disable_network(&mut self) {
        let out = self.remote_store.disable_network();
        self.apply_notifications(out);
    }

    pub fn set_connectivity(&mut self, connected: bool) {
        let out = self.remote_store.set_connectivity(
            connected,
            &SyncerView::new(&self.local_store, &self.views, &self.limbo),
        );
        self.apply_notifications(out);
    }

    /// Switches to `user`'s mutation queue, recomputes every view and
    /// restarts the streams with the new credentials.
    pub fn handle_user_change(&mut self, user: User) {
        if &user == self.local_store.user() {
            return;
        }
        log::debug!("user changed from {} to {user}", self.local_store.user());
        let changes = self.local_store.handle_user_change(user);
        self.emit_new_snapshots(&changes, None);
        let out = self
            .remote_store
            .handle_credential_change(&SyncerView::new(&self.local_store, &self.views, &self.limbo));
        self.apply_notifications(out);
    }

    /// Applies a stream callback or timer delivered through the queue.
    pub fn handle_remote_store_event(&mut self, event: RemoteStoreEvent) {
        let out = self
            .remote_store
            .handle_event(event, &SyncerView::new(&self.local_store, &self.views, &self.limbo));
        self.apply_notifications(out);
    }

    // Notifications

    fn apply_notifications(&mut self, notifications: Vec<RemoteStoreNotification>) {
        self.notifications.extend(notifications);
        self.drain_notifications();
    }

    fn drain_notifications(&mut self) {
        while let Some(notification) = self.notifications.pop_front() {
            match self.apply_notification(&notification) {
                Ok(()) => self.retry_backoff.reset(),
                Err(error) if is_primary_lease_lost(&error) => {
                    log::warn!("holding back remote store notification: {error}");
                    self.notifications.push_front(notification);
                    self.schedule_notification_retry();
                    return;
                }
                Err(error) => {
                    log::warn!("failed to apply remote store notification: {error}");
                    self.abandon_notification(notification, error);
                }
            }
        }
    }

    /// Re-applies notifications held back by lease contention.
    pub fn retry_notifications(&mut self) {
        self.retry_scheduled = false;
        self.drain_notifications();
    }

    fn schedule_notification_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        let Some(scheduler) = self.retry_scheduler.clone() else {
            return;
        };
        self.retry_scheduled = true;
        scheduler(self.retry_backoff.next_delay());
    }

    fn apply_notification(&mut self, notification: &RemoteStoreNotification) -> SyncResult<()> {
        match notification {
            RemoteStoreNotification::RemoteEvent(event) => self.apply_remote_event(event),
            RemoteStoreNotification::ListenRejected { target_id, error } => {
                self.reject_listen(*target_id, error.clone())
            }
            RemoteStoreNotification::WriteAcknowledged(result) => {
                self.apply_successful_write(result)
            }
            RemoteStoreNotification::WriteRejected { batch_id, error } => {
                self.reject_failed_write(*batch_id, error.clone())
            }
            RemoteStoreNotification::OnlineStateChanged(state) => {
                self.apply_online_state_change(*state);
                Ok(())
            }
            RemoteStoreNotification::StreamTokenChanged(token) => {
                self.local_store.set_last_stream_token(token.clone())
            }
        }
    }

    /// Gives up on a notification that cannot be applied. Writers waiting on
    /// the batch learn about the failure; the batch is not sent again.
    fn abandon_notification(&mut self, notification: RemoteStoreNotification, error: SyncError) {
        let batch_id = match notification {
            RemoteStoreNotification::WriteAcknowledged(result) => result.batch.batch_id,
            RemoteStoreNotification::WriteRejected { batch_id, .. } => batch_id,
            _ => return,
        };
        self.settle_pending_write(batch_id, Err(error));
    }

    fn apply_remote_event(&mut self, event: &RemoteEvent) -> SyncResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.limbo.resolutions.get_mut(target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                log::warn!("limbo target {target_id} reported {touched} documents");
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }
        let changes = self.local_store.apply_remote_event(event)?;
        self.emit_new_snapshots(&changes, Some(event));
        Ok(())
    }

    fn reject_listen(&mut self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        if let Some(resolution) = self.limbo.resolutions.remove(&target_id) {
            // The document cannot be read, so treat it as deleted.
            log::debug!("limbo resolution for {} rejected: {error}", resolution.key);
            self.limbo.targets_by_key.remove(&resolution.key);
            self.pump_limbo_resolutions();
            self.notifications.push_front(RemoteStoreNotification::RemoteEvent(
                RemoteEvent::synthesized_delete(resolution.key),
            ));
            return Ok(());
        }
        log::warn!("listen to target {target_id} failed: {error}");
        self.local_store.release_target(target_id, false)?;
        self.remove_and_cleanup_target(target_id, Some(error));
        Ok(())
    }

    fn apply_successful_write(&mut self, result: &MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(result)?;
        self.remote_store.batch_settled(batch_id);
        self.settle_pending_write(batch_id, Ok(()));
        self.emit_new_snapshots(&changes, None);
        Ok(())
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.remote_store.batch_settled(batch_id);
        self.settle_pending_write(batch_id, Err(error));
        self.emit_new_snapshots(&changes, None);
        Ok(())
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let snapshots: Vec<ViewSnapshot> = self
            .views
            .by_query
            .values_mut()
            .filter_map(|query_view| query_view.view.apply_online_state(online_state).snapshot)
            .collect();
        self.event_manager.on_online_state_change(online_state);
        self.event_manager.on_view_snapshots(snapshots);
    }

    /// Pushes `changes` through every view, refilling limit queries from the
    /// cache, then raises the resulting snapshots.
    fn emit_new_snapshots(&mut self, changes: &DocumentMap, event: Option<&RemoteEvent>) {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_changes = Vec::new();

        for query_view in self.views.by_query.values_mut() {
            let target_change = event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let refill = self.local_store.execute_query(&query_view.query);
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&refill.documents, Some(doc_changes));
            }
            let view_change = query_view.view.apply_changes(doc_changes, true, target_change);
            limbo_changes.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, changes) in limbo_changes {
            self.update_tracked_limbos(target_id, changes);
        }
        self.event_manager.on_view_snapshots(snapshots);
        self.local_store.notify_local_view_changes(&view_changes);
    }

    // Limbo resolution

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo.references.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    self.limbo.references.remove_reference(&key, target_id);
                    if !self.limbo.references.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.limbo.targets_by_key.contains_key(&key) || self.limbo.enqueued.contains(&key) {
            return;
        }
        log::debug!("document {key} entered limbo");
        self.limbo.enqueued.push_back(key);
        self.pump_limbo_resolutions();
    }

    /// Starts resolutions for queued keys while slots are free.
    fn pump_limbo_resolutions(&mut self) {
        while self.limbo.targets_by_key.len() < self.limbo.max_concurrent {
            let Some(key) = self.limbo.enqueued.pop_front() else {
                break;
            };
            let target_id = self.limbo.target_ids.next();
            log::debug!("resolving limbo document {key} with target {target_id}");
            self.limbo.resolutions.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.limbo.targets_by_key.insert(key.clone(), target_id);
            let target_data = TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                0,
            );
            let out = self.remote_store.listen(
                target_data,
                &SyncerView::new(&self.local_store, &self.views, &self.limbo),
            );
            self.notifications.extend(out);
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.limbo.enqueued.retain(|queued| queued != key);
        let Some(target_id) = self.limbo.targets_by_key.remove(key) else {
            return;
        };
        self.limbo.resolutions.remove(&target_id);
        let out = self.remote_store.unlisten(target_id);
        self.notifications.extend(out);
        self.pump_limbo_resolutions();
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::{permission_denied, primary_lease_lost, SyncErrorCode};
    use crate::local::persistence::{
        LocalState, MemoryPersistence, Persistence, PersistenceBackend, StateChanges,
    };
    use crate::model::{DatabaseId, Timestamp};
    use crate::remote::credentials::{EmptyCredentialsProvider, StreamCredentialProvider};
    use crate::remote::datastore::{InMemoryDatastore, LoopbackBackend};
    use crate::settings::GarbageCollectionPolicy;
    use crate::value::{MapValue, Value};
    use async_channel::Receiver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    type Raised = Arc<Mutex<Vec<SyncResult<ViewSnapshot>>>>;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(x: i64) -> MapValue {
        MapValue::new([("x".to_string(), Value::from_integer(x))].into_iter().collect())
    }

    fn recorder() -> (Raised, ViewSnapshotSink) {
        let raised: Raised = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&raised);
        (raised, Arc::new(move |event| sink.lock().unwrap().push(event)))
    }

    struct Harness {
        engine: SyncEngine,
        events: Receiver<RemoteStoreEvent>,
    }

    fn harness_with(settings: SyncSettings, datastore: InMemoryDatastore) -> Harness {
        harness_with_backend(settings, datastore, Box::new(MemoryPersistence::new()))
    }

    fn harness_with_backend(
        settings: SyncSettings,
        datastore: InMemoryDatastore,
        backend: Box<dyn PersistenceBackend>,
    ) -> Harness {
        let local_store = LocalStore::with_persistence(
            Persistence::new(backend, GarbageCollectionPolicy::Eager),
            Vec::new(),
            User::unauthenticated(),
        );
        let remote_store = RemoteStore::new(
            &settings,
            Arc::new(datastore),
            StreamCredentialProvider::new(Arc::new(EmptyCredentialsProvider), None),
        );
        let mut engine = SyncEngine::new(&settings, local_store, remote_store);
        let (sender, events) = async_channel::unbounded();
        engine.set_event_sink(Arc::new(move |event| {
            let _ = sender.try_send(event);
        }));
        engine.start().unwrap();
        Harness { engine, events }
    }

    fn settings() -> SyncSettings {
        SyncSettings::new(DatabaseId::new("p", "(default)"))
    }

    impl Harness {
        /// Applies queued stream events until `done` holds.
        async fn run_until(&mut self, done: impl Fn(&SyncEngine) -> bool) {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, async {
                while !done(&self.engine) {
                    let event = self.events.recv().await.unwrap();
                    self.engine.handle_remote_store_event(event);
                }
            })
            .await
            .expect("condition not reached in time");
        }

        /// Applies whatever stream events arrive within `window`.
        async fn run_for(&mut self, window: Duration) {
            let _ = tokio::time::timeout(window, async {
                while let Ok(event) = self.events.recv().await {
                    self.engine.handle_remote_store_event(event);
                }
            })
            .await;
        }
    }

    /// Memory backend whose commits fail while another owner holds the lease.
    struct ContendedBackend {
        contended: Arc<AtomicBool>,
    }

    impl PersistenceBackend for ContendedBackend {
        fn load(&mut self) -> SyncResult<Option<LocalState>> {
            Ok(None)
        }

        fn commit(&mut self, _state: &LocalState, _changes: &StateChanges) -> SyncResult<()> {
            if self.contended.load(Ordering::SeqCst) {
                Err(primary_lease_lost())
            } else {
                Ok(())
            }
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

    #[tokio::test]
    async fn acknowledgements_survive_lease_contention() {
        let (datastore, backend) = LoopbackBackend::start(DatabaseId::new("p", "(default)"));
        let contended = Arc::new(AtomicBool::new(false));
        let mut harness = harness_with_backend(
            settings(),
            datastore,
            Box::new(ContendedBackend {
                contended: Arc::clone(&contended),
            }),
        );
        let delays = Arc::new(Mutex::new(Vec::new()));
        let scheduled = Arc::clone(&delays);
        harness
            .engine
            .set_retry_scheduler(Arc::new(move |delay| scheduled.lock().unwrap().push(delay)));

        let increment = Mutation::patch(
            key("counters/c"),
            MapValue::empty(),
            crate::model::FieldMask::empty(),
            crate::model::Precondition::None,
        )
        .with_transforms(vec![crate::model::FieldTransform::new(
            crate::model::FieldPath::from_dot_separated("x").unwrap(),
            crate::model::TransformOperation::NumericIncrement(Value::from_integer(1)),
        )]);
        let (batch_id, mut ack) = harness.engine.write(vec![increment]).unwrap();
        contended.store(true, Ordering::SeqCst);

        harness
            .run_until(|_| backend.commit_count() == 1 && !delays.lock().unwrap().is_empty())
            .await;
        harness.run_for(Duration::from_millis(200)).await;
        assert_eq!(ack.try_recv().unwrap(), None);
        assert_eq!(harness.engine.local_store().highest_unacknowledged_batch_id(), batch_id);
        assert_eq!(backend.commit_count(), 1);
        assert_eq!(delays.lock().unwrap().len(), 1);

        contended.store(false, Ordering::SeqCst);
        harness.engine.retry_notifications();
        assert_eq!(ack.try_recv().unwrap(), Some(Ok(())));
        assert_eq!(
            harness.engine.local_store().highest_unacknowledged_batch_id(),
            crate::model::BATCH_ID_UNKNOWN
        );
        harness.run_for(Duration::from_millis(100)).await;
        assert_eq!(backend.commit_count(), 1);
        let counter = backend.document(&key("counters/c")).unwrap();
        assert_eq!(
            counter
                .field(&crate::model::FieldPath::from_dot_separated("x").unwrap())
                .and_then(Value::as_integer),
            Some(1)
        );
    }

    #[tokio::test]
    async fn local_write_is_visible_before_and_after_ack() {
        let (datastore, backend) = LoopbackBackend::start(DatabaseId::new("p", "(default)"));
        let mut harness = harness_with(settings(), datastore);
        let (raised, sink) = recorder();
        harness
            .engine
            .listen(
                Query::collection("rooms").unwrap(),
                ListenOptions::default().with_metadata_changes(),
                sink,
            )
            .unwrap();

        let (_, mut ack) = harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        {
            let raised = raised.lock().unwrap();
            let last = raised.last().unwrap().as_ref().unwrap();
            assert!(last.has_pending_writes());
            assert_eq!(last.documents.len(), 1);
        }

        harness
            .run_until(|engine| {
                engine.local_store().highest_unacknowledged_batch_id()
                    == crate::model::BATCH_ID_UNKNOWN
            })
            .await;
        assert_eq!(ack.try_recv().unwrap(), Some(Ok(())));
        assert!(backend.document(&key("rooms/a")).is_some());

        harness
            .run_until(|engine| !engine.get_document(&key("rooms/a")).has_pending_writes())
            .await;
    }

    #[tokio::test]
    async fn limbo_resolutions_are_bounded_and_queued_in_order() {
        let (datastore, _server) = InMemoryDatastore::new();
        let mut harness = harness_with(settings().with_max_concurrent_limbo_resolutions(1), datastore);
        let (_, sink) = recorder();
        harness
            .engine
            .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), sink)
            .unwrap();
        let target_id = *harness.engine.active_target_ids().iter().next().unwrap();

        let paths = ["rooms/a", "rooms/b", "rooms/c"];
        let mut added = RemoteEvent {
            snapshot_version: version(1),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            resume_token: b"t1".to_vec(),
            current: true,
            ..TargetChange::default()
        };
        for path in paths {
            added.document_updates.insert(
                key(path),
                MutableDocument::new_found(key(path), version(1), data(1)),
            );
            change.added_documents.insert(key(path));
        }
        added.target_changes.insert(target_id, change);
        harness.engine.apply_remote_event(&added).unwrap();
        assert!(harness.engine.limbo_keys().0.is_empty());

        // The server drops every key from the target; the cache still has
        // them, so all three enter limbo.
        let mut removed = RemoteEvent {
            snapshot_version: version(2),
            ..RemoteEvent::default()
        };
        removed.target_changes.insert(
            target_id,
            TargetChange {
                resume_token: b"t2".to_vec(),
                current: true,
                removed_documents: paths.iter().map(|path| key(path)).collect(),
                ..TargetChange::default()
            },
        );
        harness.engine.apply_remote_event(&removed).unwrap();
        let (active, queued) = harness.engine.limbo_keys();
        assert_eq!(active, BTreeSet::from([key("rooms/a")]));
        assert_eq!(queued, vec![key("rooms/b"), key("rooms/c")]);

        // A rejected resolution counts as a delete and frees the slot.
        let active_target = harness.engine.limbo.targets_by_key[&key("rooms/a")];
        harness
            .engine
            .reject_listen(active_target, permission_denied("no"))
            .unwrap();
        let (active, queued) = harness.engine.limbo_keys();
        assert_eq!(active, BTreeSet::from([key("rooms/b")]));
        assert_eq!(queued, vec![key("rooms/c")]);
        assert!(!harness.engine.get_document(&key("rooms/a")).is_found_document());
    }

    #[tokio::test]
    async fn limbo_targets_use_odd_ids() {
        let (datastore, _server) = InMemoryDatastore::new();
        let mut harness = harness_with(settings(), datastore);
        harness.engine.track_limbo_change(key("rooms/x"));
        harness.engine.track_limbo_change(key("rooms/y"));
        let ids: Vec<TargetId> = harness.engine.limbo.resolutions.keys().copied().collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(ids.iter().all(|id| id % 2 == 1));
    }

    #[tokio::test]
    async fn rejected_query_listen_reaches_listeners() {
        let (datastore, _server) = InMemoryDatastore::new();
        let mut harness = harness_with(settings(), datastore);
        let (raised, sink) = recorder();
        harness
            .engine
            .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), sink)
            .unwrap();
        let target_id = *harness.engine.active_target_ids().iter().next().unwrap();
        harness
            .engine
            .reject_listen(target_id, permission_denied("rules"))
            .unwrap();
        let raised = raised.lock().unwrap();
        let error = raised.last().unwrap().as_ref().unwrap_err();
        assert_eq!(error.code, SyncErrorCode::PermissionDenied);
        assert!(harness.engine.active_target_ids().is_empty());
    }

    #[tokio::test]
    async fn rejected_write_reverts_the_local_view() {
        let (datastore, _server) = InMemoryDatastore::new();
        let mut harness = harness_with(settings(), datastore);
        let (batch_id, mut ack) = harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        assert!(harness.engine.get_document(&key("rooms/a")).is_found_document());

        harness
            .engine
            .reject_failed_write(batch_id, permission_denied("denied"))
            .unwrap();
        assert!(!harness.engine.get_document(&key("rooms/a")).is_found_document());
        let outcome = ack.try_recv().unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code, SyncErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn unlisten_of_last_listener_releases_the_target() {
        let (datastore, _server) = InMemoryDatastore::new();
        let mut harness = harness_with(settings(), datastore);
        let query = Query::collection("rooms").unwrap();
        let (_, first_sink) = recorder();
        let (_, second_sink) = recorder();
        let first = harness
            .engine
            .listen(query.clone(), ListenOptions::default(), first_sink)
            .unwrap();
        let second = harness
            .engine
            .listen(query, ListenOptions::default(), second_sink)
            .unwrap();
        assert_eq!(harness.engine.active_target_ids().len(), 1);

        harness.engine.unlisten(first).unwrap();
        assert_eq!(harness.engine.active_target_ids().len(), 1);
        harness.engine.unlisten(second).unwrap();
        assert!(harness.engine.active_target_ids().is_empty());
    }
}
