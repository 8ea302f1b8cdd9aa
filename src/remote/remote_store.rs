use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::core::target::{TargetData, TargetId};
use crate::error::{internal_error, SyncError, SyncResult};
use crate::model::{
    BatchId, DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion,
};
use crate::remote::credentials::StreamCredentialProvider;
use crate::remote::datastore::{StreamKind, StreamingDatastore};
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::persistent_stream::{CloseOutcome, EventSink, PersistentStream, StreamEvent};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::settings::SyncSettings;

/// What the remote store reads from the layers above it.
pub trait RemoteSyncer {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First queued batch after `after`.
    fn next_mutation_batch(&self, after: Option<BatchId>) -> Option<MutationBatch>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}

/// Callbacks and timers delivered back onto the task queue.
pub enum RemoteStoreEvent {
    Stream(StreamEvent),
    OnlineStateTimeout(u64),
}

/// Outcomes the sync engine applies after each remote store call.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteStoreNotification {
    RemoteEvent(RemoteEvent),
    ListenRejected { target_id: TargetId, error: SyncError },
    WriteAcknowledged(MutationBatchResult),
    WriteRejected { batch_id: BatchId, error: SyncError },
    OnlineStateChanged(OnlineState),
    StreamTokenChanged(Vec<u8>),
}

/// Reasons the remote store keeps the network off. Any one suffices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    ConnectivityChange,
    CredentialChange,
    Shutdown,
}

struct TargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for TargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

type Notifications = Vec<RemoteStoreNotification>;

fn push_online(out: &mut Notifications, changed: Option<OnlineState>) {
    if let Some(state) = changed {
        out.push(RemoteStoreNotification::OnlineStateChanged(state));
    }
}

fn decode_frame(payload: &[u8]) -> SyncResult<JsonValue> {
    serde_json::from_slice(payload)
        .map_err(|err| internal_error(format!("Malformed stream frame: {err}")))
}

/// Owns the listen and write streams and the set of active listen targets.
///
/// Every method runs on the client task queue and returns the notifications
/// the sync engine must apply. Stream callbacks arrive through
/// [`handle_event`](Self::handle_event).
pub struct RemoteStore {
    serializer: JsonProtoSerializer,
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    watch_aggregator: Option<WatchChangeAggregator>,
    online_state: OnlineStateTracker,
    write_pipeline: VecDeque<MutationBatch>,
    /// Batches the server answered whose outcome the local store has not
    /// recorded yet. They must not be sent again.
    settling_batches: BTreeSet<BatchId>,
    write_handshake_complete: bool,
    last_stream_token: Vec<u8>,
    max_pending_writes: usize,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStore {
    pub fn new(
        settings: &SyncSettings,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
    ) -> Self {
        Self {
            serializer: JsonProtoSerializer::new(settings.database.clone()),
            listen_targets: BTreeMap::new(),
            watch_stream: PersistentStream::new(
                StreamKind::Listen,
                Arc::clone(&datastore),
                credentials.clone(),
                settings,
            ),
            write_stream: PersistentStream::new(StreamKind::Write, datastore, credentials, settings),
            watch_aggregator: None,
            online_state: OnlineStateTracker::new(settings.online_state_timeout),
            write_pipeline: VecDeque::new(),
            settling_batches: BTreeSet::new(),
            write_handshake_complete: false,
            last_stream_token: Vec::new(),
            max_pending_writes: settings.max_pending_writes,
            offline_causes: BTreeSet::new(),
        }
    }

    pub fn set_event_sink(&mut self, sink: EventSink<RemoteStoreEvent>) {
        let watch = Arc::clone(&sink);
        self.watch_stream
            .set_sink(Arc::new(move |event| watch(RemoteStoreEvent::Stream(event))));
        let write = Arc::clone(&sink);
        self.write_stream
            .set_sink(Arc::new(move |event| write(RemoteStoreEvent::Stream(event))));
        self.online_state
            .set_timer_sink(Arc::new(move |token| sink(RemoteStoreEvent::OnlineStateTimeout(token))));
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn listen_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    /// Starts the streams unless something keeps the network off.
    pub fn start(&mut self, syncer: &dyn RemoteSyncer) -> Notifications {
        let mut out = Vec::new();
        self.enable_network_internal(syncer, &mut out);
        out
    }

    pub fn enable_network(&mut self, syncer: &dyn RemoteSyncer) -> Notifications {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        let mut out = Vec::new();
        self.enable_network_internal(syncer, &mut out);
        out
    }

    pub fn disable_network(&mut self) -> Notifications {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        let mut out = Vec::new();
        push_online(&mut out, self.online_state.set(OnlineState::Offline));
        out
    }

    /// Connectivity reported by the host. Losing it stops both streams;
    /// regaining it restarts them right away.
    pub fn set_connectivity(&mut self, connected: bool, syncer: &dyn RemoteSyncer) -> Notifications {
        let mut out = Vec::new();
        if connected {
            if self.offline_causes.remove(&OfflineCause::ConnectivityChange) {
                log::debug!("connectivity restored; restarting streams");
                self.enable_network_internal(syncer, &mut out);
            }
        } else if self.offline_causes.insert(OfflineCause::ConnectivityChange) {
            log::debug!("connectivity lost; stopping streams");
            self.disable_network_internal();
            push_online(&mut out, self.online_state.set(OnlineState::Offline));
        }
        out
    }

    /// Restarts both streams so they reconnect with the new user's
    /// credentials and mutation queue. Call after the local store switched.
    pub fn handle_credential_change(&mut self, syncer: &dyn RemoteSyncer) -> Notifications {
        let mut out = Vec::new();
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        push_online(&mut out, self.online_state.set(OnlineState::Unknown));
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(syncer, &mut out);
        out
    }

    pub fn shutdown(&mut self) {
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        self.watch_stream.stop();
        self.write_stream.stop();
        self.online_state.set(OnlineState::Unknown);
    }

    fn enable_network_internal(&mut self, syncer: &dyn RemoteSyncer, out: &mut Notifications) {
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(false, out);
        } else {
            push_online(out, self.online_state.set(OnlineState::Unknown));
        }
        self.fill_write_pipeline_into(syncer);
    }

    fn disable_network_internal(&mut self) {
        self.watch_stream.close();
        self.write_stream.close();
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "dropping {} pending writes from the pipeline",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.write_handshake_complete = false;
        self.watch_aggregator = None;
    }

    /// Starts listening to `target_data`. Already-listened targets are
    /// left alone.
    pub fn listen(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) -> Notifications {
        let mut out = Vec::new();
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return out;
        }
        log::debug!("listening to target {target_id}");
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream(false, &mut out);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data, syncer);
        }
        out
    }

    pub fn unlisten(&mut self, target_id: TargetId) -> Notifications {
        let mut out = Vec::new();
        if self.listen_targets.remove(&target_id).is_none() {
            return out;
        }
        log::debug!("no longer listening to target {target_id}");
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                push_online(&mut out, self.online_state.set(OnlineState::Unknown));
            }
        }
        out
    }

    /// Pulls queued batches into the write pipeline and starts the write
    /// stream if needed.
    pub fn fill_write_pipeline(&mut self, syncer: &dyn RemoteSyncer) -> Notifications {
        self.fill_write_pipeline_into(syncer);
        Vec::new()
    }

    fn fill_write_pipeline_into(&mut self, syncer: &dyn RemoteSyncer) {
        self.pull_batches(syncer);
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    fn pull_batches(&mut self, syncer: &dyn RemoteSyncer) {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = syncer.next_mutation_batch(last_batch_id) else {
                break;
            };
            last_batch_id = Some(batch.batch_id);
            if self.settling_batches.contains(&batch.batch_id) {
                continue;
            }
            self.add_to_write_pipeline(batch);
        }
    }

    /// Records that the local store applied the server's answer for
    /// `batch_id`, so the batch has left the local queue.
    pub fn batch_settled(&mut self, batch_id: BatchId) {
        self.settling_batches.remove(&batch_id);
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_handshake_complete {
            self.send_write(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn send_write(&mut self, batch: &MutationBatch) {
        let frame = self
            .serializer
            .encode_write_request(&self.last_stream_token, &batch.mutations);
        self.write_stream.send(&frame);
        self.write_stream.mark_idle();
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_watch_stream(&mut self, after_error: bool, out: &mut Notifications) {
        self.watch_aggregator = Some(WatchChangeAggregator::new());
        if after_error {
            self.watch_stream.backoff_and_restart();
        } else {
            self.watch_stream.start();
        }
        push_online(out, self.online_state.handle_watch_stream_start());
    }

    fn send_watch_request(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        let target_data = if resuming {
            let expected = syncer.get_remote_keys_for_target(target_id).len();
            target_data.with_expected_count(Some(expected as i32))
        } else {
            target_data
        };
        let frame = self.serializer.encode_listen_request(&target_data);
        self.watch_stream.send(&frame);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let frame = self.serializer.encode_unlisten_request(target_id);
        self.watch_stream.send(&frame);
    }

    /// Applies a stream callback or timer.
    pub fn handle_event(
        &mut self,
        event: RemoteStoreEvent,
        syncer: &dyn RemoteSyncer,
    ) -> Notifications {
        let mut out = Vec::new();
        match event {
            RemoteStoreEvent::OnlineStateTimeout(token) => {
                push_online(&mut out, self.online_state.handle_timer(token));
            }
            RemoteStoreEvent::Stream(event) => match event.kind() {
                StreamKind::Listen => self.handle_watch_event(event, syncer, &mut out),
                StreamKind::Write => self.handle_write_event(event, syncer, &mut out),
            },
        }
        out
    }

    fn handle_watch_event(
        &mut self,
        event: StreamEvent,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        match event {
            StreamEvent::Opened {
                generation, handle, ..
            } => {
                if self.watch_stream.handle_opened(generation, handle) {
                    let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                    for target_data in targets {
                        self.send_watch_request(target_data, syncer);
                    }
                }
            }
            StreamEvent::Message {
                generation,
                payload,
                ..
            } => {
                if let Some(payload) = self.watch_stream.handle_message(generation, payload) {
                    let change = decode_frame(&payload)
                        .and_then(|frame| self.serializer.decode_watch_change(&frame));
                    match change {
                        Ok(change) => self.on_watch_change(change, syncer, out),
                        Err(error) => {
                            log::warn!("closing listen stream after undecodable frame: {error}");
                            self.fail_stream(StreamKind::Listen, error, syncer, out);
                        }
                    }
                }
            }
            StreamEvent::Closed {
                generation, error, ..
            } => {
                if let Some(outcome) = self.watch_stream.handle_closed(generation, error) {
                    self.on_watch_stream_close(outcome, out);
                }
            }
            StreamEvent::BackoffElapsed { generation, .. } => {
                self.watch_stream.handle_backoff_elapsed(generation)
            }
            StreamEvent::IdleTimeout {
                generation,
                idle_token,
                ..
            } => {
                if self.watch_stream.handle_idle_timeout(generation, idle_token)
                    && self.listen_targets.is_empty()
                {
                    log::debug!("closing idle listen stream");
                    self.watch_stream.close();
                    self.watch_aggregator = None;
                    push_online(out, self.online_state.set(OnlineState::Unknown));
                }
            }
        }
    }

    fn fail_stream(
        &mut self,
        kind: StreamKind,
        error: SyncError,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        match kind {
            StreamKind::Listen => {
                let generation = self.watch_stream.generation();
                if let Some(outcome) = self.watch_stream.handle_closed(generation, Some(error)) {
                    self.on_watch_stream_close(outcome, out);
                }
            }
            StreamKind::Write => {
                let generation = self.write_stream.generation();
                if let Some(outcome) = self.write_stream.handle_closed(generation, Some(error)) {
                    self.on_write_stream_close(outcome, syncer, out);
                }
            }
        }
    }

    fn on_watch_change(
        &mut self,
        change: WatchChange,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        push_online(out, self.online_state.set(OnlineState::Online));

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(error) = target_change.cause.clone() {
                    self.handle_target_error(target_change, error, out);
                    return;
                }
            }
        }

        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return;
        };
        let metadata = TargetMetadata {
            listen_targets: &self.listen_targets,
            syncer,
            database_id: self.serializer.database_id(),
        };
        let boundary = match &change {
            WatchChange::TargetChange(target_change) => snapshot_boundary(target_change),
            _ => None,
        };
        match change {
            WatchChange::DocumentChange(change) => aggregator.handle_document_change(change, &metadata),
            WatchChange::DocumentDelete(delete) => aggregator.handle_document_delete(delete, &metadata),
            WatchChange::DocumentRemove(remove) => aggregator.handle_document_remove(remove, &metadata),
            WatchChange::ExistenceFilter(filter) => {
                aggregator.handle_existence_filter(&filter, &metadata)
            }
            WatchChange::TargetChange(target_change) => {
                aggregator.handle_target_change(&target_change, &metadata)
            }
        }

        if let Some(read_time) = boundary {
            let last_remote_version = syncer.last_remote_snapshot_version();
            if read_time >= last_remote_version {
                self.raise_watch_snapshot(read_time, syncer, out);
            } else {
                log::debug!(
                    "ignoring snapshot at {read_time:?} older than {last_remote_version:?}"
                );
            }
        }
    }

    fn handle_target_error(
        &mut self,
        change: &WatchTargetChange,
        error: SyncError,
        out: &mut Notifications,
    ) {
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                log::debug!("target {target_id} rejected: {error}");
                if let Some(aggregator) = self.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                out.push(RemoteStoreNotification::ListenRejected {
                    target_id: *target_id,
                    error: error.clone(),
                });
            }
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return;
        };
        let metadata = TargetMetadata {
            listen_targets: &self.listen_targets,
            syncer,
            database_id: self.serializer.database_id(),
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.remove(target_id) {
                let updated = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                self.listen_targets.insert(*target_id, updated);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.remove(target_id) else {
                continue;
            };
            // Keep the version so the local store can still serve the target,
            // but resume from scratch.
            let version = target_data.snapshot_version;
            let reset = target_data.with_resume_token(Vec::new(), version);
            let request = TargetData::new(
                reset.target.clone(),
                *target_id,
                *purpose,
                reset.sequence_number,
            );
            self.listen_targets.insert(*target_id, reset);
            log::debug!("re-querying target {target_id} ({purpose:?})");
            self.send_unwatch_request(*target_id);
            self.send_watch_request(request, syncer);
        }

        out.push(RemoteStoreNotification::RemoteEvent(event));
    }

    fn on_watch_stream_close(&mut self, outcome: CloseOutcome, out: &mut Notifications) {
        self.watch_aggregator = None;
        if outcome.surface {
            log::warn!("listen stream giving up: {}", outcome.error);
            let targets = std::mem::take(&mut self.listen_targets);
            for target_id in targets.into_keys() {
                out.push(RemoteStoreNotification::ListenRejected {
                    target_id,
                    error: outcome.error.clone(),
                });
            }
        }
        if self.should_start_watch_stream() {
            push_online(out, self.online_state.handle_watch_stream_failure(&outcome.error));
            self.start_watch_stream(true, out);
        } else {
            push_online(out, self.online_state.set(OnlineState::Unknown));
        }
    }

    fn handle_write_event(
        &mut self,
        event: StreamEvent,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        match event {
            StreamEvent::Opened {
                generation, handle, ..
            } => {
                if self.write_stream.handle_opened(generation, handle) {
                    self.write_handshake_complete = false;
                    let frame = self.serializer.encode_handshake();
                    self.write_stream.send(&frame);
                    self.write_stream.mark_idle();
                }
            }
            StreamEvent::Message {
                generation,
                payload,
                ..
            } => {
                if let Some(payload) = self.write_stream.handle_message(generation, payload) {
                    let response = decode_frame(&payload)
                        .and_then(|frame| self.serializer.decode_write_response(&frame));
                    let handled =
                        response.and_then(|response| self.on_write_response(response, syncer, out));
                    if let Err(error) = handled {
                        log::warn!("closing write stream: {error}");
                        self.fail_stream(StreamKind::Write, error, syncer, out);
                    }
                }
            }
            StreamEvent::Closed {
                generation, error, ..
            } => {
                if let Some(outcome) = self.write_stream.handle_closed(generation, error) {
                    self.on_write_stream_close(outcome, syncer, out);
                }
            }
            StreamEvent::BackoffElapsed { generation, .. } => {
                self.write_stream.handle_backoff_elapsed(generation)
            }
            StreamEvent::IdleTimeout {
                generation,
                idle_token,
                ..
            } => {
                if self.write_stream.handle_idle_timeout(generation, idle_token) {
                    self.on_write_stream_idle();
                }
            }
        }
    }

    /// An idle write stream with nothing outstanding is closed. One still
    /// waiting on its handshake or on acknowledgements gets a keepalive.
    fn on_write_stream_idle(&mut self) {
        if self.write_handshake_complete && self.write_pipeline.is_empty() {
            log::debug!("closing idle write stream");
            self.write_stream.close();
            self.write_handshake_complete = false;
            return;
        }
        log::debug!("sending write stream keepalive");
        let frame = self
            .serializer
            .encode_write_request(&self.last_stream_token, &[]);
        self.write_stream.send(&frame);
        self.write_stream.mark_idle();
    }

    fn on_write_response(
        &mut self,
        response: WriteResponse,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) -> SyncResult<()> {
        if !self.write_handshake_complete {
            self.write_handshake_complete = true;
            self.last_stream_token = response.stream_token;
            out.push(RemoteStoreNotification::StreamTokenChanged(
                self.last_stream_token.clone(),
            ));
            log::debug!(
                "write handshake complete; sending {} batches",
                self.write_pipeline.len()
            );
            let batches: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
            for batch in &batches {
                self.send_write(batch);
            }
            return Ok(());
        }

        self.last_stream_token = response.stream_token.clone();
        if response.is_token_only() {
            return Ok(());
        }

        let batch = self
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Write acknowledged with an empty pipeline"))?;
        let commit_version = response
            .commit_version
            .ok_or_else(|| internal_error("Write response without a commit time"))?;
        let result = MutationBatchResult::new(
            batch,
            commit_version,
            response.write_results,
            response.stream_token,
        )?;
        log::debug!("batch {} acknowledged", result.batch.batch_id);
        self.settling_batches.insert(result.batch.batch_id);
        out.push(RemoteStoreNotification::WriteAcknowledged(result));
        self.fill_write_pipeline_into(syncer);
        if self.write_stream.is_open() {
            self.write_stream.mark_idle();
        }
        Ok(())
    }

    fn on_write_stream_close(
        &mut self,
        outcome: CloseOutcome,
        syncer: &dyn RemoteSyncer,
        out: &mut Notifications,
    ) {
        let code = outcome.error.code;
        if self.write_handshake_complete {
            if is_permanent_write_error(code) || outcome.surface {
                if let Some(batch) = self.write_pipeline.pop_front() {
                    log::warn!("batch {} rejected: {}", batch.batch_id, outcome.error);
                    self.settling_batches.insert(batch.batch_id);
                    out.push(RemoteStoreNotification::WriteRejected {
                        batch_id: batch.batch_id,
                        error: outcome.error.clone(),
                    });
                }
            }
        } else if is_permanent_error(code) {
            log::debug!("write handshake failed permanently; resetting the stream token");
            self.last_stream_token.clear();
            out.push(RemoteStoreNotification::StreamTokenChanged(Vec::new()));
        } else if outcome.surface {
            if let Some(batch) = self.write_pipeline.pop_front() {
                self.settling_batches.insert(batch.batch_id);
                out.push(RemoteStoreNotification::WriteRejected {
                    batch_id: batch.batch_id,
                    error: outcome.error.clone(),
                });
            }
        }
        self.write_handshake_complete = false;

        self.pull_batches(syncer);
        if self.should_start_write_stream() {
            self.write_stream.backoff_and_restart();
        }
    }
}

/// The read time of a watch response that closes a consistent snapshot:
/// a global no-change, or a target turning current.
fn snapshot_boundary(change: &WatchTargetChange) -> Option<SnapshotVersion> {
    let read_time = change.read_time?;
    let global = change.state == TargetChangeState::NoChange && change.target_ids.is_empty();
    (global || change.state == TargetChangeState::Current).then_some(read_time)
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::core::target::TargetPurpose;
    use crate::error::{permission_denied, unavailable, SyncErrorCode};
    use crate::model::{MutableDocument, Mutation, MutationResult, Timestamp};
    use crate::remote::credentials::EmptyCredentialsProvider;
    use crate::remote::datastore::{InMemoryDatastore, InMemoryServer, ServerStream};
    use crate::remote::serializer::ListenRequest;
    use crate::remote::watch_change::DocumentChange;
    use crate::value::{MapValue, Value};
    use async_channel::Receiver;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSyncer {
        batches: Vec<MutationBatch>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
        last_version: SnapshotVersion,
    }

    impl RemoteSyncer for FakeSyncer {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn next_mutation_batch(&self, after: Option<BatchId>) -> Option<MutationBatch> {
            self.batches
                .iter()
                .find(|batch| after.map_or(true, |after| batch.batch_id > after))
                .cloned()
        }

        fn last_remote_snapshot_version(&self) -> SnapshotVersion {
            self.last_version
        }
    }

    struct Harness {
        store: RemoteStore,
        events: Receiver<RemoteStoreEvent>,
        server: InMemoryServer,
        syncer: FakeSyncer,
        serializer: JsonProtoSerializer,
    }

    fn harness() -> Harness {
        let (datastore, server) = InMemoryDatastore::new();
        let settings = SyncSettings::new(DatabaseId::new("p", "(default)"))
            .with_max_stream_retries(2)
            .with_idle_timeout(Duration::from_secs(30));
        let mut store = RemoteStore::new(
            &settings,
            Arc::new(datastore),
            StreamCredentialProvider::new(Arc::new(EmptyCredentialsProvider), None),
        );
        let (sender, events) = async_channel::unbounded();
        store.set_event_sink(Arc::new(move |event| {
            let _ = sender.try_send(event);
        }));
        Harness {
            serializer: store.serializer().clone(),
            store,
            events,
            server,
            syncer: FakeSyncer::default(),
        }
    }

    impl Harness {
        async fn step(&mut self) -> Notifications {
            let event = self.events.recv().await.unwrap();
            self.store.handle_event(event, &self.syncer)
        }

        async fn step_until_open(&mut self, kind: StreamKind) {
            loop {
                let event = self.events.recv().await.unwrap();
                let opened = matches!(
                    &event,
                    RemoteStoreEvent::Stream(StreamEvent::Opened { kind: k, .. }) if *k == kind
                );
                self.store.handle_event(event, &self.syncer);
                if opened {
                    return;
                }
            }
        }

        async fn send_change(&mut self, server: &ServerStream, change: WatchChange) -> Notifications {
            server
                .send_json(&self.serializer.encode_watch_change(&change))
                .await
                .unwrap();
            self.step().await
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn query_target(id: TargetId) -> TargetData {
        let target = Query::collection("rooms").unwrap().to_target();
        TargetData::new(target, id, TargetPurpose::Listen, 1)
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[tokio::test]
    async fn listening_opens_the_stream_and_sends_targets() {
        let mut harness = harness();
        let out = harness.store.listen(query_target(2), &harness.syncer);
        assert!(out.is_empty());
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        let request = harness
            .serializer
            .decode_listen_request(&server.recv_json().await.unwrap())
            .unwrap();
        match request {
            ListenRequest::AddTarget(add) => {
                assert_eq!(add.target_id, 2);
                assert_eq!(add.expected_count, None);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumed_targets_carry_the_expected_count() {
        let mut harness = harness();
        harness
            .syncer
            .remote_keys
            .insert(2, BTreeSet::from([key("rooms/a")]));
        let target = query_target(2).with_resume_token(b"tok".to_vec(), version(3));
        harness.store.listen(target, &harness.syncer);
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        match harness
            .serializer
            .decode_listen_request(&server.recv_json().await.unwrap())
            .unwrap()
        {
            ListenRequest::AddTarget(add) => {
                assert_eq!(add.resume_token, b"tok".to_vec());
                assert_eq!(add.expected_count, Some(1));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn current_targets_raise_remote_events_and_advance_tokens() {
        let mut harness = harness();
        harness.store.listen(query_target(2), &harness.syncer);
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        server.recv_json().await.unwrap();

        let out = harness
            .send_change(
                &server,
                WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![2])),
            )
            .await;
        assert_eq!(
            out,
            vec![RemoteStoreNotification::OnlineStateChanged(OnlineState::Online)]
        );

        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), Value::from_integer(1));
        let document = MutableDocument::new_found(key("rooms/a"), version(4), MapValue::new(fields));
        harness
            .send_change(
                &server,
                WatchChange::DocumentChange(DocumentChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: vec![],
                    key: document.key().clone(),
                    document: Some(document.clone()),
                }),
            )
            .await;
        let out = harness
            .send_change(
                &server,
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::Current, vec![2])
                        .with_resume_token(b"r1".to_vec())
                        .with_read_time(version(5)),
                ),
            )
            .await;
        let [RemoteStoreNotification::RemoteEvent(event)] = out.as_slice() else {
            panic!("expected a single remote event, got {out:?}");
        };
        assert_eq!(event.snapshot_version, version(5));
        assert!(event.target_changes[&2].current);
        assert!(event.document_updates.contains_key(document.key()));
        let data = harness.store.listen_target(2).unwrap();
        assert_eq!(data.resume_token, b"r1".to_vec());
        assert_eq!(data.snapshot_version, version(5));
    }

    #[tokio::test]
    async fn removal_with_a_cause_rejects_the_listen() {
        let mut harness = harness();
        harness.store.listen(query_target(2), &harness.syncer);
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        server.recv_json().await.unwrap();

        let out = harness
            .send_change(
                &server,
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::Remove, vec![2])
                        .with_cause(permission_denied("nope")),
                ),
            )
            .await;
        assert!(out.contains(&RemoteStoreNotification::ListenRejected {
            target_id: 2,
            error: permission_denied("nope"),
        }));
        assert!(!harness.store.is_listening(2));
    }

    #[tokio::test]
    async fn stale_snapshots_are_not_raised() {
        let mut harness = harness();
        harness.syncer.last_version = version(10);
        harness.store.listen(query_target(2), &harness.syncer);
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        server.recv_json().await.unwrap();
        harness
            .send_change(
                &server,
                WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![2])),
            )
            .await;
        let out = harness
            .send_change(
                &server,
                WatchChange::TargetChange(
                    WatchTargetChange::new(TargetChangeState::NoChange, vec![])
                        .with_read_time(version(4)),
                ),
            )
            .await;
        assert!(out
            .iter()
            .all(|note| !matches!(note, RemoteStoreNotification::RemoteEvent(_))));
    }

    #[tokio::test]
    async fn watch_failures_report_offline_and_reconnect() {
        let mut harness = harness();
        harness.store.listen(query_target(2), &harness.syncer);
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        server.fail(unavailable("gone")).await;
        let out = harness.step().await;
        assert!(out.contains(&RemoteStoreNotification::OnlineStateChanged(OnlineState::Offline)));
        harness.step_until_open(StreamKind::Listen).await;
        let server = harness.server.accept_kind(StreamKind::Listen).await.unwrap();
        assert!(server.recv_json().await.is_some());
    }

    fn batch(id: BatchId) -> MutationBatch {
        MutationBatch::new(
            id,
            Timestamp::new(1, 0),
            vec![Mutation::delete(key(&format!("rooms/r{id}")))],
        )
    }

    #[tokio::test]
    async fn writes_wait_for_the_handshake_and_pair_acks_in_order() {
        let mut harness = harness();
        harness.syncer.batches = vec![batch(1), batch(2)];
        harness.store.fill_write_pipeline(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 2);
        harness.step_until_open(StreamKind::Write).await;
        let server = harness.server.accept_kind(StreamKind::Write).await.unwrap();
        assert_eq!(server.recv_json().await.unwrap(), harness.serializer.encode_handshake());

        let handshake = WriteResponse {
            stream_token: b"s0".to_vec(),
            commit_version: None,
            write_results: vec![],
        };
        server
            .send_json(&harness.serializer.encode_write_response(&handshake))
            .await
            .unwrap();
        let out = harness.step().await;
        assert_eq!(
            out,
            vec![RemoteStoreNotification::StreamTokenChanged(b"s0".to_vec())]
        );
        for _ in 0..2 {
            let frame = server.recv_json().await.unwrap();
            assert_eq!(frame["streamToken"], json!(base64_token(b"s0")));
        }

        harness.syncer.batches.remove(0);
        let ack = WriteResponse {
            stream_token: b"s1".to_vec(),
            commit_version: Some(version(7)),
            write_results: vec![MutationResult {
                version: version(7),
                transform_results: vec![],
            }],
        };
        server
            .send_json(&harness.serializer.encode_write_response(&ack))
            .await
            .unwrap();
        let out = harness.step().await;
        let [RemoteStoreNotification::WriteAcknowledged(result)] = out.as_slice() else {
            panic!("expected an acknowledgement, got {out:?}");
        };
        assert_eq!(result.batch.batch_id, 1);
        assert_eq!(result.stream_token, b"s1".to_vec());
        assert_eq!(harness.store.write_pipeline_len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_batches_are_not_resent_until_settled() {
        let mut harness = harness();
        harness.syncer.batches = vec![batch(1)];
        harness.store.fill_write_pipeline(&harness.syncer);
        harness.step_until_open(StreamKind::Write).await;
        let server = harness.server.accept_kind(StreamKind::Write).await.unwrap();
        server.recv_json().await.unwrap();
        let handshake = WriteResponse {
            stream_token: b"s0".to_vec(),
            commit_version: None,
            write_results: vec![],
        };
        server
            .send_json(&harness.serializer.encode_write_response(&handshake))
            .await
            .unwrap();
        harness.step().await;
        server.recv_json().await.unwrap();

        // The local queue still holds batch 1 until the engine records the ack.
        let ack = WriteResponse {
            stream_token: b"s1".to_vec(),
            commit_version: Some(version(7)),
            write_results: vec![MutationResult {
                version: version(7),
                transform_results: vec![],
            }],
        };
        server
            .send_json(&harness.serializer.encode_write_response(&ack))
            .await
            .unwrap();
        let out = harness.step().await;
        assert!(matches!(
            out.as_slice(),
            [RemoteStoreNotification::WriteAcknowledged(_)]
        ));
        assert_eq!(harness.store.write_pipeline_len(), 0);
        harness.store.fill_write_pipeline(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 0);

        // Later batches are still pulled past the settling one.
        harness.syncer.batches.push(batch(2));
        harness.store.fill_write_pipeline(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 1);

        harness.syncer.batches.remove(0);
        harness.store.batch_settled(1);
        harness.store.disable_network();
        harness.store.enable_network(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 1);
    }

    #[tokio::test]
    async fn permanent_write_errors_reject_the_head_batch() {
        let mut harness = harness();
        harness.syncer.batches = vec![batch(1)];
        harness.store.fill_write_pipeline(&harness.syncer);
        harness.step_until_open(StreamKind::Write).await;
        let server = harness.server.accept_kind(StreamKind::Write).await.unwrap();
        server.recv_json().await.unwrap();
        let handshake = WriteResponse {
            stream_token: b"s0".to_vec(),
            commit_version: None,
            write_results: vec![],
        };
        server
            .send_json(&harness.serializer.encode_write_response(&handshake))
            .await
            .unwrap();
        harness.step().await;
        server.recv_json().await.unwrap();

        harness.syncer.batches.clear();
        server.fail(permission_denied("rules")).await;
        let out = harness.step().await;
        let [RemoteStoreNotification::WriteRejected { batch_id, error }] = out.as_slice() else {
            panic!("expected a rejection, got {out:?}");
        };
        assert_eq!(*batch_id, 1);
        assert_eq!(error.code, SyncErrorCode::PermissionDenied);
        assert_eq!(harness.store.write_pipeline_len(), 0);
    }

    #[tokio::test]
    async fn disabling_the_network_goes_offline_and_drops_the_pipeline() {
        let mut harness = harness();
        harness.syncer.batches = vec![batch(1)];
        harness.store.fill_write_pipeline(&harness.syncer);
        let out = harness.store.disable_network();
        assert_eq!(
            out,
            vec![RemoteStoreNotification::OnlineStateChanged(OnlineState::Offline)]
        );
        assert_eq!(harness.store.write_pipeline_len(), 0);
        harness.store.fill_write_pipeline(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 0);

        harness.store.enable_network(&harness.syncer);
        assert_eq!(harness.store.write_pipeline_len(), 1);
    }

    fn base64_token(token: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(token)
    }
}
