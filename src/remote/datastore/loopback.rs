//! In-process document service speaking the listen and write protocols.
//!
//! Serves the streams of an [`InMemoryDatastore`]: commits writes against
//! its own document map and pushes the resulting changes to every listen
//! target whose query they affect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::Sender;
use serde_json::Value as JsonValue;

use super::in_memory::{InMemoryDatastore, InMemoryServer, ServerStream};
use super::StreamKind;
use crate::core::query::Query;
use crate::core::target::TargetId;
use crate::error::{failed_precondition, SyncError, SyncResult};
use crate::model::{
    DatabaseId, DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};
use crate::platform::runtime;
use crate::remote::serializer::{
    JsonProtoSerializer, ListenRequest, ListenTargetRequest, WriteRequest, WriteResponse,
};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, TargetChangeState, WatchChange,
    WatchTargetChange,
};
use crate::value::MapValue;

struct ListenSession {
    id: u64,
    outbound: Sender<JsonValue>,
    targets: BTreeMap<TargetId, (Query, BTreeSet<DocumentKey>)>,
}

#[derive(Default)]
struct BackendState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    last_version: SnapshotVersion,
    sessions: Vec<ListenSession>,
    next_session_id: u64,
    pending_write_failures: Vec<SyncError>,
    commits: usize,
}

impl BackendState {
    fn next_version(&mut self) -> SnapshotVersion {
        let now = Timestamp::now();
        let last = self.last_version.timestamp();
        let next = if now > last {
            now
        } else {
            Timestamp::new(last.seconds, last.nanos + 1_000)
        };
        self.last_version = SnapshotVersion::new(next);
        self.last_version
    }

    fn matching_keys(&self, query: &Query) -> BTreeSet<DocumentKey> {
        let mut matches: Vec<&MutableDocument> = self
            .documents
            .values()
            .filter(|document| query.matches(document))
            .collect();
        matches.sort_by(|left, right| query.compare(left, right));
        if let Some(limit) = query.limit() {
            matches.truncate(limit as usize);
        }
        matches
            .into_iter()
            .map(|document| document.key().clone())
            .collect()
    }
}

fn resume_token(version: SnapshotVersion) -> Vec<u8> {
    let timestamp = version.timestamp();
    format!("{}.{:09}", timestamp.seconds, timestamp.nanos).into_bytes()
}

/// Shared handle to the loopback service state.
#[derive(Clone)]
pub struct LoopbackBackend {
    state: Arc<Mutex<BackendState>>,
    serializer: JsonProtoSerializer,
}

impl LoopbackBackend {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            serializer: JsonProtoSerializer::new(database_id),
        }
    }

    /// A datastore wired to a freshly started backend.
    pub fn start(database_id: DatabaseId) -> (InMemoryDatastore, Self) {
        let (datastore, server) = InMemoryDatastore::new();
        let backend = Self::new(database_id);
        backend.serve(server);
        (datastore, backend)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accepts and serves every stream opened against `server`.
    pub fn serve(&self, server: InMemoryServer) {
        let backend = self.clone();
        runtime::spawn_detached(async move {
            while let Some(stream) = server.accept().await {
                let stream = Arc::new(stream);
                match stream.kind() {
                    StreamKind::Listen => backend.spawn_listen_session(stream),
                    StreamKind::Write => backend.spawn_write_session(stream),
                }
            }
            log::debug!("loopback backend stopped accepting streams");
        });
    }

    pub fn document(&self, key: &DocumentKey) -> Option<MutableDocument> {
        self.lock().documents.get(key).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Targets currently watched across all listen streams.
    pub fn active_targets(&self) -> BTreeSet<TargetId> {
        self.lock()
            .sessions
            .iter()
            .flat_map(|session| session.targets.keys().copied())
            .collect()
    }

    /// The next write request is answered by failing its stream with `error`.
    pub fn fail_next_write(&self, error: SyncError) {
        self.lock().pending_write_failures.push(error);
    }

    /// Writes from another client.
    pub fn set_document(&self, key: DocumentKey, data: MapValue) -> SnapshotVersion {
        self.commit_external(vec![Mutation::set(key, data)])
    }

    pub fn delete_document(&self, key: DocumentKey) -> SnapshotVersion {
        self.commit_external(vec![Mutation::delete(key)])
    }

    fn commit_external(&self, mutations: Vec<Mutation>) -> SnapshotVersion {
        match self.commit(&mutations) {
            Ok((version, _)) => version,
            Err(err) => {
                log::warn!("loopback backend rejected a direct write: {err}");
                self.lock().last_version
            }
        }
    }

    /// Applies `mutations` atomically and notifies listeners.
    fn commit(&self, mutations: &[Mutation]) -> SyncResult<(SnapshotVersion, Vec<MutationResult>)> {
        let mut state = self.lock();
        let mut staged = state.documents.clone();
        let version = state.next_version();
        let mut results = Vec::with_capacity(mutations.len());
        let mut touched = BTreeSet::new();

        for mutation in mutations {
            let key = mutation.key().clone();
            let mut document = staged
                .get(&key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            if !mutation.precondition().is_valid_for(&document) {
                return Err(failed_precondition(format!(
                    "Precondition failed for {}",
                    key.path().canonical_string()
                )));
            }
            let transform_results = mutation
                .field_transforms()
                .iter()
                .map(|transform| {
                    transform.operation().apply_to_local_view(
                        document.field(transform.field_path()),
                        version.timestamp(),
                    )
                })
                .collect();
            let result = MutationResult {
                version,
                transform_results,
            };
            mutation.apply_to_remote_document(&mut document, &result)?;
            if document.is_found_document() {
                let stored = MutableDocument::new_found(key.clone(), version, document.data().clone());
                staged.insert(key.clone(), stored);
            } else if document.is_no_document() {
                staged.remove(&key);
            }
            touched.insert(key);
            results.push(result);
        }

        state.documents = staged;
        state.commits += 1;
        let frames = self.collect_changes(&mut state, &touched, version);
        drop(state);
        Self::dispatch(frames);
        Ok((version, results))
    }

    /// Diffs every listen target against the new document state.
    fn collect_changes(
        &self,
        state: &mut BackendState,
        touched: &BTreeSet<DocumentKey>,
        version: SnapshotVersion,
    ) -> Vec<(Sender<JsonValue>, JsonValue)> {
        let mut frames = Vec::new();
        let documents = state.documents.clone();
        let mut next_keys: BTreeMap<(u64, TargetId), BTreeSet<DocumentKey>> = BTreeMap::new();
        for session in &state.sessions {
            for (target_id, (query, _)) in &session.targets {
                next_keys.insert((session.id, *target_id), state.matching_keys(query));
            }
        }

        for session in &mut state.sessions {
            let mut changed_targets = Vec::new();
            for (target_id, (_, current_keys)) in session.targets.iter_mut() {
                let Some(new_keys) = next_keys.remove(&(session.id, *target_id)) else {
                    continue;
                };
                let mut changes = Vec::new();
                for key in &new_keys {
                    if touched.contains(key) || !current_keys.contains(key) {
                        if let Some(document) = documents.get(key) {
                            changes.push(WatchChange::DocumentChange(DocumentChange {
                                updated_target_ids: vec![*target_id],
                                removed_target_ids: Vec::new(),
                                key: key.clone(),
                                document: Some(document.clone()),
                            }));
                        }
                    }
                }
                for key in current_keys.difference(&new_keys) {
                    let change = if documents.contains_key(key) {
                        WatchChange::DocumentRemove(DocumentRemove {
                            key: key.clone(),
                            read_time: Some(version),
                            removed_target_ids: vec![*target_id],
                        })
                    } else {
                        WatchChange::DocumentDelete(DocumentDelete {
                            key: key.clone(),
                            read_time: Some(version),
                            removed_target_ids: vec![*target_id],
                        })
                    };
                    changes.push(change);
                }
                *current_keys = new_keys;
                if !changes.is_empty() {
                    for change in changes {
                        frames.push((
                            session.outbound.clone(),
                            self.serializer.encode_watch_change(&change),
                        ));
                    }
                    changed_targets.push(*target_id);
                }
            }
            if changed_targets.is_empty() {
                continue;
            }
            let token_change = WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, changed_targets)
                    .with_resume_token(resume_token(version)),
            );
            let boundary = WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())
                    .with_read_time(version),
            );
            for change in [token_change, boundary] {
                frames.push((
                    session.outbound.clone(),
                    self.serializer.encode_watch_change(&change),
                ));
            }
        }
        frames
    }

    fn dispatch(frames: Vec<(Sender<JsonValue>, JsonValue)>) {
        for (outbound, frame) in frames {
            if outbound.try_send(frame).is_err() {
                log::debug!("dropping watch frame for a closed listen stream");
            }
        }
    }

    fn spawn_listen_session(&self, stream: Arc<ServerStream>) {
        let (outbound, frames) = async_channel::unbounded::<JsonValue>();
        let session_id = {
            let mut state = self.lock();
            let id = state.next_session_id;
            state.next_session_id += 1;
            state.sessions.push(ListenSession {
                id,
                outbound: outbound.clone(),
                targets: BTreeMap::new(),
            });
            id
        };

        let writer = Arc::clone(&stream);
        runtime::spawn_detached(async move {
            while let Ok(frame) = frames.recv().await {
                if writer.send_json(&frame).await.is_err() {
                    break;
                }
            }
        });

        let backend = self.clone();
        runtime::spawn_detached(async move {
            while let Some(request) = stream.recv_json().await {
                match backend.serializer.decode_listen_request(&request) {
                    Ok(ListenRequest::AddTarget(request)) => {
                        let frames = backend.add_target(session_id, request);
                        for frame in frames {
                            let _ = outbound.try_send(frame);
                        }
                    }
                    Ok(ListenRequest::RemoveTarget(target_id)) => {
                        backend.remove_target(session_id, target_id);
                        let change = WatchChange::TargetChange(WatchTargetChange::new(
                            TargetChangeState::Remove,
                            vec![target_id],
                        ));
                        let _ = outbound.try_send(backend.serializer.encode_watch_change(&change));
                    }
                    Err(err) => {
                        log::warn!("loopback backend received a bad listen request: {err}");
                        stream.fail(err).await;
                        break;
                    }
                }
            }
            outbound.close();
            backend.lock().sessions.retain(|session| session.id != session_id);
        });
    }

    fn add_target(&self, session_id: u64, request: ListenTargetRequest) -> Vec<JsonValue> {
        let mut state = self.lock();
        let query = Query::from_target(request.target);
        let keys = state.matching_keys(&query);
        let version = state.last_version;
        let mut changes = vec![WatchChange::TargetChange(WatchTargetChange::new(
            TargetChangeState::Add,
            vec![request.target_id],
        ))];
        for key in &keys {
            if let Some(document) = state.documents.get(key) {
                changes.push(WatchChange::DocumentChange(DocumentChange {
                    updated_target_ids: vec![request.target_id],
                    removed_target_ids: Vec::new(),
                    key: key.clone(),
                    document: Some(document.clone()),
                }));
            }
        }
        changes.push(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![request.target_id])
                .with_resume_token(resume_token(version))
                .with_read_time(version),
        ));
        if let Some(session) = state
            .sessions
            .iter_mut()
            .find(|session| session.id == session_id)
        {
            session.targets.insert(request.target_id, (query, keys));
        }
        changes
            .iter()
            .map(|change| self.serializer.encode_watch_change(change))
            .collect()
    }

    fn remove_target(&self, session_id: u64, target_id: TargetId) {
        if let Some(session) = self
            .lock()
            .sessions
            .iter_mut()
            .find(|session| session.id == session_id)
        {
            session.targets.remove(&target_id);
        }
    }

    fn spawn_write_session(&self, stream: Arc<ServerStream>) {
        let backend = self.clone();
        runtime::spawn_detached(async move {
            let mut token_counter: u64 = 0;
            while let Some(request) = stream.recv_json().await {
                token_counter += 1;
                let stream_token = token_counter.to_be_bytes().to_vec();
                let request = match backend.serializer.decode_write_request(&request) {
                    Ok(request) => request,
                    Err(err) => {
                        stream.fail(err).await;
                        return;
                    }
                };
                let response = match request {
                    WriteRequest::Handshake => WriteResponse {
                        stream_token,
                        commit_version: None,
                        write_results: Vec::new(),
                    },
                    WriteRequest::Write { mutations, .. } if mutations.is_empty() => {
                        WriteResponse {
                            stream_token,
                            commit_version: None,
                            write_results: Vec::new(),
                        }
                    }
                    WriteRequest::Write { mutations, .. } => {
                        let injected = backend.lock().pending_write_failures.pop();
                        if let Some(error) = injected {
                            stream.fail(error).await;
                            return;
                        }
                        match backend.commit(&mutations) {
                            Ok((version, write_results)) => WriteResponse {
                                stream_token,
                                commit_version: Some(version),
                                write_results,
                            },
                            Err(err) => {
                                stream.fail(err).await;
                                return;
                            }
                        }
                    }
                };
                let frame = backend.serializer.encode_write_response(&response);
                if stream.send_json(&frame).await.is_err() {
                    return;
                }
            }
        });
    }
}
