//! Fans view snapshots out to query listeners.
//!
//! Listeners of equal queries share one entry (and therefore one view and
//! one target). Each listener decides on its own which snapshots to raise,
//! depending on its [`ListenOptions`] and the current online state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::query::Query;
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{SyncError, SyncResult};
use crate::remote::online_state_tracker::OnlineState;

pub type ListenerId = u64;

/// Receives every snapshot a listener raises, or the error that ended it.
pub type ViewSnapshotSink = Arc<dyn Fn(SyncResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata.
    pub include_metadata_changes: bool,
    /// Hold back cached results while the client may still reach the server.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync_when_online(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

struct QueryListener {
    id: ListenerId,
    options: ListenOptions,
    sink: ViewSnapshotSink,
    raised_initial_event: bool,
    last_snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) {
        let mut snapshot = snapshot.clone();
        if !self.options.include_metadata_changes {
            snapshot
                .changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
            }
        } else if self.should_raise_event(&snapshot) {
            (self.sink)(Ok(snapshot.clone()));
        }
        self.last_snapshot = Some(snapshot);
    }

    fn on_error(&self, error: SyncError) {
        (self.sink)(Err(error));
    }

    fn apply_online_state(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        if self.raised_initial_event {
            return;
        }
        if let Some(snapshot) = self.last_snapshot.clone() {
            if self.should_raise_initial_event(&snapshot, online_state) {
                self.raise_initial_event(&snapshot);
            }
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .last_snapshot
            .as_ref()
            .is_some_and(|last| last.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let mut initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.excludes_metadata_changes,
            snapshot.has_cached_results,
        );
        initial.online_state = snapshot.online_state;
        self.raised_initial_event = true;
        (self.sink)(Ok(initial));
    }
}

struct QueryListeners {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Tracks listeners per query and routes snapshots, errors and online state
/// changes to them.
#[derive(Default)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListeners>,
    listener_queries: BTreeMap<ListenerId, String>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Whether some listener already watches a query with this canonical id.
    pub fn is_listening(&self, canonical_id: &str) -> bool {
        self.queries.contains_key(canonical_id)
    }

    pub fn listener_count(&self) -> usize {
        self.listener_queries.len()
    }

    /// Registers a listener. `initial` is the view's first snapshot and must
    /// be supplied when the query had no listeners yet.
    pub fn add_listener(
        &mut self,
        query: Query,
        options: ListenOptions,
        sink: ViewSnapshotSink,
        initial: Option<ViewSnapshot>,
    ) -> ListenerId {
        self.next_listener_id += 1;
        let id = self.next_listener_id;
        let canonical_id = query.canonical_id();
        let online_state = self.online_state;

        let entry = self
            .queries
            .entry(canonical_id.clone())
            .or_insert_with(|| QueryListeners {
                query,
                view_snapshot: None,
                listeners: Vec::new(),
            });
        if let Some(mut snapshot) = initial {
            snapshot.online_state = online_state;
            entry.view_snapshot = Some(snapshot);
        }

        let mut listener = QueryListener {
            id,
            options,
            sink,
            raised_initial_event: false,
            last_snapshot: None,
            online_state,
        };
        listener.apply_online_state(online_state);
        if let Some(snapshot) = &entry.view_snapshot {
            listener.on_view_snapshot(snapshot);
        }
        entry.listeners.push(listener);
        self.listener_queries.insert(id, canonical_id);
        id
    }

    /// Drops a listener. Returns the query when it was the last one, so the
    /// caller can stop listening to the target.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Query> {
        let canonical_id = self.listener_queries.remove(&id)?;
        let entry = self.queries.get_mut(&canonical_id)?;
        entry.listeners.retain(|listener| listener.id != id);
        if entry.listeners.is_empty() {
            return self.queries.remove(&canonical_id).map(|entry| entry.query);
        }
        None
    }

    pub fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for mut snapshot in snapshots {
            snapshot.online_state = self.online_state;
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut entry.listeners {
                listener.on_view_snapshot(&snapshot);
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// Ends every listener of `query` with `error`.
    pub fn on_listen_error(&mut self, query: &Query, error: SyncError) {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        for listener in entry.listeners {
            self.listener_queries.remove(&listener.id);
            listener.on_error(error.clone());
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                listener.apply_online_state(online_state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::view::View;
    use crate::error::permission_denied;
    use crate::model::{DocumentKey, DocumentMap, MutableDocument, SnapshotVersion, Timestamp};
    use crate::remote::remote_event::TargetChange;
    use crate::value::MapValue;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    type Raised = Arc<Mutex<Vec<SyncResult<ViewSnapshot>>>>;

    fn recorder() -> (Raised, ViewSnapshotSink) {
        let raised: Raised = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&raised);
        (raised, Arc::new(move |event| sink.lock().unwrap().push(event)))
    }

    fn query() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn snapshot_with(paths: &[&str], current: bool) -> ViewSnapshot {
        let mut view = View::new(query(), BTreeSet::new());
        let docs: DocumentMap = paths
            .iter()
            .map(|path| {
                let key = DocumentKey::from_string(path).unwrap();
                let doc = MutableDocument::new_found(
                    key.clone(),
                    SnapshotVersion::new(Timestamp::new(1, 0)),
                    MapValue::empty(),
                );
                (key, doc)
            })
            .collect();
        let changes = view.compute_doc_changes(&docs, None);
        let target = TargetChange {
            current,
            added_documents: docs.keys().cloned().collect(),
            ..TargetChange::default()
        };
        view.apply_changes(changes, true, Some(&target))
            .snapshot
            .unwrap()
    }

    #[test]
    fn empty_cached_snapshot_waits_for_the_server() {
        let mut manager = EventManager::new();
        let (raised, sink) = recorder();
        manager.add_listener(query(), ListenOptions::default(), sink, Some(snapshot_with(&[], false)));
        assert!(raised.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        let raised = raised.lock().unwrap();
        assert_eq!(raised.len(), 1);
        assert!(raised[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn cached_documents_are_raised_immediately() {
        let mut manager = EventManager::new();
        let (raised, sink) = recorder();
        manager.add_listener(
            query(),
            ListenOptions::default(),
            sink,
            Some(snapshot_with(&["rooms/a"], false)),
        );
        assert_eq!(raised.lock().unwrap().len(), 1);
    }

    #[test]
    fn wait_for_sync_holds_back_cached_documents_while_online() {
        let mut manager = EventManager::new();
        let (raised, sink) = recorder();
        let options = ListenOptions::default().wait_for_sync_when_online();
        manager.add_listener(query(), options, sink, Some(snapshot_with(&["rooms/a"], false)));
        assert!(raised.lock().unwrap().is_empty());

        manager.on_view_snapshots(vec![snapshot_with(&["rooms/a"], true)]);
        let raised = raised.lock().unwrap();
        assert_eq!(raised.len(), 1);
        assert!(!raised[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn listeners_share_a_query_and_the_last_one_releases_it() {
        let mut manager = EventManager::new();
        let (_, first_sink) = recorder();
        let (second_raised, second_sink) = recorder();
        let first = manager.add_listener(
            query(),
            ListenOptions::default(),
            first_sink,
            Some(snapshot_with(&["rooms/a"], true)),
        );
        let second = manager.add_listener(query(), ListenOptions::default(), second_sink, None);
        assert_eq!(second_raised.lock().unwrap().len(), 1);

        assert_eq!(manager.remove_listener(first), None);
        assert_eq!(manager.remove_listener(second), Some(query()));
        assert!(!manager.is_listening(&query().canonical_id()));
    }

    #[test]
    fn errors_end_every_listener() {
        let mut manager = EventManager::new();
        let (raised, sink) = recorder();
        manager.add_listener(query(), ListenOptions::default(), sink, Some(snapshot_with(&[], false)));
        manager.on_listen_error(&query(), permission_denied("no access"));
        assert_eq!(manager.listener_count(), 0);
        assert!(raised.lock().unwrap()[0].is_err());
    }
}
