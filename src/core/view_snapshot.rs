use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::model::{DocumentKey, DocumentSet, MutableDocument};
use crate::remote::online_state_tracker::OnlineState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first, then additions, then modifications.
    fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: MutableDocument) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates per-key view changes, folding successive changes to the same
/// document into the net effect.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        use ChangeType::*;

        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                log::warn!(
                    "unexpected change {new_type:?} after {old_type:?} for {key}; keeping the latest"
                );
                Some(change)
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Sorts changes removals first, then by the query's document order.
pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], query: &Query) {
    changes.sort_by(|left, right| {
        left.change_type
            .sort_rank()
            .cmp(&right.change_type.sort_rank())
            .then_with(|| query.compare(&left.document, &right.document))
            .then_with(|| left.document.key().cmp(right.document.key()))
    });
}

/// Whether a view has caught up with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results may lag the server: not current or documents in limbo.
    Local,
    Synced,
}

/// The state of one view after a batch of changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub changes: Vec<DocumentViewChange>,
    /// Keys whose documents carry unacknowledged local writes.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The target has a resume token, so cached results were served.
    pub has_cached_results: bool,
    /// Connectivity when the snapshot was raised.
    pub online_state: OnlineState,
}

impl ViewSnapshot {
    /// A snapshot where every document is newly added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        excludes_metadata_changes: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        Self {
            old_documents: documents.empty_like(),
            query,
            documents,
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes,
            has_cached_results,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
