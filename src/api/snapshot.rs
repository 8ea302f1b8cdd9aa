use std::collections::BTreeMap;

use crate::core::{ChangeType, Query, ViewSnapshot};
use crate::error::{invalid_argument, SyncResult};
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::OnlineState;
use crate::value::{MapValue, Value};

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// Whether the snapshot was served from the local cache without being
    /// confirmed as current by the server.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Whether the snapshot contains local writes the server has not
    /// acknowledged yet.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<MapValue>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(key: DocumentKey, data: Option<MapValue>, metadata: SnapshotMetadata) -> Self {
        Self {
            key,
            data,
            metadata,
        }
    }

    pub(crate) fn from_document(document: &MutableDocument, metadata: SnapshotMetadata) -> Self {
        let data = document
            .is_found_document()
            .then(|| document.data().clone());
        Self::new(document.key().clone(), data, metadata)
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&BTreeMap<String, Value>> {
        self.data.as_ref().map(|map| map.fields())
    }

    /// Reads a single field by dot-separated path.
    pub fn get(&self, path: &str) -> SyncResult<Option<&Value>> {
        let path = crate::model::FieldPath::from_dot_separated(path)?;
        Ok(self.data.as_ref().and_then(|map| map.get(&path)))
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// One entry of [`QuerySnapshot::document_changes`]. Indexes refer to the
/// previous and the current result set; `None` stands for "not present".
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub document: DocumentSnapshot,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// The results of a query at one point in time.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    snapshot: ViewSnapshot,
}

impl QuerySnapshot {
    pub(crate) fn new(snapshot: ViewSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn query(&self) -> &Query {
        &self.snapshot.query
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::new(self.snapshot.from_cache, self.snapshot.has_pending_writes())
    }

    /// Connectivity as seen by the client when the snapshot was raised.
    pub fn online_state(&self) -> OnlineState {
        self.snapshot.online_state
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    /// Documents in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot
            .documents
            .iter()
            .map(|document| self.document_snapshot(document))
            .collect()
    }

    /// Changes since the previous snapshot raised to the same listener. The
    /// first snapshot reports every document as added.
    pub fn document_changes(&self, include_metadata_changes: bool) -> SyncResult<Vec<DocumentChange>> {
        if include_metadata_changes && self.snapshot.excludes_metadata_changes {
            return Err(invalid_argument(
                "Metadata changes were not requested when the listener was registered",
            ));
        }

        let changes = self
            .snapshot
            .changes
            .iter()
            .filter(|change| include_metadata_changes || change.change_type != ChangeType::Metadata);

        if self.snapshot.old_documents.is_empty() {
            return Ok(changes
                .enumerate()
                .map(|(index, change)| DocumentChange {
                    change_type: DocumentChangeType::Added,
                    document: self.document_snapshot(&change.document),
                    old_index: None,
                    new_index: Some(index),
                })
                .collect());
        }

        let mut tracker = self.snapshot.old_documents.clone();
        let mut result = Vec::new();
        for change in changes {
            let key = change.document.key();
            let mut old_index = None;
            let mut new_index = None;
            if change.change_type != ChangeType::Added {
                old_index = tracker.index_of(key);
                tracker.delete(key);
            }
            if change.change_type != ChangeType::Removed {
                tracker.add(change.document.clone());
                new_index = tracker.index_of(key);
            }
            let change_type = match change.change_type {
                ChangeType::Added => DocumentChangeType::Added,
                ChangeType::Removed => DocumentChangeType::Removed,
                ChangeType::Modified | ChangeType::Metadata => DocumentChangeType::Modified,
            };
            result.push(DocumentChange {
                change_type,
                document: self.document_snapshot(&change.document),
                old_index,
                new_index,
            });
        }
        Ok(result)
    }

    pub fn into_documents(self) -> Vec<DocumentSnapshot> {
        self.documents()
    }

    fn document_snapshot(&self, document: &MutableDocument) -> DocumentSnapshot {
        let metadata = SnapshotMetadata::new(
            self.snapshot.from_cache,
            self.snapshot.mutated_keys.contains(document.key()),
        );
        DocumentSnapshot::from_document(document, metadata)
    }
}

impl IntoIterator for QuerySnapshot {
    type Item = DocumentSnapshot;
    type IntoIter = std::vec::IntoIter<DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_documents().into_iter()
    }
}
