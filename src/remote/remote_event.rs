use std::collections::{BTreeMap, BTreeSet};

use crate::core::target::{TargetId, TargetPurpose};
use crate::model::{DocumentKey, DocumentMap, MutableDocument, SnapshotVersion};

/// Changes to a single target since the previous remote event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change that only flips the `current` flag, used when a target
    /// becomes consistent without any document traffic.
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}

/// A consistent snapshot of watch changes at `snapshot_version`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results diverged and must be re-queried.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    /// Keys whose only remaining target is a limbo resolution.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event reporting that `key` does not exist, used when its limbo
    /// resolution is rejected by the server.
    pub fn synthesized_delete(key: DocumentKey) -> Self {
        let mut document_updates = DocumentMap::new();
        document_updates.insert(
            key.clone(),
            MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            document_updates,
            resolved_limbo_documents: BTreeSet::from([key]),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}
