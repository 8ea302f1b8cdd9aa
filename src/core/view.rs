//! Incremental query results.
//!
//! A view holds the documents currently matching one query and turns batches
//! of changed documents into [`ViewSnapshot`]s. It also tracks which of its
//! documents the server has confirmed; every other document shown while the
//! view is current is in limbo and must be resolved by the sync engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::query::{LimitType, Query};
use crate::core::view_snapshot::{
    sort_changes, ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::model::{DocumentKey, DocumentMap, DocumentSet, MutableDocument};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::TargetChange;

/// A key entering or leaving limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Output of [`View::compute_doc_changes`], applied later with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limit query lost a document that the cache may be able to replace.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    /// `synced_documents` are the keys the server last reported for the
    /// query's target.
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let ordering = query.clone();
        let document_set = DocumentSet::new(Arc::new(move |left, right| ordering.compare(left, right)));
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Folds `changed` into the view's documents without committing. Pass the
    /// result of a previous call as `previous` to layer a refill on top.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut document_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.document_set,
                previous.change_set,
                previous.mutated_keys,
            ),
            None => (
                self.document_set.clone(),
                DocumentChangeSet::new(),
                self.mutated_keys.clone(),
            ),
        };
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changed {
            let old_doc = document_set.get(key).cloned();
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (&old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !Self::should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new.clone()));
                            applied = true;
                            let past_end = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.query.compare(new, last).is_gt());
                            let before_start = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.query.compare(new, first).is_lt());
                            if past_end || before_start {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new.clone()));
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        document_set.add(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// A locally modified document whose acknowledged version has not yet
    /// arrived from the watch stream keeps showing the local version.
    fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
        old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
    }

    /// Commits `doc_changes` and produces the resulting snapshot, if any.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        sort_changes(&mut changes, &self.query);

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
            online_state: OnlineState::Unknown,
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops `current`, so listeners see cached results.
    pub fn apply_online_state(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes(unchanged, false, None);
        }
        ViewChange::default()
    }

    /// Replaces the synced keys with what the target cache holds, used when
    /// the view is rebuilt after a user change.
    pub fn synchronize_with_persisted_keys(&mut self, keys: BTreeSet<DocumentKey>) {
        self.synced_documents = keys;
        self.limbo_documents.clear();
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced for its view");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        for key in self.limbo_documents.difference(&old_limbo) {
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        changes
    }

    fn should_be_in_limbo(&self, doc: &MutableDocument) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}
