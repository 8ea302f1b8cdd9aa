use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::target::{ListenSequenceNumber, Target, TargetData, TargetId};
use crate::model::{DocumentKey, SnapshotVersion};

/// Persisted metadata for every cached target and the keys each one matches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    by_canonical_id: BTreeMap<String, TargetId>,
    matching_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl TargetCache {
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    pub(crate) fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub(crate) fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    /// Inserts or replaces `data`.
    pub(crate) fn save_target(&mut self, data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(data.target_id);
        self.highest_sequence_number = self.highest_sequence_number.max(data.sequence_number);
        self.by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        self.targets.insert(data.target_id, data);
    }

    /// Removes the target and returns the keys it used to match.
    pub(crate) fn remove_target(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(data) = self.targets.remove(&target_id) {
            let canonical_id = data.target.canonical_id();
            if self.by_canonical_id.get(&canonical_id) == Some(&target_id) {
                self.by_canonical_id.remove(&canonical_id);
            }
        }
        self.matching_keys.remove(&target_id).unwrap_or_default()
    }

    pub fn get_target(&self, target: &Target) -> Option<&TargetData> {
        self.by_canonical_id
            .get(&target.canonical_id())
            .and_then(|id| self.targets.get(id))
    }

    pub fn get_target_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub(crate) fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        let entry = self.matching_keys.entry(target_id).or_default();
        entry.extend(keys.into_iter().cloned());
    }

    pub(crate) fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        if let Some(entry) = self.matching_keys.get_mut(&target_id) {
            for key in keys {
                entry.remove(key);
            }
        }
    }

    pub fn get_matching_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any target in `targets` matches `key`.
    pub fn is_key_matched_by<'a>(
        &self,
        key: &DocumentKey,
        mut targets: impl Iterator<Item = &'a TargetId>,
    ) -> bool {
        targets.any(|id| {
            self.matching_keys
                .get(id)
                .is_some_and(|keys| keys.contains(key))
        })
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.values().any(|keys| keys.contains(key))
    }
}
