use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::query::{FieldFilter, OrderBy};
use crate::model::{DocumentKey, ResourcePath, SnapshotVersion};

pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// The server-facing shape of a query: what the listen stream watches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
}

impl Target {
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        self.collection_group.is_none() && self.path.is_document_path() && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            let _ = write!(
                id,
                "{}{}",
                order.field.canonical_string(),
                match order.direction {
                    crate::core::query::Direction::Ascending => "asc",
                    crate::core::query::Direction::Descending => "desc",
                }
            );
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Requery after the server reported a different document count.
    ExistenceFilterMismatch,
    /// Requery after a bloom filter failed to reconcile the count.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// A target plus everything the cache tracks about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "crate::util::base64_serde")]
    pub resume_token: Vec<u8>,
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A fresh token invalidates the count the server last confirmed.
    pub fn with_resume_token(mut self, token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, count: Option<i32>) -> Self {
        self.expected_count = count;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Hands out target ids of one parity: even for query targets, odd for
/// limbo resolution.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids strictly above `highest`.
    pub fn for_target_cache(highest: TargetId) -> Self {
        let mut next_id = highest + 1;
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self { next_id: next_id.max(2) }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
