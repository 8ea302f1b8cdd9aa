use crate::core::target::TargetId;
use crate::error::SyncError;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// One decoded message from the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every target".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<SyncError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, token: Vec<u8>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: SyncError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered or changed within the listed targets.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// A found document; `None` only when the server omitted the payload.
    pub document: Option<MutableDocument>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document left the targets without being deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<TargetId>,
}

/// Raw bloom filter payload, validated lazily by the aggregator.
#[derive(Clone, Debug, PartialEq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    /// `None` when absent or undecodable.
    pub unchanged_names: Option<BloomFilterPayload>,
}
