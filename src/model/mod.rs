mod database_id;
mod document;
mod document_set;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::{calculate_overlay_mutation, Overlay};
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};
pub use user::User;

/// Document lookups keyed and ordered by document key.
pub type DocumentMap = std::collections::BTreeMap<DocumentKey, MutableDocument>;
