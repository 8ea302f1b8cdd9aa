//! Application-facing surface: the client, snapshots and write helpers.

mod client;
mod snapshot;
mod user_data;
mod write_batch;

pub use client::{DocSyncClient, ListenerRegistration, PendingWrite, QueryListenerRegistration};
pub use snapshot::{
    DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot, SnapshotMetadata,
};
pub use user_data::{parse_set_data, parse_update_data, SetOptions};
pub use write_batch::WriteBatch;
