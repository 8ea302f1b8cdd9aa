//! Offline-first document synchronization.
//!
//! `docsync` keeps a local, transactional cache of a remote document
//! database. Reads are served from the cache, writes are applied locally
//! right away and replayed against the server in order, and query listeners
//! receive a snapshot whenever local writes or server changes affect their
//! results.
//!
//! The layers, from the bottom up:
//!
//! * [`model`] and [`value`]: keys, documents, mutations and field values.
//! * [`local`]: mutation queue, overlays, remote document and target caches,
//!   behind a memory or file persistence backend.
//! * [`remote`]: the listen and write streams, the watch change aggregator
//!   with existence-filter reconciliation, and the datastores.
//! * [`core`]: queries, views and the sync engine tying both sides together.
//! * [`api`]: [`DocSyncClient`], the handle applications use.
//!
//! All engine state lives on one task queue ([`util::AsyncQueue`]); public
//! operations are closures scheduled on it.

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{
    DocSyncClient, DocumentChange, DocumentChangeType, DocumentSnapshot, PendingWrite,
    QueryListenerRegistration, QuerySnapshot, SetOptions, SnapshotMetadata, WriteBatch,
};
pub use crate::core::{ListenOptions, Query};
pub use error::{SyncError, SyncErrorCode, SyncResult};
pub use settings::SyncSettings;
