//! Builders shared by the unit tests.

use std::collections::BTreeMap;

use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{MapValue, Value};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub fn fields(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}

pub fn map(entries: Vec<(&str, Value)>) -> MapValue {
    MapValue::new(fields(entries))
}

/// A found document at `seconds` holding `entries`.
pub fn doc(path: &str, seconds: i64, entries: Vec<(&str, Value)>) -> MutableDocument {
    MutableDocument::new_found(key(path), version(seconds), map(entries))
}

pub fn deleted_doc(path: &str, seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(path), version(seconds))
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::*;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::sync::Arc;

    use crate::api::DocSyncClient;
    use crate::model::DatabaseId;
    use crate::remote::{EmptyCredentialsProvider, LoopbackBackend};
    use crate::settings::SyncSettings;

    pub fn test_database() -> DatabaseId {
        DatabaseId::new("test-project", "(default)")
    }

    /// A client connected to a fresh loopback backend.
    pub async fn loopback_client() -> (DocSyncClient, LoopbackBackend) {
        let (datastore, backend) = LoopbackBackend::start(test_database());
        let client = DocSyncClient::new(
            SyncSettings::new(test_database()),
            Arc::new(datastore),
            Arc::new(EmptyCredentialsProvider),
            None,
        )
        .await
        .unwrap();
        (client, backend)
    }
}
