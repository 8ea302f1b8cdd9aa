#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use docsync::model::{DatabaseId, DocumentKey};
use docsync::remote::{
    CredentialsProviderArc, EmptyCredentialsProvider, InMemoryDatastore, LoopbackBackend,
};
use docsync::value::Value;
use docsync::{DocSyncClient, QueryListenerRegistration, QuerySnapshot, SyncSettings};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn database() -> DatabaseId {
    DatabaseId::new("integration", "(default)")
}

pub fn settings() -> SyncSettings {
    SyncSettings::new(database())
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn fields(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}

pub async fn client_for(datastore: InMemoryDatastore, auth: CredentialsProviderArc) -> DocSyncClient {
    DocSyncClient::new(settings(), Arc::new(datastore), auth, None)
        .await
        .unwrap()
}

/// A client served by `backend`. Several clients may share one backend.
pub async fn connect(backend: &LoopbackBackend) -> DocSyncClient {
    let (datastore, server) = InMemoryDatastore::new();
    backend.serve(server);
    client_for(datastore, Arc::new(EmptyCredentialsProvider)).await
}

pub async fn next_snapshot(listener: &mut QueryListenerRegistration) -> QuerySnapshot {
    tokio::time::timeout(TIMEOUT, listener.next())
        .await
        .expect("no snapshot in time")
        .expect("listener closed")
        .expect("listener failed")
}

/// Reads snapshots until one satisfies `done`.
pub async fn wait_for(
    listener: &mut QueryListenerRegistration,
    done: impl Fn(&QuerySnapshot) -> bool,
) -> QuerySnapshot {
    loop {
        let snapshot = next_snapshot(listener).await;
        if done(&snapshot) {
            return snapshot;
        }
    }
}

pub fn integer_field(snapshot: &docsync::DocumentSnapshot, path: &str) -> Option<i64> {
    snapshot
        .get(path)
        .unwrap()
        .and_then(|value| value.as_integer())
}
