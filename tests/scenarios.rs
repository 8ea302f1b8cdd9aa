#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;

use common::*;
use docsync::core::Query;
use docsync::model::{MutableDocument, SnapshotVersion, Timestamp};
use docsync::remote::serializer::{JsonProtoSerializer, ListenRequest};
use docsync::remote::watch_change::{DocumentChange, ExistenceFilterChange};
use docsync::remote::{
    EmptyCredentialsProvider, InMemoryDatastore, InMemoryServer, LoopbackBackend, StreamKind,
    TargetChangeState, WatchChange, WatchTargetChange,
};
use docsync::value::{MapValue, Value};
use docsync::{DocumentChangeType, ListenOptions, SetOptions};

#[tokio::test(flavor = "multi_thread")]
async fn offline_create_is_pending_until_acknowledged() {
    let backend = LoopbackBackend::new(database());
    let client = connect(&backend).await;
    client.disable_network().await.unwrap();

    let room = key("rooms/a");
    let pending = client
        .set_document(&room, fields(vec![("x", Value::from_integer(1))]), SetOptions::default())
        .await
        .unwrap();

    let local = client.get_document(&room).await.unwrap();
    assert_eq!(integer_field(&local, "x"), Some(1));
    assert!(local.has_pending_writes());
    assert!(backend.document(&room).is_none());

    client.enable_network().await.unwrap();
    tokio::time::timeout(TIMEOUT, pending.acknowledged())
        .await
        .unwrap()
        .unwrap();

    let acked = client.get_document(&room).await.unwrap();
    assert_eq!(integer_field(&acked, "x"), Some(1));
    assert!(!acked.has_pending_writes());
    assert!(backend.document(&room).is_some());
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn increment_on_top_of_pending_set_is_applied_locally_and_remotely() {
    let backend = LoopbackBackend::new(database());
    let client = connect(&backend).await;
    client.disable_network().await.unwrap();

    let counter = key("counters/c");
    let set = client
        .set_document(&counter, fields(vec![("x", Value::from_integer(1))]), SetOptions::default())
        .await
        .unwrap();
    let increment = client
        .update_document(&counter, fields(vec![("x", Value::increment(Value::from_integer(1)))]))
        .await
        .unwrap();
    assert!(increment.batch_id() > set.batch_id());

    let local = client.get_document(&counter).await.unwrap();
    assert_eq!(integer_field(&local, "x"), Some(2));

    client.enable_network().await.unwrap();
    tokio::time::timeout(TIMEOUT, async {
        set.acknowledged().await.unwrap();
        increment.acknowledged().await.unwrap();
    })
    .await
    .unwrap();

    let acked = client.get_document(&counter).await.unwrap();
    assert_eq!(integer_field(&acked, "x"), Some(2));
    assert!(!acked.has_pending_writes());
    let remote = backend.document(&counter).unwrap();
    assert_eq!(
        remote
            .field(&docsync::model::FieldPath::from_dot_separated("x").unwrap())
            .and_then(Value::as_integer),
        Some(2)
    );
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn server_delete_in_a_listened_window_reports_the_old_index() {
    let backend = LoopbackBackend::new(database());
    let client = connect(&backend).await;
    for path in ["rooms/a", "rooms/b", "rooms/c"] {
        backend.set_document(key(path), MapValue::empty());
    }

    let query = Query::collection("rooms").unwrap();
    let mut listener = client.listen(query, ListenOptions::default()).await.unwrap();
    wait_for(&mut listener, |snapshot| {
        snapshot.len() == 3 && !snapshot.metadata().from_cache()
    })
    .await;

    backend.delete_document(key("rooms/b"));
    let snapshot = wait_for(&mut listener, |snapshot| snapshot.len() == 2).await;
    let changes = snapshot.document_changes(false).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, DocumentChangeType::Removed);
    assert_eq!(changes[0].document.key(), &key("rooms/b"));
    assert_eq!(changes[0].old_index, Some(1));
    assert_eq!(changes[0].new_index, None);

    listener.detach();
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_delete_in_a_listened_window_reports_the_old_index() {
    let backend = LoopbackBackend::new(database());
    let client = connect(&backend).await;
    for path in ["rooms/a", "rooms/b", "rooms/c"] {
        backend.set_document(key(path), MapValue::empty());
    }

    let query = Query::collection("rooms").unwrap();
    let mut listener = client.listen(query, ListenOptions::default()).await.unwrap();
    wait_for(&mut listener, |snapshot| {
        snapshot.len() == 3 && !snapshot.metadata().from_cache()
    })
    .await;

    let pending = client.delete_document(&key("rooms/b")).await.unwrap();
    let snapshot = wait_for(&mut listener, |snapshot| snapshot.len() == 2).await;
    let changes = snapshot.document_changes(false).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, DocumentChangeType::Removed);
    assert_eq!(changes[0].document.key(), &key("rooms/b"));
    assert_eq!(changes[0].old_index, Some(1));
    assert_eq!(changes[0].new_index, None);

    tokio::time::timeout(TIMEOUT, pending.acknowledged())
        .await
        .unwrap()
        .unwrap();
    assert!(backend.document(&key("rooms/b")).is_none());
    assert!(backend.document(&key("rooms/a")).is_some());

    listener.detach();
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_sharing_a_backend_converge() {
    let backend = LoopbackBackend::new(database());
    let first = connect(&backend).await;
    let second = connect(&backend).await;
    let query = Query::collection("rooms").unwrap();
    let mut first_listener = first.listen(query.clone(), ListenOptions::default()).await.unwrap();
    let mut second_listener = second.listen(query, ListenOptions::default()).await.unwrap();

    let a = first
        .set_document(&key("rooms/a"), fields(vec![("n", Value::from_integer(1))]), SetOptions::default())
        .await
        .unwrap();
    let b = second
        .set_document(&key("rooms/b"), fields(vec![("n", Value::from_integer(2))]), SetOptions::default())
        .await
        .unwrap();
    tokio::time::timeout(TIMEOUT, async {
        a.acknowledged().await.unwrap();
        b.acknowledged().await.unwrap();
    })
    .await
    .unwrap();

    let settled = |snapshot: &docsync::QuerySnapshot| {
        snapshot.len() == 2 && !snapshot.metadata().has_pending_writes()
    };
    let seen_by_first = wait_for(&mut first_listener, settled).await;
    let seen_by_second = wait_for(&mut second_listener, settled).await;
    let contents = |snapshot: &docsync::QuerySnapshot| {
        snapshot
            .documents()
            .iter()
            .map(|document| (document.key().clone(), integer_field(document, "n")))
            .collect::<Vec<_>>()
    };
    assert_eq!(contents(&seen_by_first), contents(&seen_by_second));

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Answers every target with an empty current result, except the first
/// query target, which gets three documents followed by an existence filter
/// claiming it is empty.
async fn serve_stale_count(server: InMemoryServer) {
    let serializer = JsonProtoSerializer::new(database());
    let Some(stream) = server.accept_kind(StreamKind::Listen).await else {
        return;
    };
    let mut clock = 1;
    let mut seeded = false;
    let send = |change: WatchChange| {
        let frame = serializer.encode_watch_change(&change);
        let stream = &stream;
        async move { stream.send_json(&frame).await }
    };

    while let Some(frame) = stream.recv_json().await {
        let Ok(request) = serializer.decode_listen_request(&frame) else {
            continue;
        };
        match request {
            ListenRequest::RemoveTarget(target_id) => {
                let removed = WatchTargetChange::new(TargetChangeState::Remove, vec![target_id]);
                let _ = send(WatchChange::TargetChange(removed)).await;
            }
            ListenRequest::AddTarget(add) => {
                let target_id = add.target_id;
                let added = WatchTargetChange::new(TargetChangeState::Add, vec![target_id]);
                let _ = send(WatchChange::TargetChange(added)).await;

                let seed = !seeded && !add.target.is_document_target();
                if seed {
                    seeded = true;
                    for path in ["rooms/a", "rooms/b", "rooms/c"] {
                        let document =
                            MutableDocument::new_found(key(path), version(clock), MapValue::empty());
                        let change = DocumentChange {
                            updated_target_ids: vec![target_id],
                            removed_target_ids: vec![],
                            key: key(path),
                            document: Some(document),
                        };
                        let _ = send(WatchChange::DocumentChange(change)).await;
                    }
                }

                clock += 1;
                let current = WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                    .with_resume_token(format!("token-{clock}").into_bytes())
                    .with_read_time(version(clock));
                let _ = send(WatchChange::TargetChange(current)).await;

                if seed {
                    let filter = ExistenceFilterChange {
                        target_id,
                        count: 0,
                        unchanged_names: None,
                    };
                    let _ = send(WatchChange::ExistenceFilter(filter)).await;
                    clock += 1;
                    let boundary = WatchTargetChange::new(TargetChangeState::NoChange, vec![])
                        .with_read_time(version(clock));
                    let _ = send(WatchChange::TargetChange(boundary)).await;
                }
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_mismatch_requeries_and_drops_stale_documents() {
    let (datastore, server) = InMemoryDatastore::new();
    tokio::spawn(serve_stale_count(server));
    let client = client_for(datastore, Arc::new(EmptyCredentialsProvider)).await;

    let query = Query::collection("rooms").unwrap();
    let mut listener = client.listen(query, ListenOptions::default()).await.unwrap();
    wait_for(&mut listener, |snapshot| snapshot.len() == 3).await;

    let emptied = wait_for(&mut listener, |snapshot| snapshot.is_empty()).await;
    assert!(emptied.document_changes(false).unwrap().iter().all(|change| {
        change.change_type == DocumentChangeType::Removed && change.new_index.is_none()
    }));

    listener.detach();
    client.shutdown().await.unwrap();
}
