use std::collections::BTreeMap;
use std::sync::Arc;

use async_channel::Receiver;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::api::snapshot::{DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
use crate::api::user_data::{parse_set_data, parse_update_data, SetOptions};
use crate::api::write_batch::WriteBatch;
use crate::core::{ListenOptions, ListenerId, Query, SyncEngine, ViewSnapshotSink, WriteAcknowledgement};
use crate::error::{cancelled, SyncResult};
use crate::local::LocalStore;
use crate::model::{BatchId, DatabaseId, DocumentKey, Mutation, User};
use crate::remote::{
    CredentialsProviderArc, OnlineState, RemoteStore, StreamCredentialProvider, StreamingDatastore,
};
use crate::settings::SyncSettings;
use crate::util::async_queue::AsyncQueue;
use crate::value::Value;

const AUTO_ID_LENGTH: usize = 20;

/// Entry point of the library: an offline-first view of one database.
///
/// Every operation is serialized through a single task queue that owns the
/// sync engine. Reads are answered from the local cache; writes are applied
/// locally right away and acknowledged by the server later.
#[derive(Clone)]
pub struct DocSyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queue: AsyncQueue<SyncEngine>,
    database_id: DatabaseId,
}

impl DocSyncClient {
    /// Opens the local cache and starts talking to `datastore`.
    ///
    /// `auth` supplies the user and the token attached to each stream; its
    /// change listener switches the client between users' mutation queues.
    pub async fn new(
        settings: SyncSettings,
        datastore: Arc<dyn StreamingDatastore>,
        auth: CredentialsProviderArc,
        app_check: Option<CredentialsProviderArc>,
    ) -> SyncResult<Self> {
        let local_store = LocalStore::new(&settings, User::unauthenticated());
        let remote_store = RemoteStore::new(
            &settings,
            datastore,
            StreamCredentialProvider::new(Arc::clone(&auth), app_check),
        );
        let engine = SyncEngine::new(&settings, local_store, remote_store);
        let queue = AsyncQueue::start(engine);

        let events = queue.clone();
        queue
            .run_retryable(move |engine| {
                let retries = events.clone();
                engine.set_retry_scheduler(Arc::new(move |delay| {
                    retries.enqueue_after(delay, |engine| engine.retry_notifications());
                }));
                let events = events.clone();
                engine.set_event_sink(Arc::new(move |event| {
                    let delivered =
                        events.enqueue(move |engine| engine.handle_remote_store_event(event));
                    if !delivered {
                        log::debug!("remote store event dropped after shutdown");
                    }
                }));
                engine.start()
            })
            .await?;

        let users = queue.clone();
        auth.set_change_listener(Arc::new(move |user| {
            if !users.enqueue(move |engine| engine.handle_user_change(user)) {
                log::debug!("user change ignored after shutdown");
            }
        }));

        log::debug!("client started for {}", settings.database.resource_name());
        Ok(Self {
            inner: Arc::new(ClientInner {
                queue,
                database_id: settings.database,
            }),
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    // Reads

    /// The cached document with local writes applied. Never waits for the
    /// network.
    pub async fn get_document(&self, key: &DocumentKey) -> SyncResult<DocumentSnapshot> {
        let key = key.clone();
        let document = self
            .inner
            .queue
            .run(move |engine| Ok(engine.get_document(&key)))
            .await?;
        let metadata = SnapshotMetadata::new(true, document.has_local_mutations());
        Ok(DocumentSnapshot::from_document(&document, metadata))
    }

    /// Runs `query` against the local cache.
    pub async fn get_documents(&self, query: &Query) -> SyncResult<QuerySnapshot> {
        let query = query.clone();
        let snapshot = self
            .inner
            .queue
            .run(move |engine| engine.get_documents(&query))
            .await?;
        Ok(QuerySnapshot::new(snapshot))
    }

    // Writes

    /// Creates a document with a generated id in `collection`.
    pub async fn add_document(
        &self,
        collection: &str,
        data: BTreeMap<String, Value>,
    ) -> SyncResult<(DocumentKey, PendingWrite)> {
        let key = DocumentKey::from_string(&format!("{collection}/{}", generate_auto_id()))?;
        let mutation = parse_set_data(key.clone(), data, &SetOptions::default())?;
        let pending = self.write(vec![mutation]).await?;
        Ok((key, pending))
    }

    pub async fn set_document(
        &self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
        options: SetOptions,
    ) -> SyncResult<PendingWrite> {
        let mutation = parse_set_data(key.clone(), data, &options)?;
        self.write(vec![mutation]).await
    }

    /// Updates fields of an existing document. Keys are dot-separated paths.
    pub async fn update_document(
        &self,
        key: &DocumentKey,
        fields: BTreeMap<String, Value>,
    ) -> SyncResult<PendingWrite> {
        let mutation = parse_update_data(key.clone(), fields)?;
        self.write(vec![mutation]).await
    }

    pub async fn delete_document(&self, key: &DocumentKey) -> SyncResult<PendingWrite> {
        self.write(vec![Mutation::delete(key.clone())]).await
    }

    pub fn write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    pub(crate) async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<PendingWrite> {
        let (batch_id, acknowledgement) = self
            .inner
            .queue
            .run_retryable(move |engine| engine.write(mutations.clone()))
            .await?;
        Ok(PendingWrite {
            batch_id,
            acknowledgement,
        })
    }

    // Listening

    /// Streams snapshots of `query`: first from the cache, then every change.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
    ) -> SyncResult<QueryListenerRegistration> {
        let (sender, receiver) = async_channel::unbounded();
        let registration = self
            .listen_with_callback(query, options, move |snapshot| {
                let _ = sender.try_send(snapshot);
            })
            .await?;
        Ok(QueryListenerRegistration {
            registration,
            receiver,
        })
    }

    /// Like [`listen`](Self::listen), but calls `callback` on the queue task.
    /// The callback must not block.
    pub async fn listen_with_callback<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> SyncResult<ListenerRegistration>
    where
        F: Fn(SyncResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        let sink: ViewSnapshotSink =
            Arc::new(move |snapshot| callback(snapshot.map(QuerySnapshot::new)));
        let listener_id = self
            .inner
            .queue
            .run(move |engine| engine.listen(query, options, sink))
            .await?;
        Ok(ListenerRegistration {
            queue: self.inner.queue.clone(),
            listener_id,
            detached: false,
        })
    }

    // Network

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner
            .queue
            .run(|engine| {
                engine.enable_network();
                Ok(())
            })
            .await
    }

    /// Stops both streams. Reads and writes keep working against the cache.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner
            .queue
            .run(|engine| {
                engine.disable_network();
                Ok(())
            })
            .await
    }

    /// Reports a connectivity change observed by the host platform.
    pub async fn set_connectivity(&self, connected: bool) -> SyncResult<()> {
        self.inner
            .queue
            .run(move |engine| {
                engine.set_connectivity(connected);
                Ok(())
            })
            .await
    }

    pub async fn online_state(&self) -> SyncResult<OnlineState> {
        self.inner
            .queue
            .run(|engine| Ok(engine.online_state()))
            .await
    }

    pub async fn user(&self) -> SyncResult<User> {
        self.inner
            .queue
            .run(|engine| Ok(engine.user().clone()))
            .await
    }

    /// Stops the streams and closes the local cache. Pending write futures
    /// resolve with a cancellation error. Calling it twice is a no-op.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if self.inner.queue.is_shut_down() {
            return Ok(());
        }
        let result = self.inner.queue.run(|engine| engine.shutdown()).await;
        self.inner.queue.shutdown();
        result
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

/// A write applied locally and queued for the server.
#[must_use = "the write is queued either way; await `acknowledged` to observe the server result"]
pub struct PendingWrite {
    batch_id: BatchId,
    acknowledgement: WriteAcknowledgement,
}

impl PendingWrite {
    pub(crate) fn new(batch_id: BatchId, acknowledgement: WriteAcknowledgement) -> Self {
        Self {
            batch_id,
            acknowledgement,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Resolves once the server accepted the write, or with the error it was
    /// rejected with.
    pub async fn acknowledged(self) -> SyncResult<()> {
        self.acknowledgement
            .await
            .map_err(|_| cancelled("The client was shut down before the write was acknowledged"))?
    }
}

/// Keeps a listener attached. Dropping it detaches the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue<SyncEngine>,
    listener_id: ListenerId,
    detached: bool,
}

impl ListenerRegistration {
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let listener_id = self.listener_id;
        self.queue.enqueue(move |engine| {
            if let Err(err) = engine.unlisten(listener_id) {
                log::warn!("failed to release listener {listener_id}: {err}");
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A listener whose snapshots are read with [`next`](Self::next).
pub struct QueryListenerRegistration {
    registration: ListenerRegistration,
    receiver: Receiver<SyncResult<QuerySnapshot>>,
}

impl QueryListenerRegistration {
    /// The next snapshot, or `None` once the listener was detached or ended
    /// with an error.
    pub async fn next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        self.receiver.recv().await.ok()
    }

    pub fn try_next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        self.receiver.try_recv().ok()
    }

    pub fn detach(&mut self) {
        self.registration.detach();
    }
}
