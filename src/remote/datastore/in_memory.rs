use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use serde_json::Value as JsonValue;

use super::{
    box_stream_future, StreamCredentials, StreamHandle, StreamKind, StreamingDatastore,
    StreamingFuture,
};
use crate::error::{unavailable, SyncError, SyncResult};

#[derive(Clone, Debug)]
enum Frame {
    Data(Vec<u8>),
    Error(SyncError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channel-backed datastore. Every opened stream surfaces on the paired
/// [`InMemoryServer`], which plays the remote service.
pub struct InMemoryDatastore {
    connections: Sender<ServerStream>,
    open_failures: Mutex<VecDeque<SyncError>>,
}

impl InMemoryDatastore {
    pub fn new() -> (Self, InMemoryServer) {
        let (connections, incoming) = async_channel::unbounded();
        let datastore = Self {
            connections,
            open_failures: Mutex::new(VecDeque::new()),
        };
        let server = InMemoryServer {
            incoming,
            parked: Mutex::new(VecDeque::new()),
        };
        (datastore, server)
    }

    /// Makes the next `open_stream` call fail with `error`.
    pub fn fail_next_open(&self, error: SyncError) {
        lock(&self.open_failures).push_back(error);
    }
}

impl StreamingDatastore for InMemoryDatastore {
    fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>> {
        let failure = lock(&self.open_failures).pop_front();
        let connections = self.connections.clone();
        box_stream_future(async move {
            if let Some(error) = failure {
                return Err(error);
            }
            let (to_server, from_client) = async_channel::unbounded();
            let (to_client, from_server) = async_channel::unbounded();
            let server_side = ServerStream {
                kind,
                credentials,
                inbound: from_client,
                outbound: to_client,
            };
            connections
                .send(server_side)
                .await
                .map_err(|_| unavailable("The in-memory backend is gone"))?;
            Ok(Arc::new(InMemoryStreamHandle {
                inbound: from_server,
                outbound: to_server,
            }) as Arc<dyn StreamHandle>)
        })
    }
}

struct InMemoryStreamHandle {
    inbound: Receiver<Frame>,
    outbound: Sender<Frame>,
}

impl StreamHandle for InMemoryStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            self.outbound
                .send(Frame::Data(payload))
                .await
                .map_err(|_| unavailable("Stream closed by the backend"))
        })
    }

    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>> {
        box_stream_future(async move {
            match self.inbound.recv().await {
                Ok(Frame::Data(payload)) => Some(Ok(payload)),
                Ok(Frame::Error(error)) => Some(Err(error)),
                Err(_) => None,
            }
        })
    }

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>> {
        self.outbound.close();
        self.inbound.close();
        box_stream_future(async { Ok(()) })
    }
}

impl Drop for InMemoryStreamHandle {
    fn drop(&mut self) {
        self.outbound.close();
        self.inbound.close();
    }
}

/// Accepting end of an [`InMemoryDatastore`].
pub struct InMemoryServer {
    incoming: Receiver<ServerStream>,
    parked: Mutex<VecDeque<ServerStream>>,
}

impl InMemoryServer {
    /// Next stream opened by the client, in open order.
    pub async fn accept(&self) -> Option<ServerStream> {
        if let Some(stream) = lock(&self.parked).pop_front() {
            return Some(stream);
        }
        self.incoming.recv().await.ok()
    }

    /// Next stream of `kind`; streams of the other kind stay queued.
    pub async fn accept_kind(&self, kind: StreamKind) -> Option<ServerStream> {
        {
            let mut parked = lock(&self.parked);
            if let Some(position) = parked.iter().position(|stream| stream.kind == kind) {
                return parked.remove(position);
            }
        }
        loop {
            let stream = self.incoming.recv().await.ok()?;
            if stream.kind == kind {
                return Some(stream);
            }
            lock(&self.parked).push_back(stream);
        }
    }

    pub fn try_accept(&self) -> Option<ServerStream> {
        if let Some(stream) = lock(&self.parked).pop_front() {
            return Some(stream);
        }
        self.incoming.try_recv().ok()
    }
}

/// Server end of one stream.
pub struct ServerStream {
    kind: StreamKind,
    credentials: StreamCredentials,
    inbound: Receiver<Frame>,
    outbound: Sender<Frame>,
}

impl ServerStream {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn credentials(&self) -> &StreamCredentials {
        &self.credentials
    }

    /// `None` once the client closed the stream.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        match self.inbound.recv().await {
            Ok(Frame::Data(payload)) => Some(payload),
            Ok(Frame::Error(_)) | Err(_) => None,
        }
    }

    pub async fn recv_json(&self) -> Option<JsonValue> {
        let payload = self.recv().await?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("in-memory server received malformed frame: {err}");
                None
            }
        }
    }

    pub async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(Frame::Data(payload))
            .await
            .map_err(|_| unavailable("Stream closed by the client"))
    }

    pub async fn send_json(&self, value: &JsonValue) -> SyncResult<()> {
        self.send(value.to_string().into_bytes()).await
    }

    /// Ends the stream with `error`.
    pub async fn fail(&self, error: SyncError) {
        let _ = self.outbound.send(Frame::Error(error)).await;
        self.close();
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::{resource_exhausted, SyncErrorCode};

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (datastore, server) = InMemoryDatastore::new();
        let client = datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .expect("open");
        let peer = server.accept().await.expect("accept");
        assert_eq!(peer.kind(), StreamKind::Listen);

        client.send(b"hello".to_vec()).await.expect("send");
        assert_eq!(peer.recv().await.expect("frame"), b"hello");

        peer.send(b"world".to_vec()).await.expect("reply");
        let reply = client.next().await.expect("frame").expect("payload");
        assert_eq!(reply, b"world");
    }

    #[tokio::test]
    async fn server_failure_reaches_client_then_closes() {
        let (datastore, server) = InMemoryDatastore::new();
        let client = datastore
            .open_stream(StreamKind::Write, StreamCredentials::default())
            .await
            .expect("open");
        let peer = server.accept().await.expect("accept");
        peer.fail(resource_exhausted("slow down")).await;

        let error = client.next().await.expect("frame").unwrap_err();
        assert_eq!(error.code, SyncErrorCode::ResourceExhausted);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn client_close_ends_server_reads() {
        let (datastore, server) = InMemoryDatastore::new();
        let client = datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .expect("open");
        let peer = server.accept().await.expect("accept");
        client.close().await.expect("close");
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn queued_open_failures_are_returned_in_order() {
        let (datastore, server) = InMemoryDatastore::new();
        datastore.fail_next_open(unavailable("offline"));
        let first = datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await;
        assert_eq!(first.err().map(|err| err.code), Some(SyncErrorCode::Unavailable));
        assert!(datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .is_ok());
        assert!(server.try_accept().is_some());
    }

    #[tokio::test]
    async fn accept_kind_parks_other_streams() {
        let (datastore, server) = InMemoryDatastore::new();
        let _write = datastore
            .open_stream(StreamKind::Write, StreamCredentials::default())
            .await
            .expect("write");
        let _listen = datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .expect("listen");
        let listen = server.accept_kind(StreamKind::Listen).await.expect("listen");
        assert_eq!(listen.kind(), StreamKind::Listen);
        let write = server.accept().await.expect("write");
        assert_eq!(write.kind(), StreamKind::Write);
    }
}
