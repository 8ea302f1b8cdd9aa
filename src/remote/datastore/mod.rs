//! Transport seam for the listen and write streams.
//!
//! A [`StreamingDatastore`] opens one bidirectional stream per call; frames
//! are the JSON documents produced by
//! [`JsonProtoSerializer`](crate::remote::serializer::JsonProtoSerializer).

use std::sync::Arc;

use crate::error::SyncResult;

pub mod in_memory;
pub mod loopback;
#[cfg(not(target_arch = "wasm32"))]
pub mod websocket;

pub use in_memory::{InMemoryDatastore, InMemoryServer, ServerStream};
pub use loopback::LoopbackBackend;
#[cfg(not(target_arch = "wasm32"))]
pub use websocket::WebSocketDatastore;

#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    use futures::FutureExt;
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    use futures::FutureExt;
    future.boxed()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// Tokens attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>>;

    /// `None` once the peer closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>>;
}

pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>>;
}
