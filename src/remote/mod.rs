pub mod bloom_filter;
pub mod credentials;
pub mod datastore;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod rpc_error;
pub mod serializer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use credentials::{
    CredentialChangeListener, CredentialsProvider, CredentialsProviderArc,
    EmptyCredentialsProvider, StaticCredentialsProvider, StreamCredentialProvider, Token,
};
#[cfg(not(target_arch = "wasm32"))]
pub use datastore::WebSocketDatastore;
pub use datastore::{
    InMemoryDatastore, InMemoryServer, LoopbackBackend, ServerStream, StreamCredentials,
    StreamHandle, StreamKind, StreamingDatastore,
};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, StreamEvent, StreamState};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreEvent, RemoteStoreNotification, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
pub use watch_change_aggregator::{
    ExistenceFilterMismatch, TargetMetadataProvider, WatchChangeAggregator,
};
