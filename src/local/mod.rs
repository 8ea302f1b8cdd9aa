pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;

pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use persistence::{
    FilePersistence, LocalState, MemoryPersistence, Persistence, PersistenceBackend,
};
pub use query_engine::{QueryEngine, QueryStrategy};
pub use reference_set::ReferenceSet;
