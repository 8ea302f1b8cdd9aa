pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerId, ViewSnapshotSink};
pub use query::{Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use sync_engine::{SyncEngine, WriteAcknowledgement};
pub use target::{Target, TargetData, TargetId, TargetPurpose};
pub use view::{LimboDocumentChange, View, ViewChange};
pub use view_snapshot::{ChangeType, DocumentViewChange, SyncState, ViewSnapshot};
