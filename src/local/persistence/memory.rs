use crate::error::SyncResult;
use crate::local::persistence::{LocalState, PersistenceBackend, StateChanges};

/// Keeps nothing beyond the lifetime of the client.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    commits: u64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits
    }
}

impl PersistenceBackend for MemoryPersistence {
    fn load(&mut self) -> SyncResult<Option<LocalState>> {
        Ok(None)
    }

    fn commit(&mut self, _state: &LocalState, _changes: &StateChanges) -> SyncResult<()> {
        self.commits += 1;
        Ok(())
    }

    fn acquire_lease(&mut self) -> SyncResult<()> {
        Ok(())
    }

    fn release_lease(&mut self) -> SyncResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
