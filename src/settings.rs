use std::path::PathBuf;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::model::{DatabaseId, FieldPath};

/// Where the local cache lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceSettings {
    /// Nothing survives the client.
    Memory,
    /// JSON state plus an owner lease under `directory`.
    File { directory: PathBuf },
}

/// When unreferenced documents leave the remote document cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GarbageCollectionPolicy {
    Eager,
    Bounded { max_documents: usize },
}

impl Default for GarbageCollectionPolicy {
    fn default() -> Self {
        GarbageCollectionPolicy::Bounded {
            max_documents: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

/// A single-field equality index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndexSettings {
    pub collection_group: String,
    pub field: FieldPath,
}

impl FieldIndexSettings {
    pub fn new(collection_group: impl Into<String>, field: FieldPath) -> Self {
        Self {
            collection_group: collection_group.into(),
            field,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub database: DatabaseId,
    pub persistence: PersistenceSettings,
    pub gc_policy: GarbageCollectionPolicy,
    pub backoff: BackoffSettings,
    pub idle_timeout: Duration,
    pub online_state_timeout: Duration,
    pub max_concurrent_limbo_resolutions: usize,
    pub max_stream_retries: u32,
    pub max_pending_writes: usize,
    pub field_indexes: Vec<FieldIndexSettings>,
    pub lease_duration: Duration,
    pub owner_id: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new(DatabaseId::default_for("docsync-local"))
    }
}

impl SyncSettings {
    pub fn new(database: DatabaseId) -> Self {
        Self {
            database,
            persistence: PersistenceSettings::Memory,
            gc_policy: GarbageCollectionPolicy::default(),
            backoff: BackoffSettings::default(),
            idle_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
            max_concurrent_limbo_resolutions: 100,
            max_stream_retries: 10,
            max_pending_writes: 10,
            field_indexes: Vec::new(),
            lease_duration: Duration::from_secs(5),
            owner_id: random_owner_id(),
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_gc_policy(mut self, policy: GarbageCollectionPolicy) -> Self {
        self.gc_policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_max_stream_retries(mut self, max: u32) -> Self {
        self.max_stream_retries = max;
        self
    }

    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = max.max(1);
        self
    }

    pub fn with_field_index(mut self, index: FieldIndexSettings) -> Self {
        self.field_indexes.push(index);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }
}

fn random_owner_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SyncSettings::default();
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff.factor, 1.5);
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.online_state_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.max_pending_writes, 10);
        assert_eq!(settings.persistence, PersistenceSettings::Memory);
        assert_eq!(settings.owner_id.len(), 16);
    }

    #[test]
    fn builder_setters_override_fields() {
        let settings = SyncSettings::default()
            .with_gc_policy(GarbageCollectionPolicy::Eager)
            .with_max_pending_writes(0)
            .with_owner_id("tab-1");
        assert_eq!(settings.gc_policy, GarbageCollectionPolicy::Eager);
        assert_eq!(settings.max_pending_writes, 1);
        assert_eq!(settings.owner_id, "tab-1");
    }
}
