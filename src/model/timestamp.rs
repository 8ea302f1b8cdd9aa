use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, SyncResult};

/// Wall-clock instant with nanosecond precision. Nanos are always in `0..1e9`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let extra_seconds = nanos.div_euclid(1_000_000_000);
        Self {
            seconds: seconds + extra_seconds as i64,
            nanos: nanos.rem_euclid(1_000_000_000),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(
            millis.div_euclid(1_000),
            (millis.rem_euclid(1_000) * 1_000_000) as i32,
        )
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + (self.nanos / 1_000_000) as i64
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::new(self.seconds as u64, self.nanos as u32)
        } else {
            UNIX_EPOCH - Duration::from_secs((-self.seconds) as u64)
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    /// RFC 3339 rendering with nanosecond precision, as used on the wire.
    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_opt(self.seconds, self.nanos as u32)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse_rfc3339(value: &str) -> SyncResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp '{value}': {err}")))?
            .with_timezone(&Utc);
        Ok(Self::new(
            parsed.timestamp(),
            parsed.timestamp_subsec_nanos() as i32,
        ))
    }
}

/// Logical server time ordering document states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// The version of documents that were never seen from the server.
    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }
}
