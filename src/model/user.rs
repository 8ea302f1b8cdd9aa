use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The principal that owns a mutation queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which this user's queue and overlays are stored.
    pub fn storage_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => f.write_str("<anonymous>"),
        }
    }
}
