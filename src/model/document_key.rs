use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{invalid_argument, SyncResult};
use crate::model::ResourcePath;

/// Immutable path identifying a single document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> SyncResult<Self> {
        if !path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid document key ({path}). Document keys need an even number of segments."
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> SyncResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Path of the collection that directly contains the document.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    pub fn collection_group(&self) -> &str {
        self.path
            .segment(self.path.len() - 2)
            .unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.canonical_string())
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DocumentKey::from_string(&raw).map_err(serde::de::Error::custom)
    }
}
