use serde::{Deserialize, Serialize};

use crate::model::DocumentKey;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project and database a client synchronizes with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default_for(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Resource name prefix, `projects/{project}/databases/{database}`.
    pub fn resource_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Fully qualified name of `key` within this database.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "{}/documents/{}",
            self.resource_name(),
            key.path().canonical_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_resource_name() {
        let id = DatabaseId::default_for("demo");
        assert_eq!(id.resource_name(), "projects/demo/databases/(default)");
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert_eq!(
            id.document_name(&key),
            "projects/demo/databases/(default)/documents/rooms/a"
        );
    }
}
