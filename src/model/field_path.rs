use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, SyncResult};

const DOCUMENT_ID_FIELD: &str = "__name__";

/// Dotted path into the fields of a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> SyncResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(invalid_argument(
                "Field paths need at least one segment and no empty segments",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> SyncResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("Field path cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    /// Pseudo field that orders and filters by document key.
    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_ID_FIELD.to_string()],
        }
    }

    pub fn is_document_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_ID_FIELD
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> SyncResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> SyncResult<FieldPath> {
        Ok(self)
    }
}

impl IntoFieldPath for &FieldPath {
    fn into_field_path(self) -> SyncResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> SyncResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl IntoFieldPath for &str {
    fn into_field_path(self) -> SyncResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}
