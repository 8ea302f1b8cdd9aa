use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{invalid_argument, SyncResult};

/// Slash separated path of a collection or document.
///
/// Ordering is segment-wise, so every descendant of a path sorts directly after it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(segments.into_iter().map(Into::into).collect())
    }

    pub fn from_string(path: &str) -> SyncResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.contains("//") {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain empty segments."
            )));
        }
        Ok(Self::from_segments(trimmed.split('/')))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.segments.clone();
        next.extend(segments.into_iter().map(Into::into));
        Self::new(next)
    }

    pub fn without_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self::new(segments)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.len() <= other.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    /// Even-length paths address documents; odd-length ones address collections.
    pub fn is_document_path(&self) -> bool {
        !self.is_empty() && self.len() % 2 == 0
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical_string())
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResourcePath::from_string(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("1"));
        assert!(path.is_document_path());
        assert_eq!(path.canonical_string(), "rooms/eros/messages/1");
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("rooms//eros").unwrap_err();
        assert_eq!(err.code_str(), "docsync/invalid-argument");
    }

    #[test]
    fn descendants_sort_after_their_parent() {
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let a = ResourcePath::from_string("rooms/a").unwrap();
        let nested = ResourcePath::from_string("rooms/a/messages/1").unwrap();
        let b = ResourcePath::from_string("rooms/b").unwrap();
        let mut paths = vec![b.clone(), nested.clone(), rooms.clone(), a.clone()];
        paths.sort();
        assert_eq!(paths, vec![rooms, a, nested, b]);
    }
}
