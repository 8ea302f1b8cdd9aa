use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::{DocumentKey, MutableDocument};

/// Orders documents inside a [`DocumentSet`].
pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents kept both by key and in comparator order.
///
/// The comparator must be total; ties fall back to the document key so two
/// distinct documents never compare equal.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// A set ordered by document key only.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left, right| left.key().cmp(right.key())))
    }

    /// An empty set sharing this set's ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in comparator order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.sorted
            .binary_search_by(|candidate| self.compare(candidate, document))
            .ok()
    }

    /// Inserts `document`, replacing any previous version of the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let position = self
            .sorted
            .binary_search_by(|candidate| self.compare(candidate, &document))
            .unwrap_or_else(|insert_at| insert_at);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let position = self.index_of(key)?;
        self.by_key.remove(key);
        Some(self.sorted.remove(position))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn to_vec(&self) -> Vec<MutableDocument> {
        self.sorted.clone()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a MutableDocument;
    type IntoIter = std::slice::Iter<'a, MutableDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::value::{MapValue, Value};
    use std::collections::BTreeMap;

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("rank".to_string(), Value::from_integer(rank));
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::new(fields),
        )
    }

    fn by_rank() -> DocumentSet {
        let rank = FieldPath::from_dot_separated("rank").unwrap();
        DocumentSet::new(Arc::new(move |left, right| {
            let l = left.field(&rank).and_then(Value::as_integer).unwrap_or(0);
            let r = right.field(&rank).and_then(Value::as_integer).unwrap_or(0);
            l.cmp(&r)
        }))
    }

    #[test]
    fn keeps_comparator_order_and_replaces_by_key() {
        let mut set = by_rank();
        set.add(doc("rooms/a", 3));
        set.add(doc("rooms/b", 1));
        set.add(doc("rooms/c", 2));
        let order: Vec<_> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(order, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.add(doc("rooms/a", 0));
        assert_eq!(set.len(), 3);
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/a");
        assert_eq!(set.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));
    }

    #[test]
    fn ties_break_on_key() {
        let mut set = by_rank();
        set.add(doc("rooms/z", 1));
        set.add(doc("rooms/m", 1));
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/m");
        assert!(set.delete(&DocumentKey::from_string("rooms/m").unwrap()).is_some());
        assert_eq!(set.len(), 1);
        assert!(set.delete(&DocumentKey::from_string("rooms/m").unwrap()).is_none());
    }
}
