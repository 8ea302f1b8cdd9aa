use std::collections::BTreeSet;

use crate::model::DocumentKey;

/// Two-way index of (document key, owner id) references.
///
/// Owners are target ids for local view pins and limbo resolutions.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference owned by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(owner, _)| *owner < id)
            .take_while(|(owner, _)| *owner == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.by_key.iter().map(|(key, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn keys_stay_referenced_until_last_owner_leaves() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("a/1"), 1);
        refs.add_reference(key("a/1"), 3);
        refs.add_reference(key("a/2"), 3);

        refs.remove_reference(&key("a/1"), 1);
        assert!(refs.contains_key(&key("a/1")));

        let removed = refs.remove_references_for_id(3);
        assert_eq!(removed.len(), 2);
        assert!(!refs.contains_key(&key("a/1")));
        assert!(refs.is_empty());
    }

    #[test]
    fn references_for_id_are_scoped() {
        let mut refs = ReferenceSet::new();
        refs.add_references([&key("a/1"), &key("a/2")], 2);
        refs.add_reference(key("a/3"), 4);
        assert_eq!(refs.references_for_id(2).len(), 2);
        assert_eq!(refs.references_for_id(4).len(), 1);
        assert!(refs.references_for_id(6).is_empty());
    }
}
