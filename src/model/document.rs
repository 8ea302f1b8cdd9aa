use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{MapValue, Value};

/// What the cache knows about a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known; the entry only exists as a placeholder.
    Invalid,
    FoundDocument,
    NoDocument,
    /// The document was changed by an acknowledged write whose result is
    /// not yet visible in a snapshot.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A cached or locally synthesized document and its lifecycle metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}
