use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::core::query::{Direction, FieldFilter, FilterOperator, OrderBy};
use crate::core::target::{Target, TargetData, TargetId, TargetPurpose};
use crate::error::{invalid_argument, SyncResult};
use crate::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, MutableDocument,
    Mutation, MutationKind, MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::remote::rpc_error::decode_status;
use crate::remote::watch_change::{
    BloomFilterPayload, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange,
    TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::util::double_serde;
use crate::value::{BytesValue, MapValue, Value, ValueKind};

/// Decoded reply on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Option<SnapshotVersion>,
    pub write_results: Vec<MutationResult>,
}

impl WriteResponse {
    /// Handshake replies and keepalive echoes carry only a token.
    pub fn is_token_only(&self) -> bool {
        self.commit_version.is_none() && self.write_results.is_empty()
    }
}

/// `addTarget` as seen by a server.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenTargetRequest {
    pub target_id: TargetId,
    pub target: Target,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub expected_count: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget(ListenTargetRequest),
    RemoveTarget(TargetId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    Handshake,
    Write {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

/// Maps model types to and from the JSON frames exchanged on the streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.resource_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.document_name(key)
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    fn decode_resource_path(&self, name: &str) -> SyncResult<ResourcePath> {
        let root = self.documents_root();
        if name == root {
            return Ok(ResourcePath::root());
        }
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Resource name '{name}' is not in database {}",
                    self.database_name()
                ))
            })?;
        ResourcePath::from_string(relative)
    }

    pub fn decode_document_key(&self, name: &str) -> SyncResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_value(&self, value: &Value) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> SyncResult<Value> {
        decode_value(value)
    }

    pub fn encode_document(&self, key: &DocumentKey, data: &MapValue, version: SnapshotVersion) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(data),
            "updateTime": encode_version(version),
        })
    }

    pub fn decode_found_document(&self, value: &JsonValue) -> SyncResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document missing name"))?;
        let key = self.decode_document_key(name)?;
        let version = value
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(decode_version)
            .transpose()?
            .ok_or_else(|| invalid_argument("document missing updateTime"))?;
        let data = decode_map_value(value)?;
        Ok(MutableDocument::new_found(key, version, data))
    }

    // Writes

    fn encode_precondition(precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": encode_version(*version) }))
            }
        }
    }

    fn decode_precondition(value: Option<&JsonValue>) -> SyncResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if let Some(update_time) = value.get("updateTime").and_then(JsonValue::as_str) {
            return Ok(Precondition::UpdateTime(decode_version(update_time)?));
        }
        Ok(Precondition::None)
    }

    fn encode_field_transforms(&self, transforms: &[FieldTransform]) -> Vec<JsonValue> {
        transforms
            .iter()
            .map(|transform| {
                let field_path = transform.field_path().canonical_string();
                match transform.operation() {
                    TransformOperation::ServerTimestamp => json!({
                        "fieldPath": field_path,
                        "setToServerValue": "REQUEST_TIME"
                    }),
                    TransformOperation::ArrayUnion(elements) => json!({
                        "fieldPath": field_path,
                        "appendMissingElements": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        }
                    }),
                    TransformOperation::ArrayRemove(elements) => json!({
                        "fieldPath": field_path,
                        "removeAllFromArray": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        }
                    }),
                    TransformOperation::NumericIncrement(operand) => json!({
                        "fieldPath": field_path,
                        "increment": encode_value(operand)
                    }),
                }
            })
            .collect()
    }

    fn decode_field_transform(value: &JsonValue) -> SyncResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform missing fieldPath"))?;
        let field_path = FieldPath::from_dot_separated(field_path)?;
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(union)?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(remove)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field_path, operation))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(mutation.key()),
                        "fields": encode_map_fields(value)
                    }),
                );
            }
            MutationKind::Patch { data, mask } => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(mutation.key()),
                        "fields": encode_map_fields(data)
                    }),
                );
                let paths: Vec<String> = mask
                    .fields()
                    .iter()
                    .map(FieldPath::canonical_string)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert(
                    "delete".to_string(),
                    JsonValue::String(self.document_name(mutation.key())),
                );
            }
            MutationKind::Verify => {
                write.insert(
                    "verify".to_string(),
                    JsonValue::String(self.document_name(mutation.key())),
                );
            }
        }
        if !mutation.field_transforms().is_empty() {
            write.insert(
                "updateTransforms".to_string(),
                JsonValue::Array(self.encode_field_transforms(mutation.field_transforms())),
            );
        }
        if let Some(precondition) = Self::encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> SyncResult<Mutation> {
        let precondition = Self::decode_precondition(value.get("currentDocument"))?;
        let transforms = value
            .get("updateTransforms")
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(Self::decode_field_transform)
                    .collect::<SyncResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mutation = if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update missing name"))?;
            let key = self.decode_document_key(name)?;
            let data = decode_map_value(update)?;
            match value.get("updateMask") {
                Some(mask) => {
                    let fields = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(|paths| {
                            paths
                                .iter()
                                .filter_map(JsonValue::as_str)
                                .map(FieldPath::from_dot_separated)
                                .collect::<SyncResult<Vec<_>>>()
                        })
                        .transpose()?
                        .unwrap_or_default();
                    Mutation::patch(key, data, FieldMask::new(fields), precondition)
                }
                None => Mutation::set(key, data).with_precondition(precondition),
            }
        } else if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            Mutation::delete(self.decode_document_key(name)?).with_precondition(precondition)
        } else if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            Mutation::verify(self.decode_document_key(name)?, precondition)
        } else {
            return Err(invalid_argument("Unknown write type"));
        };
        Ok(mutation.with_transforms(transforms))
    }

    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "database": self.database_name(),
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        })
    }

    pub fn decode_write_request(&self, value: &JsonValue) -> SyncResult<WriteRequest> {
        let Some(token) = value.get("streamToken").and_then(JsonValue::as_str) else {
            return Ok(WriteRequest::Handshake);
        };
        let stream_token = decode_bytes(token)?;
        let mutations = value
            .get("writes")
            .and_then(JsonValue::as_array)
            .map(|writes| {
                writes
                    .iter()
                    .map(|write| self.decode_mutation(write))
                    .collect::<SyncResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(WriteRequest::Write {
            stream_token,
            mutations,
        })
    }

    pub fn encode_write_response(&self, response: &WriteResponse) -> JsonValue {
        let mut object = serde_json::Map::new();
        object.insert(
            "streamToken".to_string(),
            JsonValue::String(BASE64_STANDARD.encode(&response.stream_token)),
        );
        if let Some(commit) = response.commit_version {
            object.insert("commitTime".to_string(), encode_version(commit));
        }
        let results: Vec<JsonValue> = response
            .write_results
            .iter()
            .map(|result| {
                json!({
                    "updateTime": encode_version(result.version),
                    "transformResults": result
                        .transform_results
                        .iter()
                        .map(encode_value)
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        object.insert("writeResults".to_string(), JsonValue::Array(results));
        JsonValue::Object(object)
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> SyncResult<WriteResponse> {
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(decode_bytes)
            .transpose()?
            .unwrap_or_default();
        let commit_version = value
            .get("commitTime")
            .and_then(JsonValue::as_str)
            .map(decode_version)
            .transpose()?;

        let mut write_results = Vec::new();
        if let Some(entries) = value.get("writeResults").and_then(JsonValue::as_array) {
            for entry in entries {
                let mut version = entry
                    .get("updateTime")
                    .and_then(JsonValue::as_str)
                    .map(decode_version)
                    .transpose()?
                    .unwrap_or_default();
                // Writes that changed nothing report no update time.
                if version.is_min() {
                    version = commit_version.unwrap_or_default();
                }
                let transform_results = entry
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .map(decode_value)
                            .collect::<SyncResult<Vec<_>>>()
                    })
                    .transpose()?
                    .unwrap_or_default();
                write_results.push(MutationResult {
                    version,
                    transform_results,
                });
            }
        }

        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }

    // Listen

    fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = serde_json::Map::new();
        let (parent, from) = match &target.collection_group {
            Some(group) => (
                self.resource_name(&target.path),
                json!({ "collectionId": group, "allDescendants": true }),
            ),
            None => (
                self.resource_name(&target.path.without_last()),
                json!({ "collectionId": target.path.last_segment().unwrap_or_default() }),
            ),
        };
        structured.insert("from".to_string(), JsonValue::Array(vec![from]));

        if !target.filters.is_empty() {
            let filters: Vec<JsonValue> = target
                .filters
                .iter()
                .map(|filter| {
                    json!({
                        "fieldFilter": {
                            "field": { "fieldPath": filter.field().canonical_string() },
                            "op": filter.op().as_str(),
                            "value": encode_value(filter.value()),
                        }
                    })
                })
                .collect();
            let filter = if filters.len() == 1 {
                filters.into_iter().next().unwrap_or(JsonValue::Null)
            } else {
                json!({ "compositeFilter": { "op": "AND", "filters": filters } })
            };
            structured.insert("where".to_string(), filter);
        }

        if !target.order_by.is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field.canonical_string() },
                        "direction": order.direction.as_str(),
                    })
                })
                .collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }

        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!(limit));
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    fn decode_query_target(&self, value: &JsonValue) -> SyncResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("query target missing parent"))?;
        let parent = self.decode_resource_path(parent)?;
        let structured = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("query target missing structuredQuery"))?;
        let from = structured
            .get("from")
            .and_then(JsonValue::as_array)
            .and_then(|entries| entries.first())
            .ok_or_else(|| invalid_argument("structuredQuery missing from"))?;
        let collection_id = from
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("structuredQuery missing collectionId"))?;
        let all_descendants = from
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let (path, collection_group) = if all_descendants {
            (parent, Some(collection_id.to_string()))
        } else {
            (parent.child([collection_id]), None)
        };

        let mut filters = Vec::new();
        if let Some(filter) = structured.get("where") {
            let field_filters: Vec<&JsonValue> = match filter.get("compositeFilter") {
                Some(composite) => composite
                    .get("filters")
                    .and_then(JsonValue::as_array)
                    .map(|entries| entries.iter().collect())
                    .unwrap_or_default(),
                None => vec![filter],
            };
            for entry in field_filters {
                let field_filter = entry
                    .get("fieldFilter")
                    .ok_or_else(|| invalid_argument("Unsupported filter"))?;
                filters.push(decode_field_filter(field_filter)?);
            }
        }

        let mut order_by = Vec::new();
        if let Some(orders) = structured.get("orderBy").and_then(JsonValue::as_array) {
            for order in orders {
                let field = order
                    .get("field")
                    .and_then(|field| field.get("fieldPath"))
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid_argument("orderBy missing fieldPath"))?;
                let direction = match order.get("direction").and_then(JsonValue::as_str) {
                    Some("DESCENDING") => Direction::Descending,
                    _ => Direction::Ascending,
                };
                order_by.push(OrderBy::new(FieldPath::from_dot_separated(field)?, direction));
            }
        }

        let limit = structured
            .get("limit")
            .and_then(JsonValue::as_u64)
            .map(|limit| limit as u32);

        Ok(Target {
            path,
            collection_group,
            filters,
            order_by,
            limit,
        })
    }

    fn purpose_label(purpose: TargetPurpose) -> Option<&'static str> {
        match purpose {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => {
                Some("existence-filter-mismatch-bloom")
            }
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }

    /// Full `addTarget` request for `target_data`, resuming where it left off.
    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        let mut add_target = serde_json::Map::new();
        add_target.insert("targetId".to_string(), json!(target_data.target_id));
        if target_data.target.is_document_target() {
            add_target.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target_data.target.path)] }),
            );
        } else {
            add_target.insert(
                "query".to_string(),
                self.encode_query_target(&target_data.target),
            );
        }
        if !target_data.resume_token.is_empty() {
            add_target.insert(
                "resumeToken".to_string(),
                JsonValue::String(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        } else if !target_data.snapshot_version.is_min() {
            add_target.insert(
                "readTime".to_string(),
                encode_version(target_data.snapshot_version),
            );
        }
        if let Some(expected) = target_data.expected_count {
            add_target.insert("expectedCount".to_string(), json!(expected));
        }

        let mut request = serde_json::Map::new();
        request.insert(
            "database".to_string(),
            JsonValue::String(self.database_name()),
        );
        request.insert("addTarget".to_string(), JsonValue::Object(add_target));
        if let Some(label) = Self::purpose_label(target_data.purpose) {
            request.insert("labels".to_string(), json!({ "goog-listen-tags": label }));
        }
        JsonValue::Object(request)
    }

    pub fn encode_unlisten_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn decode_listen_request(&self, value: &JsonValue) -> SyncResult<ListenRequest> {
        if let Some(target_id) = value.get("removeTarget").and_then(JsonValue::as_i64) {
            return Ok(ListenRequest::RemoveTarget(target_id as TargetId));
        }
        let add = value
            .get("addTarget")
            .ok_or_else(|| invalid_argument("listen request has neither addTarget nor removeTarget"))?;
        let target_id = add
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("addTarget missing targetId"))? as TargetId;
        let target = if let Some(documents) = add.get("documents") {
            let name = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .and_then(|names| names.first())
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("documents target missing name"))?;
            Target::for_document(&self.decode_document_key(name)?)
        } else {
            let query = add
                .get("query")
                .ok_or_else(|| invalid_argument("addTarget missing query"))?;
            self.decode_query_target(query)?
        };
        let resume_token = add
            .get("resumeToken")
            .and_then(JsonValue::as_str)
            .map(decode_bytes)
            .transpose()?
            .unwrap_or_default();
        let read_time = add
            .get("readTime")
            .and_then(JsonValue::as_str)
            .map(decode_version)
            .transpose()?;
        let expected_count = add
            .get("expectedCount")
            .and_then(JsonValue::as_i64)
            .map(|count| count as i32);
        Ok(ListenRequest::AddTarget(ListenTargetRequest {
            target_id,
            target,
            resume_token,
            read_time,
            expected_count,
        }))
    }

    pub fn decode_watch_change(&self, value: &JsonValue) -> SyncResult<WatchChange> {
        if let Some(change) = value.get("targetChange") {
            let state = match change.get("targetChangeType").and_then(JsonValue::as_str) {
                None | Some("NO_CHANGE") => TargetChangeState::NoChange,
                Some("ADD") => TargetChangeState::Add,
                Some("REMOVE") => TargetChangeState::Remove,
                Some("CURRENT") => TargetChangeState::Current,
                Some("RESET") => TargetChangeState::Reset,
                Some(other) => {
                    return Err(invalid_argument(format!("Unknown targetChangeType {other}")))
                }
            };
            let mut target_change = WatchTargetChange::new(state, decode_target_ids(change.get("targetIds")));
            if let Some(token) = change.get("resumeToken").and_then(JsonValue::as_str) {
                target_change = target_change.with_resume_token(decode_bytes(token)?);
            }
            if let Some(read_time) = change.get("readTime").and_then(JsonValue::as_str) {
                target_change = target_change.with_read_time(decode_version(read_time)?);
            }
            if let Some(cause) = change.get("cause") {
                target_change = target_change.with_cause(decode_status(cause));
            }
            return Ok(WatchChange::TargetChange(target_change));
        }

        if let Some(change) = value.get("documentChange") {
            let document = change
                .get("document")
                .ok_or_else(|| invalid_argument("documentChange missing document"))?;
            let document = self.decode_found_document(document)?;
            return Ok(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: decode_target_ids(change.get("targetIds")),
                removed_target_ids: decode_target_ids(change.get("removedTargetIds")),
                key: document.key().clone(),
                document: Some(document),
            }));
        }

        if let Some(delete) = value.get("documentDelete") {
            let (key, read_time, removed_target_ids) = self.decode_document_removal(delete)?;
            return Ok(WatchChange::DocumentDelete(DocumentDelete {
                key,
                read_time,
                removed_target_ids,
            }));
        }

        if let Some(remove) = value.get("documentRemove") {
            let (key, read_time, removed_target_ids) = self.decode_document_removal(remove)?;
            return Ok(WatchChange::DocumentRemove(DocumentRemove {
                key,
                read_time,
                removed_target_ids,
            }));
        }

        if let Some(filter) = value.get("filter") {
            let target_id = filter
                .get("targetId")
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| invalid_argument("filter missing targetId"))?
                as TargetId;
            let count = filter.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
            return Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id,
                count,
                unchanged_names: filter.get("unchangedNames").and_then(decode_bloom_payload),
            }));
        }

        Err(invalid_argument("Unrecognized listen response"))
    }

    fn decode_document_removal(
        &self,
        value: &JsonValue,
    ) -> SyncResult<(DocumentKey, Option<SnapshotVersion>, Vec<TargetId>)> {
        let name = value
            .get("document")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document removal missing name"))?;
        let read_time = value
            .get("readTime")
            .and_then(JsonValue::as_str)
            .map(decode_version)
            .transpose()?;
        Ok((
            self.decode_document_key(name)?,
            read_time,
            decode_target_ids(value.get("removedTargetIds")),
        ))
    }

    /// Server-side encoding of a watch change.
    pub fn encode_watch_change(&self, change: &WatchChange) -> JsonValue {
        match change {
            WatchChange::TargetChange(change) => {
                let mut object = serde_json::Map::new();
                let state = match change.state {
                    TargetChangeState::NoChange => "NO_CHANGE",
                    TargetChangeState::Add => "ADD",
                    TargetChangeState::Remove => "REMOVE",
                    TargetChangeState::Current => "CURRENT",
                    TargetChangeState::Reset => "RESET",
                };
                object.insert("targetChangeType".to_string(), json!(state));
                object.insert("targetIds".to_string(), json!(change.target_ids));
                if !change.resume_token.is_empty() {
                    object.insert(
                        "resumeToken".to_string(),
                        JsonValue::String(BASE64_STANDARD.encode(&change.resume_token)),
                    );
                }
                if let Some(read_time) = change.read_time {
                    object.insert("readTime".to_string(), encode_version(read_time));
                }
                if let Some(cause) = &change.cause {
                    object.insert(
                        "cause".to_string(),
                        json!({ "code": cause.code.rpc_status(), "message": cause.message() }),
                    );
                }
                json!({ "targetChange": JsonValue::Object(object) })
            }
            WatchChange::DocumentChange(change) => {
                let document = match &change.document {
                    Some(document) => {
                        self.encode_document(document.key(), document.data(), document.version())
                    }
                    None => json!({ "name": self.document_name(&change.key) }),
                };
                json!({
                    "documentChange": {
                        "document": document,
                        "targetIds": change.updated_target_ids,
                        "removedTargetIds": change.removed_target_ids,
                    }
                })
            }
            WatchChange::DocumentDelete(delete) => json!({
                "documentDelete": self.encode_document_removal(&delete.key, delete.read_time, &delete.removed_target_ids)
            }),
            WatchChange::DocumentRemove(remove) => json!({
                "documentRemove": self.encode_document_removal(&remove.key, remove.read_time, &remove.removed_target_ids)
            }),
            WatchChange::ExistenceFilter(filter) => {
                let mut object = serde_json::Map::new();
                object.insert("targetId".to_string(), json!(filter.target_id));
                object.insert("count".to_string(), json!(filter.count));
                if let Some(payload) = &filter.unchanged_names {
                    object.insert(
                        "unchangedNames".to_string(),
                        json!({
                            "bits": {
                                "bitmap": BASE64_STANDARD.encode(&payload.bitmap),
                                "padding": payload.padding,
                            },
                            "hashCount": payload.hash_count,
                        }),
                    );
                }
                json!({ "filter": JsonValue::Object(object) })
            }
        }
    }

    fn encode_document_removal(
        &self,
        key: &DocumentKey,
        read_time: Option<SnapshotVersion>,
        removed_target_ids: &[TargetId],
    ) -> JsonValue {
        let mut object = serde_json::Map::new();
        object.insert(
            "document".to_string(),
            JsonValue::String(self.document_name(key)),
        );
        object.insert("removedTargetIds".to_string(), json!(removed_target_ids));
        if let Some(read_time) = read_time {
            object.insert("readTime".to_string(), encode_version(read_time));
        }
        JsonValue::Object(object)
    }
}

fn decode_target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

/// `None` when the payload cannot be decoded; the caller then treats the
/// filter as if no bloom filter had been sent.
fn decode_bloom_payload(value: &JsonValue) -> Option<BloomFilterPayload> {
    let bits = value.get("bits");
    let bitmap = match bits.and_then(|bits| bits.get("bitmap")) {
        Some(JsonValue::String(encoded)) => match BASE64_STANDARD.decode(encoded) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::warn!("bloom filter bitmap is not valid base64: {err}");
                return None;
            }
        },
        Some(_) => return None,
        None => Vec::new(),
    };
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_i64)
        .unwrap_or(0) as i32;
    let hash_count = value
        .get("hashCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or(0) as i32;
    Some(BloomFilterPayload {
        bitmap,
        padding,
        hash_count,
    })
}

fn decode_field_filter(value: &JsonValue) -> SyncResult<FieldFilter> {
    let field = value
        .get("field")
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("fieldFilter missing fieldPath"))?;
    let op = match value.get("op").and_then(JsonValue::as_str) {
        Some("LESS_THAN") => FilterOperator::LessThan,
        Some("LESS_THAN_OR_EQUAL") => FilterOperator::LessThanOrEqual,
        Some("EQUAL") => FilterOperator::Equal,
        Some("NOT_EQUAL") => FilterOperator::NotEqual,
        Some("GREATER_THAN") => FilterOperator::GreaterThan,
        Some("GREATER_THAN_OR_EQUAL") => FilterOperator::GreaterThanOrEqual,
        Some("ARRAY_CONTAINS") => FilterOperator::ArrayContains,
        Some("ARRAY_CONTAINS_ANY") => FilterOperator::ArrayContainsAny,
        Some("IN") => FilterOperator::In,
        Some("NOT_IN") => FilterOperator::NotIn,
        other => return Err(invalid_argument(format!("Unknown filter operator {other:?}"))),
    };
    let operand = value
        .get("value")
        .ok_or_else(|| invalid_argument("fieldFilter missing value"))?;
    FieldFilter::new(FieldPath::from_dot_separated(field)?, op, decode_value(operand)?)
}

fn decode_bytes(encoded: &str) -> SyncResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(encoded)
        .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
}

fn encode_version(version: SnapshotVersion) -> JsonValue {
    JsonValue::String(version.timestamp().to_rfc3339())
}

fn decode_version(value: &str) -> SyncResult<SnapshotVersion> {
    Ok(SnapshotVersion::new(Timestamp::parse_rfc3339(value)?))
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &Value) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double_serde::to_json(*double) }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
        ValueKind::Sentinel(sentinel) => {
            log::warn!("sentinel {sentinel:?} reached the serializer; sending null");
            json!({ "nullValue": JsonValue::Null })
        }
    }
}

fn decode_array_values(value: &JsonValue) -> SyncResult<Vec<Value>> {
    match value.get("values").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

fn decode_map_value(value: &JsonValue) -> SyncResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> SyncResult<Value> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected value object"))?;
    if object.contains_key("nullValue") {
        return Ok(Value::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(Value::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(Value::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match double_serde::parse_name(value) {
                Some(parsed) => parsed,
                None => value
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(Value::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let text = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(Value::from_timestamp(Timestamp::parse_rfc3339(text)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let text = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(Value::from_string(text));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let text = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        return Ok(Value::from_bytes(BytesValue::new(decode_bytes(text)?)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let text = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(Value::from_reference(text));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(Value::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(Value::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(Value::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::error::SyncErrorCode;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn decodes_nested_document_fields() {
        let document = json!({
            "name": "projects/project/databases/(default)/documents/rooms/a",
            "updateTime": "2024-01-01T00:00:00.000000001Z",
            "fields": {
                "name": { "stringValue": "Ada" },
                "age": { "integerValue": "42" },
                "nested": { "mapValue": { "fields": { "flag": { "booleanValue": true } } } },
                "tags": { "arrayValue": {} }
            }
        });
        let decoded = serializer().decode_found_document(&document).unwrap();
        assert_eq!(decoded.key(), &key("rooms/a"));
        assert_eq!(decoded.version().timestamp().nanos, 1);
        let fields = decoded.data().fields();
        assert_eq!(fields.get("name"), Some(&Value::from_string("Ada")));
        assert_eq!(fields.get("age"), Some(&Value::from_integer(42)));
        assert_eq!(fields.get("tags"), Some(&Value::from_array(Vec::new())));
    }

    #[test]
    fn rejects_documents_from_other_databases() {
        let err = serializer()
            .decode_document_key("projects/other/databases/(default)/documents/rooms/a")
            .unwrap_err();
        assert_eq!(err.code, SyncErrorCode::InvalidArgument);
    }

    #[test]
    fn listen_request_resumes_with_token_and_expected_count() {
        let serializer = serializer();
        let query = Query::collection("rooms")
            .unwrap()
            .where_field("open", FilterOperator::Equal, Value::from_bool(true))
            .unwrap()
            .limit_to_first(5);
        let data = TargetData::new(query.to_target(), 4, TargetPurpose::ExistenceFilterMismatch, 1)
            .with_resume_token(vec![7, 7], version(3))
            .with_expected_count(Some(2));
        let encoded = serializer.encode_listen_request(&data);
        assert_eq!(encoded["addTarget"]["targetId"], json!(4));
        assert_eq!(encoded["addTarget"]["expectedCount"], json!(2));
        assert_eq!(
            encoded["labels"]["goog-listen-tags"],
            json!("existence-filter-mismatch")
        );
        assert_eq!(
            encoded["addTarget"]["query"]["parent"],
            json!("projects/project/databases/(default)/documents")
        );

        match serializer.decode_listen_request(&encoded).unwrap() {
            ListenRequest::AddTarget(request) => {
                assert_eq!(request.target, query.to_target());
                assert_eq!(request.resume_token, vec![7, 7]);
                assert_eq!(request.expected_count, Some(2));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn listen_request_without_token_uses_read_time() {
        let serializer = serializer();
        let mut data = TargetData::new(
            Target::for_document(&key("rooms/a")),
            1,
            TargetPurpose::LimboResolution,
            1,
        );
        data.snapshot_version = version(9);
        let encoded = serializer.encode_listen_request(&data);
        assert!(encoded["addTarget"].get("resumeToken").is_none());
        assert!(encoded["addTarget"]["readTime"].is_string());
        assert_eq!(
            encoded["addTarget"]["documents"]["documents"][0],
            json!("projects/project/databases/(default)/documents/rooms/a")
        );
    }

    #[test]
    fn decodes_target_change_with_cause() {
        let frame = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        match serializer().decode_watch_change(&frame).unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, TargetChangeState::Remove);
                assert_eq!(change.target_ids, vec![2]);
                assert_eq!(change.cause.unwrap().code, SyncErrorCode::PermissionDenied);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn missing_target_change_type_means_no_change() {
        let frame = json!({
            "targetChange": { "readTime": "2024-01-01T00:00:05Z", "resumeToken": "AQI=" }
        });
        match serializer().decode_watch_change(&frame).unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, TargetChangeState::NoChange);
                assert!(change.target_ids.is_empty());
                assert_eq!(change.resume_token, vec![1, 2]);
                assert!(change.read_time.is_some());
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn undecodable_bloom_bitmap_is_treated_as_absent() {
        let frame = json!({
            "filter": {
                "targetId": 2,
                "count": 1,
                "unchangedNames": { "bits": { "bitmap": "%%%", "padding": 1 }, "hashCount": 3 }
            }
        });
        match serializer().decode_watch_change(&frame).unwrap() {
            WatchChange::ExistenceFilter(filter) => {
                assert_eq!(filter.count, 1);
                assert!(filter.unchanged_names.is_none());
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn write_request_carries_transforms_and_preconditions() {
        let serializer = serializer();
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), Value::from_integer(1));
        let patch = Mutation::patch(
            key("rooms/a"),
            MapValue::new(fields),
            FieldMask::new(vec![FieldPath::from_dot_separated("x").unwrap()]),
            Precondition::Exists(true),
        )
        .with_transforms(vec![FieldTransform::new(
            FieldPath::from_dot_separated("count").unwrap(),
            TransformOperation::NumericIncrement(Value::from_integer(1)),
        )]);
        let delete = Mutation::delete(key("rooms/b"));

        let encoded = serializer.encode_write_request(&[3], &[patch.clone(), delete.clone()]);
        assert_eq!(encoded["streamToken"], json!("Aw=="));
        assert_eq!(encoded["writes"][0]["currentDocument"]["exists"], json!(true));
        assert_eq!(
            encoded["writes"][0]["updateTransforms"][0]["increment"]["integerValue"],
            json!("1")
        );

        match serializer.decode_write_request(&encoded).unwrap() {
            WriteRequest::Write {
                stream_token,
                mutations,
            } => {
                assert_eq!(stream_token, vec![3]);
                assert_eq!(mutations, vec![patch, delete]);
            }
            WriteRequest::Handshake => panic!("expected write"),
        }
        assert_eq!(
            serializer
                .decode_write_request(&serializer.encode_handshake())
                .unwrap(),
            WriteRequest::Handshake
        );
    }

    #[test]
    fn write_results_without_update_time_use_commit_time() {
        let response = json!({
            "streamToken": "BQ==",
            "commitTime": "2024-01-01T00:00:07Z",
            "writeResults": [
                { "transformResults": [ { "integerValue": "2" } ] },
                { "updateTime": "2024-01-01T00:00:06Z" }
            ]
        });
        let decoded = serializer().decode_write_response(&response).unwrap();
        assert_eq!(decoded.stream_token, vec![5]);
        assert_eq!(decoded.write_results[0].version, decoded.commit_version.unwrap());
        assert_eq!(decoded.write_results[0].transform_results, vec![Value::from_integer(2)]);
        assert!(decoded.write_results[1].version < decoded.commit_version.unwrap());
        assert!(!decoded.is_token_only());
    }
}
