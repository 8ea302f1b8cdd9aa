use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::target::Target;
use crate::error::{invalid_argument, SyncResult};
use crate::model::{DocumentKey, FieldPath, IntoFieldPath, MutableDocument, ResourcePath};
use crate::value::{canonical_id, compare_values, type_order, Value, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: Value) -> SyncResult<Self> {
        if op.takes_array_operand() {
            let Some(array) = value.as_array() else {
                return Err(invalid_argument(format!(
                    "Operator '{}' needs an array operand",
                    op.symbol()
                )));
            };
            if array.values().is_empty() {
                return Err(invalid_argument(format!(
                    "Operator '{}' needs a non-empty array",
                    op.symbol()
                )));
            }
        }
        if matches!(value.kind(), ValueKind::Sentinel(_)) {
            return Err(invalid_argument("Sentinel values cannot be used in filters"));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let key_value;
        let candidate = if self.field.is_document_id() {
            key_value = Value::from_reference(document.key().path().canonical_string());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };
        let Some(candidate) = candidate else {
            return false;
        };
        match self.op {
            FilterOperator::ArrayContains => candidate
                .as_array()
                .is_some_and(|array| array.contains(&self.value)),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) = (candidate.as_array(), self.value.as_array())
                else {
                    return false;
                };
                needles.values().iter().any(|needle| array.contains(needle))
            }
            FilterOperator::In => self
                .value
                .as_array()
                .is_some_and(|options| options.contains(candidate)),
            FilterOperator::NotIn => {
                let Some(options) = self.value.as_array() else {
                    return false;
                };
                !candidate.is_null()
                    && !options.contains(&Value::null())
                    && !options.contains(candidate)
            }
            FilterOperator::NotEqual => {
                !candidate.is_null() && compare_values(candidate, &self.value) != Ordering::Equal
            }
            _ => {
                type_order(candidate) == type_order(&self.value)
                    && self.matches_comparison(compare_values(candidate, &self.value))
            }
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.symbol(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub(crate) fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(a), Some(b)) => compare_values(a, b),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A filtered, ordered and optionally limited view over a collection,
/// a collection group, or a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    fn at_path(path: ResourcePath, collection_group: Option<String>) -> Self {
        Self {
            path,
            collection_group,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    /// Every document directly inside the collection at `path`.
    pub fn collection(path: &str) -> SyncResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.is_empty() || path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid collection path ({path}). Collection paths need an odd number of segments."
            )));
        }
        Ok(Self::at_path(path, None))
    }

    /// Every document in any collection named `collection_id`.
    pub fn collection_group(collection_id: &str) -> SyncResult<Self> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection group id '{collection_id}'"
            )));
        }
        Ok(Self::at_path(
            ResourcePath::root(),
            Some(collection_id.to_string()),
        ))
    }

    /// The same constraints applied to the single collection at `path`.
    pub(crate) fn as_collection_query_at(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    /// Matches exactly one document.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone(), None)
    }

    /// Server-side reading of a target: orderings are taken as given and
    /// the limit always applies from the front.
    pub fn from_target(target: Target) -> Self {
        Self {
            path: target.path,
            collection_group: target.collection_group,
            filters: target.filters,
            explicit_order_by: target.order_by,
            limit: target.limit,
            limit_type: LimitType::First,
        }
    }

    pub fn where_field(
        mut self,
        field: impl IntoFieldPath,
        op: FilterOperator,
        value: Value,
    ) -> SyncResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Document queries cannot be filtered"));
        }
        self.filters
            .push(FieldFilter::new(field.into_field_path()?, op, value)?);
        Ok(self)
    }

    pub fn order_by(mut self, field: impl IntoFieldPath, direction: Direction) -> SyncResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Document queries cannot be ordered"));
        }
        self.explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none() && self.path.is_document_path() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Explicit orderings followed by inequality fields and the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.op().is_inequality())
            .map(|filter| filter.field().clone())
            .collect();
        for field in inequality_fields {
            if !field.is_document_id() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    pub fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            return key.has_collection_id(group) && self.path.is_prefix_of(doc_path);
        }
        if self.path.is_document_path() {
            return &self.path == doc_path;
        }
        self.path.is_prefix_of(doc_path) && self.path.len() + 1 == doc_path.len()
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by.iter().all(|order| {
            order.field.is_document_id() || document.field(&order.field).is_some()
        })
    }

    /// Orders two matching documents by the normalized ordering.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Server-side shape of this query. Limit-to-last queries are sent with
    /// flipped orderings and reversed locally.
    pub fn to_target(&self) -> Target {
        let order_by = self
            .normalized_order_by()
            .into_iter()
            .map(|order| match self.limit_type {
                LimitType::First => order,
                LimitType::Last => OrderBy::new(order.field, order.direction.flipped()),
            })
            .collect();
        Target {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            filters: self.filters.clone(),
            order_by,
            limit: self.limit,
        }
    }

    /// Identity used to share views between listeners of equal queries.
    pub fn canonical_id(&self) -> String {
        let mut id = self.to_target().canonical_id();
        let _ = write!(
            id,
            "|lt:{}",
            match self.limit_type {
                LimitType::First => "f",
                LimitType::Last => "l",
            }
        );
        id
    }
}
