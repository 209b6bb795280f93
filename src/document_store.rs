//! Storage-agnostic document store interface
//!
//! The tiered cache and the gateway only talk to storage through
//! [`DocumentStore`]: get/set by id, delete, field-condition queries and
//! id-prefix enumeration. Concrete stores live in [`crate::memory_store`] and
//! [`crate::redis_store`].

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StoreError;

/// A stored document: its id plus a JSON object of fields.
///
/// Serializes flat, as `{ "id": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// How `set` treats fields already present on the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite only the supplied top-level fields
    Merge,
    /// Replace the whole document
    Replace,
}

/// Comparison applied by a query condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "in")]
    In,
}

/// A single `field <operator> value` filter; a query ANDs its conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    /// Whether the given document fields satisfy this condition.
    ///
    /// A missing field never matches, not even for `!=`.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        match self.operator {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::Ne => !values_equal(actual, &self.value),
            Operator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            Operator::Le => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.iter().any(|v| values_equal(v, &self.value))),
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|v| values_equal(actual, v))),
        }
    }
}

/// Whether a document satisfies every condition.
pub fn matches_all(conditions: &[Condition], fields: &Map<String, Value>) -> bool {
    conditions.iter().all(|c| c.matches(fields))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Shallow merge of `incoming` into `existing`, top-level fields only.
pub fn merge_fields(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (k, v) in incoming {
        existing.insert(k, v);
    }
}

/// Document database client used by the cache and the gateway.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch a document by id, `None` when it does not exist
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Write a document by id
    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        mode: WriteMode,
    ) -> Result<(), StoreError>;

    /// Delete a document; deleting a missing document is not an error
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// All documents matching every condition, ordered by id, truncated to `limit`
    async fn query(
        &self,
        collection: &str,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Ids of documents whose id starts with `prefix`
    async fn list_ids(&self, collection: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}
