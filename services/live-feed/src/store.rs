//! Document store contract
//!
//! The live feed sits on top of a managed document database. This module
//! describes that database by contract: queries with equality and range
//! filters, push feeds that re-deliver the full matching set on every change,
//! and fire-and-await writes with no multi-document atomicity.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use types::errors::StoreError;
use types::ids::RecordId;

/// Placeholder the store replaces with its own clock when a write lands.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Whether a field value is the server timestamp placeholder.
pub fn is_server_timestamp(value: &Value) -> bool {
    value.get(".sv").and_then(Value::as_str) == Some("timestamp")
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: RecordId,
    pub collection: String,
    /// JSON object of field values.
    pub fields: Value,
}

impl Document {
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A single query predicate on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
}

impl Filter {
    /// Whether a document satisfies this predicate.
    ///
    /// A document missing the field never matches.
    pub fn matches(&self, doc: &Document) -> bool {
        let (field, expected) = match self {
            Filter::Eq(f, v) | Filter::Gt(f, v) | Filter::Gte(f, v) | Filter::Lt(f, v) => (f, v),
        };
        let Some(actual) = doc.field(field) else {
            return false;
        };

        match self {
            Filter::Eq(..) => actual == expected,
            Filter::Gt(..) => compare_values(actual, expected) == Some(Ordering::Greater),
            Filter::Gte(..) => matches!(
                compare_values(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(..) => compare_values(actual, expected) == Some(Ordering::Less),
        }
    }
}

/// Numbers compare numerically, strings lexicographically; anything else is
/// incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A collection query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter::Eq(field.into(), value));
        self
    }

    pub fn where_gt(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter::Gt(field.into(), value));
        self
    }

    pub fn where_gte(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter::Gte(field.into(), value));
        self
    }

    pub fn where_lt(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter::Lt(field.into(), value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Whether a document is in scope for this query.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.collection == self.collection && self.filters.iter().all(|f| f.matches(doc))
    }

    /// Sort documents per `order_by`. Documents missing the ordering field
    /// sort last; ties fall back to id order.
    pub fn sort(&self, docs: &mut [Document]) {
        let Some(order) = &self.order_by else {
            return;
        };
        docs.sort_by(|a, b| {
            let ordering = match (a.field(&order.field), b.field(&order.field)) {
                (Some(x), Some(y)) => {
                    let cmp = compare_values(x, y).unwrap_or(Ordering::Equal);
                    match order.direction {
                        Direction::Ascending => cmp,
                        Direction::Descending => cmp.reverse(),
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            ordering.then_with(|| a.id.cmp(&b.id))
        });
    }
}

/// Receives the complete matching set on every change.
pub type OnNext = Arc<dyn Fn(Vec<Document>) + Send + Sync>;
/// Receives the terminal feed error, at most once.
pub type OnError = Arc<dyn Fn(StoreError) + Send + Sync>;
/// Stops a feed; after it returns neither callback fires again.
pub type FeedCancel = Box<dyn FnOnce() + Send>;

/// Managed document database as seen by the live feed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a push feed for `query`.
    ///
    /// `on_next` may fire before this returns with the initial result set.
    fn subscribe(&self, query: Query, on_next: OnNext, on_error: OnError) -> FeedCancel;

    /// Create a document and return its server-assigned id.
    async fn write(&self, collection: &str, fields: Value) -> Result<RecordId, StoreError>;

    /// Shallow-merge `fields` into an existing document.
    async fn update(&self, collection: &str, id: &RecordId, fields: Value) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Document>, StoreError>;

    /// One-time read of the matching set.
    async fn query_once(&self, query: Query) -> Result<Vec<Document>, StoreError>;
}
