//! Document store collaborator
//!
//! Documents are JSON objects addressed by `(collection, id)`. The core only
//! needs point reads, equality/range queries with one ascending sort key,
//! whole-document writes, and an atomic read-modify-write.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::GatewayError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const USERS: &str = "users";
pub const PRICING_TIERS: &str = "pricing_tiers";
pub const MODEL_CONFIGURATIONS: &str = "model_configurations";
pub const REQUEST_LOGS: &str = "request_logs";

/// Mutation applied inside [`Store::run_atomic`]; an `Err` aborts the write
pub type Mutation = Box<dyn FnOnce(&mut Value) -> Result<(), GatewayError> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    /// Inclusive bounds
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    /// Ascending sort key
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn range(mut self, field: &str, min: Option<Value>, max: Option<Value>) -> Self {
        self.filters.push(Filter::Range {
            field: field.to_string(),
            min,
            max,
        });
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Every field name this query touches
    pub(crate) fn fields(&self) -> impl Iterator<Item = &str> {
        self.filters
            .iter()
            .map(|f| match f {
                Filter::Eq { field, .. } | Filter::Range { field, .. } => field.as_str(),
            })
            .chain(self.order_by.as_deref())
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|filter| match filter {
            Filter::Eq { field, value } => doc
                .get(field)
                .is_some_and(|actual| compare_values(actual, value) == Some(Ordering::Equal)),
            Filter::Range { field, min, max } => {
                let Some(actual) = doc.get(field) else {
                    return false;
                };
                let above = min.as_ref().map_or(true, |min| {
                    matches!(compare_values(actual, min), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = max.as_ref().map_or(true, |max| {
                    matches!(compare_values(actual, max), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            }
        })
    }
}

/// Numbers compare numerically, strings and bools by value; mixed kinds don't compare
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, GatewayError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>, GatewayError>;

    async fn put(&self, collection: &str, id: &str, value: &Value) -> Result<(), GatewayError>;

    /// Read, mutate and write one document with no interleaving writer.
    /// Returns the document as written.
    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<Value, GatewayError>;
}

pub async fn get_as<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<Option<T>, GatewayError> {
    match store.get_by_id(collection, id).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| GatewayError::Store(format!("malformed {}/{}: {}", collection, id, e))),
        None => Ok(None),
    }
}

/// Query and decode, skipping documents that don't deserialize
pub async fn query_as<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    query: &Query,
) -> Result<Vec<T>, GatewayError> {
    let docs = store.query(collection, query).await?;
    Ok(docs
        .into_iter()
        .filter_map(|doc| match serde_json::from_value(doc) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(collection, error = %e, "Skipping malformed document");
                None
            }
        })
        .collect())
}

pub async fn put_as<T: Serialize + Sync>(
    store: &dyn Store,
    collection: &str,
    id: &str,
    item: &T,
) -> Result<(), GatewayError> {
    let value = serde_json::to_value(item)
        .map_err(|e| GatewayError::Store(format!("failed to encode {}/{}: {}", collection, id, e)))?;
    store.put(collection, id, &value).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_matching() {
        let doc = json!({"is_active": true, "min_monthly_spend": 100.0, "name": "pro"});

        assert!(Query::new().eq("is_active", true).matches(&doc));
        assert!(!Query::new().eq("is_active", false).matches(&doc));
        assert!(!Query::new().eq("missing", 1).matches(&doc));
        assert!(Query::new()
            .range("min_monthly_spend", Some(json!(100)), Some(json!(200)))
            .matches(&doc));
        assert!(!Query::new()
            .range("min_monthly_spend", Some(json!(100.5)), None)
            .matches(&doc));
    }

    #[test]
    fn test_compare_values_mixed_kinds() {
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Some(Ordering::Equal));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn test_fields_lists_filters_and_sort_key() {
        let query = Query::new().eq("a", 1).range("b", None, None).order_by("c");
        assert_eq!(query.fields().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
