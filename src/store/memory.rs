use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{compare_values, Mutation, Query, Store};
use crate::error::GatewayError;

/// In-process store; one mutex makes every atomic mutation single-writer
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map_or(0, |docs| docs.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, GatewayError> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>, GatewayError> {
        let collections = self.collections.lock().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<Value> = docs.values().filter(|doc| query.matches(doc)).cloned().collect();
        drop(collections);

        if let Some(field) = &query.order_by {
            matched.sort_by(|a, b| match (a.get(field), b.get(field)) {
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn put(&self, collection: &str, id: &str, value: &Value) -> Result<(), GatewayError> {
        self.collections
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value.clone());
        Ok(())
    }

    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<Value, GatewayError> {
        let mut collections = self.collections.lock().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| GatewayError::Store(format!("{}/{} not found", collection, id)))?;

        // Mutate a copy so a failed mutation leaves the stored document intact
        let mut updated = doc.clone();
        mutation(&mut updated)?;
        *doc = updated.clone();
        Ok(updated)
    }
}
