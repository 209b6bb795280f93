//! In-process document store
//!
//! Keeps every collection in a `BTreeMap` so queries come back ordered by id.
//! Useful for tests and for single-process deployments without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::StoreError;
use crate::document_store::{
    Condition, Document, DocumentStore, WriteMode, matches_all, merge_fields,
};

type Collection = BTreeMap<String, Map<String, Value>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

fn check_path(collection: &str, id: &str) -> Result<(), StoreError> {
    if collection.is_empty() || id.is_empty() {
        return Err(StoreError::InvalidPath(format!("{}/{}", collection, id)));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        check_path(collection, id)?;
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        check_path(collection, id)?;
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_owned()).or_default();
        match docs.get_mut(id) {
            Some(existing) if mode == WriteMode::Merge => merge_fields(existing, fields),
            _ => {
                docs.insert(id.to_owned(), fields);
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        check_path(collection, id)?;
        if let Some(docs) = self.collections.write().await.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, fields)| matches_all(conditions, fields))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect())
    }

    async fn list_ids(&self, collection: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.keys()
                    .filter(|id| id.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn merge_keeps_untouched_fields() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store
            .set("ensaios", "e1", obj(json!({"a": 1, "b": 2})), WriteMode::Merge)
            .await?;
        store
            .set("ensaios", "e1", obj(json!({"b": 3})), WriteMode::Merge)
            .await?;
        let doc = store.get("ensaios", "e1").await?;
        assert_eq!(doc.map(|d| d.fields), Some(obj(json!({"a": 1, "b": 3}))));

        store
            .set("ensaios", "e1", obj(json!({"c": 4})), WriteMode::Replace)
            .await?;
        let doc = store.get("ensaios", "e1").await?;
        assert_eq!(doc.map(|d| d.fields), Some(obj(json!({"c": 4}))));
        Ok(())
    }

    #[tokio::test]
    async fn query_filters_orders_and_limits() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        for (id, cat) in [("c", "solos"), ("a", "solos"), ("b", "rochas"), ("d", "solos")] {
            store
                .set("ensaios", id, obj(json!({"category": cat})), WriteMode::Replace)
                .await?;
        }
        let docs = store
            .query("ensaios", &[Condition::eq("category", "solos")], Some(2))
            .await?;
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        assert!(store.query("missing", &[], None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_ids_by_prefix_and_delete() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        for id in ["api_x", "api_y", "firestore_z"] {
            store.set("cache", id, Map::new(), WriteMode::Merge).await?;
        }
        assert_eq!(store.list_ids("cache", "api_").await?, vec!["api_x", "api_y"]);
        store.delete("cache", "api_x").await?;
        store.delete("cache", "never_existed").await?;
        assert_eq!(store.count("cache").await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_empty_ids() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("ensaios", "").await,
            Err(StoreError::InvalidPath(_))
        ));
    }
}
