//! Redis-backed document store
//!
//! Layout:
//! - `{prefix}doc:{collection}#{id}`: JSON object with the document fields
//! - `{prefix}idx:{collection}`: set of document ids in the collection
//!
//! Queries load the id index and filter in process, so they are meant for the
//! small collections this crate deals with (content records, cache entries).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::StoreError;
use crate::document_store::{
    Condition, Document, DocumentStore, WriteMode, matches_all, merge_fields,
};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

fn doc_key(prefix: &str, collection: &str, id: &str) -> Result<String, StoreError> {
    if collection.is_empty() || id.is_empty() || collection.contains('#') {
        return Err(StoreError::InvalidPath(format!("{}/{}", collection, id)));
    }
    Ok(format!("{}doc:{}#{}", prefix, collection, id))
}

fn index_key(prefix: &str, collection: &str) -> String {
    format!("{}idx:{}", prefix, collection)
}

fn parse_fields(key: &str, raw: &str) -> Result<Map<String, Value>, StoreError> {
    serde_json::from_str(raw).map_err(|e| {
        warn!("Corrupt document at Redis key {}: {}", key, e);
        StoreError::Serialization(e)
    })
}

impl RedisStore {
    /// Connect and namespace every key under `prefix` (e.g. `"labguide:"`)
    pub async fn new(
        redis_client: redis::Client,
        prefix: impl Into<String>,
    ) -> Result<Self, redis::RedisError> {
        let conn = ConnectionManager::new(redis_client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    async fn load(&self, key: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|json| parse_fields(key, &json)).transpose()
    }

    async fn sorted_ids(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(index_key(&self.prefix, collection)).await?;
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let key = doc_key(&self.prefix, collection, id)?;
        Ok(self
            .load(&key)
            .await?
            .map(|fields| Document::new(id, fields)))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let key = doc_key(&self.prefix, collection, id)?;
        let fields = match mode {
            WriteMode::Replace => fields,
            // Read-modify-write; concurrent merges of the same document are last-write-wins
            WriteMode::Merge => {
                let mut existing = self.load(&key).await?.unwrap_or_default();
                merge_fields(&mut existing, fields);
                existing
            }
        };
        let json = serde_json::to_string(&fields)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(&key, json)
            .ignore()
            .sadd(index_key(&self.prefix, collection), id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Stored document {}", key);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let key = doc_key(&self.prefix, collection, id)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .srem(index_key(&self.prefix, collection), id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let ids = self.sorted_ids(collection).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys = ids
            .iter()
            .map(|id| doc_key(&self.prefix, collection, id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.get(key);
        }
        let mut conn = self.conn.clone();
        let raws: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        let mut docs = Vec::new();
        for ((id, key), raw) in ids.into_iter().zip(&keys).zip(raws) {
            // Index entries can outlive a document deleted outside this store
            let Some(raw) = raw else {
                continue;
            };
            let fields = parse_fields(key, &raw)?;
            if matches_all(conditions, &fields) {
                docs.push(Document::new(id, fields));
                if limit.is_some_and(|n| docs.len() >= n) {
                    break;
                }
            }
        }
        Ok(docs)
    }

    async fn list_ids(&self, collection: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sorted_ids(collection)
            .await?
            .into_iter()
            .filter(|id| id.starts_with(prefix))
            .collect())
    }
}
