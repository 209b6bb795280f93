//! Store wrapper with call counters and failure injection

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::document_store::{Condition, Document, DocumentStore, WriteMode};
use crate::memory_store::MemoryStore;
use crate::StoreError;

#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Number of upcoming reads that fail with a transient error
    pub transient_failures: AtomicUsize,
    pub read_delay: Mutex<Option<Duration>>,
    pub delete_delay: Mutex<Option<Duration>>,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub queries: AtomicUsize,
    reads_by_collection: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Reads (gets and queries) against one collection
    pub fn reads_of(&self, collection: &str) -> usize {
        self.reads_by_collection
            .lock()
            .ok()
            .and_then(|m| m.get(collection).copied())
            .unwrap_or(0)
    }

    fn record_read(&self, collection: &str) {
        if let Ok(mut m) = self.reads_by_collection.lock() {
            *m.entry(collection.to_owned()).or_default() += 1;
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.read_delay.lock() {
            *guard = Some(delay);
        }
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.delete_delay.lock() {
            *guard = Some(delay);
        }
    }

    async fn before_read(&self) -> Result<(), StoreError> {
        let delay = self.read_delay.lock().ok().and_then(|g| *g);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::provider("permission-denied", "reads disabled"));
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::provider("unavailable", "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.record_read(collection);
        self.before_read().await?;
        self.inner.get(collection, id).await
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::provider("unavailable", "writes disabled"));
        }
        self.inner.set(collection, id, fields, mode).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let delay = self.delete_delay.lock().ok().and_then(|g| *g);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.delete(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.record_read(collection);
        self.before_read().await?;
        self.inner.query(collection, conditions, limit).await
    }

    async fn list_ids(&self, collection: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_ids(collection, prefix).await
    }
}

/// Build a JSON object from a `json!` literal
pub(crate) fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
