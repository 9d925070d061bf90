//! The async record cache: identical operator semantics to the in-memory
//! cache, materialized over an object store.
//!
//! Reads are served from an in-memory materialization hydrated at open.
//! Every mutation is staged against a copy, written to the object store as
//! one atomic batch, and only then adopted; a failed batch leaves both the
//! materialization and the store untouched.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use orbit::{CacheState, InverseRelationship, KeyMap, PatchResult, RecordCache};
use orbit_api::{
    OrbitError, Query, QueryResult, Record, RecordIdentity, RecordOperation, Result, Schema,
    Transform,
};

use crate::object_store::{ObjectStore, WriteOp};

/// Store of records, keyed `{type}:{id}`.
pub const RECORDS_STORE: &str = "records";
/// Store of inverse-relationship entry lists, keyed by the edge target.
pub const INVERSE_RELATIONSHIPS_STORE: &str = "inverseRelationships";
/// Default database name.
pub const DEFAULT_DB_NAME: &str = "orbit";

pub fn record_key(identity: &RecordIdentity) -> String {
    format!("{}:{}", identity.kind, identity.id)
}

pub struct AsyncRecordCache {
    object_store: Arc<dyn ObjectStore>,
    cache: RwLock<RecordCache>,
}

impl AsyncRecordCache {
    /// Hydrate from the `records` store; the inverse index is re-derived
    /// from the records themselves (and kept persisted for consumers that
    /// read the store directly).
    pub async fn open(
        schema: Arc<Schema>,
        key_map: Option<Arc<KeyMap>>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let mut cache = match key_map {
            Some(key_map) => RecordCache::with_key_map(schema, key_map),
            None => RecordCache::new(schema),
        };
        let entries = object_store.get_all(RECORDS_STORE).await?;
        let count = entries.len();
        for (key, value) in entries {
            let record: Record = serde_json::from_value(value)
                .map_err(|e| OrbitError::Storage(format!("corrupt record {key}: {e}")))?;
            cache.patch(&[RecordOperation::AddRecord { record }])?;
        }
        debug!(records = count, "hydrated async cache");
        Ok(Self {
            object_store,
            cache: RwLock::new(cache),
        })
    }

    pub async fn get_record(&self, identity: &RecordIdentity) -> Result<Option<Record>> {
        Ok(self.cache.read().await.get_record_sync(identity).cloned())
    }

    pub async fn records(&self, kind: &str) -> Result<Vec<Record>> {
        Ok(self
            .cache
            .read()
            .await
            .records_sync(kind)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn inverse_relationships_of(
        &self,
        identity: &RecordIdentity,
    ) -> Result<Vec<InverseRelationship>> {
        Ok(self.cache.read().await.inverse_relationships_of(identity))
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<QueryResult>> {
        self.cache.read().await.query_sync(query)
    }

    pub async fn update(&self, transform: &Transform) -> Result<PatchResult> {
        self.patch(&transform.operations).await
    }

    /// Apply operations; the whole patch is one store batch, all-or-nothing.
    pub async fn patch(&self, operations: &[RecordOperation]) -> Result<PatchResult> {
        let mut guard = self.cache.write().await;
        let before = guard.flattened();

        let mut staged = guard.clone();
        let result = staged.patch(operations)?;
        if result.changed {
            let after = staged.flattened();
            let batch = diff_states(&before, &after);
            self.object_store.apply(batch).await?;
            *guard = staged;
        }
        Ok(result)
    }
}

/// The store writes that turn `before` into `after`.
fn diff_states(before: &CacheState, after: &CacheState) -> Vec<WriteOp> {
    let mut batch = Vec::new();

    let before_records: HashMap<String, &Record> = before
        .records()
        .map(|record| (record_key(&record.identity), record))
        .collect();
    let after_records: HashMap<String, &Record> = after
        .records()
        .map(|record| (record_key(&record.identity), record))
        .collect();

    for (key, record) in &after_records {
        if before_records.get(key) != Some(record) {
            batch.push(WriteOp::put(
                RECORDS_STORE,
                key.clone(),
                serde_json::to_value(record).expect("record serializes"),
            ));
        }
    }
    for key in before_records.keys() {
        if !after_records.contains_key(key) {
            batch.push(WriteOp::delete(RECORDS_STORE, key.clone()));
        }
    }

    let before_inverse: HashMap<String, &Vec<InverseRelationship>> = before
        .inverse_entries()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(identity, entries)| (record_key(identity), entries))
        .collect();
    let after_inverse: HashMap<String, &Vec<InverseRelationship>> = after
        .inverse_entries()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(identity, entries)| (record_key(identity), entries))
        .collect();

    for (key, entries) in &after_inverse {
        if before_inverse.get(key) != Some(entries) {
            batch.push(WriteOp::put(
                INVERSE_RELATIONSHIPS_STORE,
                key.clone(),
                json!(entries),
            ));
        }
    }
    for key in before_inverse.keys() {
        if !after_inverse.contains_key(key) {
            batch.push(WriteOp::delete(INVERSE_RELATIONSHIPS_STORE, key.clone()));
        }
    }

    batch
}
