//! Object-store abstraction backing the durable caches: named stores of
//! JSON values with atomic write batches.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use orbit_api::Result;

/// One write in a batch; `None` deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub store: String,
    pub key: String,
    pub value: Option<Value>,
}

impl WriteOp {
    pub fn put(store: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            store: store.into(),
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            key: key.into(),
            value: None,
        }
    }
}

/// Named key/value stores with all-or-nothing batch application.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>>;
    /// Every entry of a store, in key order.
    async fn get_all(&self, store: &str) -> Result<Vec<(String, Value)>>;
    /// Apply the whole batch atomically: on failure nothing is written.
    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()>;
    async fn clear_store(&self, store: &str) -> Result<()>;
}

/// In-memory object store; the reference implementation and test double.
#[derive(Default)]
pub struct MemoryObjectStore {
    stores: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .stores
            .read()
            .expect("object store lock poisoned")
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .stores
            .read()
            .expect("object store lock poisoned")
            .get(store)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut stores = self.stores.write().expect("object store lock poisoned");
        for op in batch {
            let entries = stores.entry(op.store).or_default();
            match op.value {
                Some(value) => {
                    entries.insert(op.key, value);
                }
                None => {
                    entries.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    async fn clear_store(&self, store: &str) -> Result<()> {
        self.stores
            .write()
            .expect("object store lock poisoned")
            .remove(store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_batch_apply_and_read_back() {
        let store = MemoryObjectStore::new();
        store
            .apply(vec![
                WriteOp::put("records", "planet:a", json!({"id": "a"})),
                WriteOp::put("records", "planet:b", json!({"id": "b"})),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.get("records", "planet:a").await.unwrap(),
            Some(json!({"id": "a"}))
        );
        assert_eq!(store.get_all("records").await.unwrap().len(), 2);

        store
            .apply(vec![WriteOp::delete("records", "planet:a")])
            .await
            .unwrap();
        assert_eq!(store.get("records", "planet:a").await.unwrap(), None);
    }
}
