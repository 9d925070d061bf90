//! File-backed object store and bucket.
//!
//! One JSON file per store under a root directory, written tmp-then-rename.
//! `open` is idempotent; a version bump (the declared schema hash changes)
//! rebuilds every store from scratch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use orbit_api::{OrbitError, Result};
use orbit_core::Bucket;

use crate::object_store::{ObjectStore, WriteOp};

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    version: u64,
    created_at: String,
}

type StoreMap = BTreeMap<String, Value>;

/// Durable object store: `{root}/{store}.json` per store plus a `meta.json`.
pub struct FileObjectStore {
    root: PathBuf,
    /// In-memory mirror of every store, the read path.
    stores: Mutex<BTreeMap<String, StoreMap>>,
}

impl FileObjectStore {
    /// Open (or create) the database at `root` for the given version.
    /// A version mismatch drops every store file and starts fresh.
    pub async fn open(root: impl AsRef<Path>, version: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| OrbitError::Storage(e.to_string()))?;

        let meta_path = root.join("meta.json");
        let existing: Option<StoreMeta> = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };

        let rebuild = match &existing {
            Some(meta) => meta.version != version,
            None => false,
        };
        if rebuild {
            info!(root = %root.display(), version, "store version changed; rebuilding");
            let mut entries = tokio::fs::read_dir(&root)
                .await
                .map_err(|e| OrbitError::Storage(e.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| OrbitError::Storage(e.to_string()))?
            {
                if entry.path().extension().is_some_and(|ext| ext == "json") {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        if existing.is_none() || rebuild {
            let meta = StoreMeta {
                version,
                created_at: Utc::now().to_rfc3339(),
            };
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta).expect("meta serializes"))
                .await?;
        }

        // Hydrate the mirror from whatever store files exist.
        let mut stores = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| OrbitError::Storage(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrbitError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if name == "meta" {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| OrbitError::Storage(e.to_string()))?;
            let map: StoreMap = serde_json::from_slice(&bytes)
                .map_err(|e| OrbitError::Storage(format!("corrupt store {name}: {e}")))?;
            stores.insert(name.to_string(), map);
        }

        debug!(root = %root.display(), stores = stores.len(), "opened file store");
        Ok(Self {
            root,
            stores: Mutex::new(stores),
        })
    }

    /// Open the default-named database under `parent`.
    pub async fn open_default(parent: impl AsRef<Path>, version: u64) -> Result<Self> {
        Self::open(
            parent.as_ref().join(crate::async_cache::DEFAULT_DB_NAME),
            version,
        )
        .await
    }

    fn store_path(&self, store: &str) -> PathBuf {
        self.root.join(format!("{store}.json"))
    }

    async fn flush_store(&self, store: &str, map: &StoreMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| OrbitError::Storage(e.to_string()))?;
        write_atomic(&self.store_path(store), &bytes).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| OrbitError::Storage(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| OrbitError::Storage(e.to_string()))
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .stores
            .lock()
            .await
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .stores
            .lock()
            .await
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
        let mut stores = self.stores.lock().await;

        // Stage the whole batch against copies, flush every touched store,
        // and only then adopt the staged maps.
        let mut staged: BTreeMap<String, StoreMap> = BTreeMap::new();
        for op in &batch {
            let map = staged.entry(op.store.clone()).or_insert_with(|| {
                stores.get(&op.store).cloned().unwrap_or_default()
            });
            match &op.value {
                Some(value) => {
                    map.insert(op.key.clone(), value.clone());
                }
                None => {
                    map.remove(&op.key);
                }
            }
        }
        for (store, map) in &staged {
            self.flush_store(store, map).await?;
        }
        for (store, map) in staged {
            stores.insert(store, map);
        }
        Ok(())
    }

    async fn clear_store(&self, store: &str) -> Result<()> {
        let mut stores = self.stores.lock().await;
        stores.remove(store);
        let _ = tokio::fs::remove_file(self.store_path(store)).await;
        Ok(())
    }
}

/// File-backed bucket for task-queue and transform-log persistence: one JSON
/// file holding a key/value map.
pub struct JsonBucket {
    path: PathBuf,
    entries: Mutex<StoreMap>,
}

impl JsonBucket {
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrbitError::Storage(e.to_string()))?;
        }
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| OrbitError::Storage(format!("corrupt bucket: {e}")))?,
            Err(_) => StoreMap::new(),
        };
        Ok(Arc::new(Self {
            path,
            entries: Mutex::new(entries),
        }))
    }

    async fn flush(&self, entries: &StoreMap) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(entries).map_err(|e| OrbitError::Storage(e.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl Bucket for JsonBucket {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        self.flush(&entries).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}
