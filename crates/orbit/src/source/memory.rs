//! The in-memory source: a record cache composed with the request protocol,
//! plus the fork / merge / rebase / rollback family.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use orbit_api::{
    FullResponse, NamedResponse, OrbitError, Query, QueryResult, Record, RecordOperation,
    RequestOptions, ResponseData, Result, Schema, Transform,
};
use orbit_core::{FailurePolicy, Performer, TaskQueue};

use crate::cache::{KeyMap, RecordCache};
use crate::coalesce::coalesce_operations;
use crate::source::{
    perform_query_request, perform_transform_request, QueryKind, Queryable, Request, Source,
    SourceCore, Syncable, TransformKind, Updatable,
};

/// Options for [`MemorySource::merge`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Collapse redundant operations into a reduced transform.
    pub coalesce: bool,
    /// Only merge transforms after this id; all of the fork's transforms
    /// otherwise.
    pub since_transform_id: Option<String>,
    pub transform_options: Option<RequestOptions>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            coalesce: true,
            since_transform_id: None,
            transform_options: None,
        }
    }
}

/// Cache plus the transform/inverse bookkeeping shared with the performer.
struct MemoryStore {
    cache: RwLock<RecordCache>,
    transforms: RwLock<HashMap<String, Transform>>,
    inverses: RwLock<HashMap<String, Vec<RecordOperation>>>,
}

impl MemoryStore {
    fn new(cache: RecordCache) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(cache),
            transforms: RwLock::new(HashMap::new()),
            inverses: RwLock::new(HashMap::new()),
        })
    }

    fn cache(&self) -> RwLockReadGuard<'_, RecordCache> {
        self.cache.read().expect("cache lock poisoned")
    }

    /// Apply a transform to the cache; record it (and its inverses) iff it
    /// mutated the cache.
    fn apply_transform(&self, transform: &Transform) -> Result<(bool, Vec<Option<Record>>, Vec<RecordOperation>)> {
        let result = {
            let mut cache = self.cache.write().expect("cache lock poisoned");
            cache.update(transform)?
        };
        if result.changed {
            self.transforms
                .write()
                .expect("transforms lock poisoned")
                .insert(transform.id.clone(), transform.clone());
            self.inverses
                .write()
                .expect("inverses lock poisoned")
                .insert(transform.id.clone(), result.inverse_operations.clone());
        }
        Ok((result.changed, result.data, result.inverse_operations))
    }

    fn inverse_of(&self, transform_id: &str) -> Vec<RecordOperation> {
        self.inverses
            .read()
            .expect("inverses lock poisoned")
            .get(transform_id)
            .cloned()
            .unwrap_or_default()
    }

    fn stored_transform(&self, transform_id: &str) -> Option<Transform> {
        self.transforms
            .read()
            .expect("transforms lock poisoned")
            .get(transform_id)
            .cloned()
    }

    fn forget(&self, transform_id: &str) {
        self.transforms
            .write()
            .expect("transforms lock poisoned")
            .remove(transform_id);
        self.inverses
            .write()
            .expect("inverses lock poisoned")
            .remove(transform_id);
    }
}

struct ForkState {
    parent_core: Arc<SourceCore>,
    parent_store: Arc<MemoryStore>,
    fork_point: RwLock<Option<String>>,
}

struct MemoryPerformer {
    core: Arc<SourceCore>,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Performer<Request, FullResponse> for MemoryPerformer {
    async fn perform(&self, request: Request) -> Result<FullResponse> {
        match request {
            Request::Update { transform } => {
                perform_transform_request(&self.core, TransformKind::Update, transform, |t, hints| {
                    let store = Arc::clone(&self.store);
                    async move { handle_update(&store, t, hints) }
                })
                .await
            }
            Request::Sync { transform } => {
                perform_transform_request(&self.core, TransformKind::Sync, transform, |t, _hints| {
                    let store = Arc::clone(&self.store);
                    async move { handle_sync(&store, t) }
                })
                .await
            }
            Request::Query { query } => {
                perform_query_request(&self.core, QueryKind::Query, query, |q, _hints| {
                    let store = Arc::clone(&self.store);
                    async move { handle_query(&store, q) }
                })
                .await
            }
            other @ (Request::Pull { .. } | Request::Push { .. }) => Err(OrbitError::Assertion(
                format!("memory source cannot perform {other:?}"),
            )),
        }
    }
}

fn handle_update(
    store: &MemoryStore,
    transform: Transform,
    hints: Vec<NamedResponse>,
) -> Result<FullResponse> {
    let (changed, data, inverse) = store.apply_transform(&transform)?;

    let mut response = FullResponse::default().with_inverse_operations(inverse);
    response.data = match hints.iter().find(|hint| hint.response.data != ResponseData::None) {
        Some(hint) => hint.response.data.clone(),
        None if transform.operations.len() == 1 => {
            ResponseData::Record(data.into_iter().next().flatten())
        }
        None => ResponseData::Records(data.into_iter().flatten().collect()),
    };
    if changed {
        response.transforms = vec![transform];
    }
    Ok(response)
}

fn handle_sync(store: &MemoryStore, transform: Transform) -> Result<FullResponse> {
    let (changed, _, inverse) = store.apply_transform(&transform)?;
    let mut response = FullResponse::default().with_inverse_operations(inverse);
    if changed {
        response.transforms = vec![transform];
    }
    Ok(response)
}

fn handle_query(store: &MemoryStore, query: Query) -> Result<FullResponse> {
    let results = store.cache().query_sync(&query)?;
    let data = if results.len() == 1 {
        match results.into_iter().next().expect("one result") {
            QueryResult::Record(record) => ResponseData::Record(record),
            QueryResult::Records(records) => ResponseData::Records(records),
        }
    } else {
        ResponseData::Results(results)
    };
    Ok(FullResponse::default().with_data(data))
}

/// In-memory source. Construct inside a tokio runtime (the request queue
/// spawns its processor on the current runtime).
pub struct MemorySource {
    core: Arc<SourceCore>,
    queue: TaskQueue<Request, FullResponse>,
    store: Arc<MemoryStore>,
    fork_state: Option<ForkState>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self::with_cache(name, RecordCache::new(Arc::new(schema)), None)
    }

    pub fn with_key_map(name: impl Into<String>, schema: Schema, key_map: Arc<KeyMap>) -> Self {
        Self::with_cache(
            name,
            RecordCache::with_key_map(Arc::new(schema), key_map),
            None,
        )
    }

    fn with_cache(
        name: impl Into<String>,
        cache: RecordCache,
        fork_state: Option<ForkState>,
    ) -> Self {
        let core = SourceCore::new(name);
        let store = MemoryStore::new(cache);
        let performer = Arc::new(MemoryPerformer {
            core: Arc::clone(&core),
            store: Arc::clone(&store),
        });
        let queue = TaskQueue::new(
            format!("{}-requests", core.name()),
            performer,
            FailurePolicy::Skip,
        );
        core.activate();
        Self {
            core,
            queue,
            store,
            fork_state,
        }
    }

    /// Read access to the cache's sync surface.
    pub fn cache(&self) -> RwLockReadGuard<'_, RecordCache> {
        self.store.cache()
    }

    /// The stored transform objects for every log entry, in log order.
    pub fn all_transforms(&self) -> Vec<Transform> {
        self.core
            .log()
            .entries()
            .iter()
            .filter_map(|id| self.store.stored_transform(id))
            .collect()
    }

    /// Stored transforms strictly after `transform_id`, in log order.
    pub fn transforms_since(&self, transform_id: &str) -> Result<Vec<Transform>> {
        Ok(self
            .core
            .log()
            .after(transform_id)?
            .iter()
            .filter_map(|id| self.store.stored_transform(id))
            .collect())
    }

    /// The parent's log head at the moment this fork was created.
    pub fn fork_point(&self) -> Option<String> {
        self.fork_state
            .as_ref()
            .and_then(|fork| fork.fork_point.read().expect("fork point lock poisoned").clone())
    }

    /// Create a child source whose cache shares this source's current state
    /// as an immutable snapshot.
    pub fn fork(&self) -> MemorySource {
        let cache = self.store.cache();
        let snapshot = cache.snapshot();
        let forked_cache = RecordCache::fork_from(
            cache.schema().clone(),
            cache.key_map().cloned(),
            snapshot,
        );
        drop(cache);

        let name = format!("{}-fork-{}", self.core.name(), &Uuid::new_v4().to_string()[..8]);
        debug!(parent = %self.core.name(), fork = %name, "forking source");
        Self::with_cache(
            name,
            forked_cache,
            Some(ForkState {
                parent_core: Arc::clone(&self.core),
                parent_store: Arc::clone(&self.store),
                fork_point: RwLock::new(self.core.log().head()),
            }),
        )
    }

    /// Fold a fork's transforms into one reduced transform and apply it
    /// here. Last writer wins; coalescing collapses redundant operations.
    pub async fn merge(&self, fork: &MemorySource, options: MergeOptions) -> Result<ResponseData> {
        let transforms = match &options.since_transform_id {
            Some(id) => fork.transforms_since(id)?,
            None => fork.all_transforms(),
        };
        let operations: Vec<RecordOperation> = transforms
            .into_iter()
            .flat_map(|transform| transform.operations)
            .collect();
        let operations = if options.coalesce {
            coalesce_operations(operations)
        } else {
            operations
        };
        debug!(source = %self.core.name(), ops = operations.len(), "merging fork");

        let mut transform = Transform::new(operations);
        if let Some(transform_options) = options.transform_options {
            transform = transform.with_options(transform_options);
        }
        self.update(transform).await
    }

    /// Reset onto the parent's current history: undo local transforms,
    /// replay the parent's delta, re-apply local transforms, advance the
    /// fork point.
    pub async fn rebase(&self) -> Result<()> {
        let fork_state = self.fork_state.as_ref().ok_or_else(|| {
            OrbitError::Assertion("rebase requires a source created by fork()".to_string())
        })?;

        let fork_point = fork_state
            .fork_point
            .read()
            .expect("fork point lock poisoned")
            .clone();
        let base_ids = match &fork_point {
            Some(id) => fork_state.parent_core.log().after(id)?,
            None => fork_state.parent_core.log().entries(),
        };
        let base_transforms: Vec<Transform> = base_ids
            .iter()
            .filter_map(|id| fork_state.parent_store.stored_transform(id))
            .collect();
        if base_transforms.is_empty() {
            return Ok(());
        }

        let local_transforms = self.all_transforms();
        debug!(
            source = %self.core.name(),
            base = base_transforms.len(),
            local = local_transforms.len(),
            "rebasing fork"
        );

        // Undo local work, newest first.
        for transform in local_transforms.iter().rev() {
            let inverse = self.store.inverse_of(&transform.id);
            let mut cache = self.store.cache.write().expect("cache lock poisoned");
            cache.patch(&inverse)?;
        }
        self.core.log().clear().await;

        // Replay the parent's delta, then local work, in order.
        for transform in base_transforms.iter().chain(local_transforms.iter()) {
            self.store.apply_transform(transform)?;
            self.core.log().append(&transform.id).await?;
        }

        *fork_state
            .fork_point
            .write()
            .expect("fork point lock poisoned") = fork_state.parent_core.log().head();
        Ok(())
    }

    /// Discard every transform after the marker and restore the cache by
    /// replaying stored inverses, newest first.
    pub async fn rollback(&self, transform_id: &str, relative: i64) -> Result<()> {
        let removed = self.core.log().rollback(transform_id, relative).await?;
        for id in removed.iter().rev() {
            let inverse = self.store.inverse_of(id);
            {
                let mut cache = self.store.cache.write().expect("cache lock poisoned");
                cache.patch(&inverse)?;
            }
            self.store.forget(id);
        }
        Ok(())
    }
}

impl Source for MemorySource {
    fn core(&self) -> &Arc<SourceCore> {
        &self.core
    }

    fn request_queue(&self) -> &TaskQueue<Request, FullResponse> {
        &self.queue
    }
}

impl Updatable for MemorySource {}
impl Queryable for MemorySource {}
impl Syncable for MemorySource {}
