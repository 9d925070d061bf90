//! The persistent source: the async record cache composed with the request
//! protocol. Activation completes only after the store has been hydrated.

use std::sync::Arc;

use async_trait::async_trait;

use orbit::{
    perform_query_request, perform_transform_request, KeyMap, Pullable, QueryKind, Queryable,
    Request, Source, SourceCore, Syncable, TransformKind, Updatable,
};
use orbit_api::{
    FullResponse, OrbitError, Query, QueryResult, RecordOperation, ResponseData, Result, Schema,
    Transform,
};
use orbit_core::{FailurePolicy, Performer, TaskQueue};

use crate::async_cache::AsyncRecordCache;
use crate::object_store::ObjectStore;

struct PersistentPerformer {
    core: Arc<SourceCore>,
    cache: Arc<AsyncRecordCache>,
}

async fn handle_update(
    cache: &AsyncRecordCache,
    transform: Transform,
) -> Result<FullResponse> {
    let single_op = transform.operations.len() == 1;
    let result = cache.update(&transform).await?;

    let mut response =
        FullResponse::default().with_inverse_operations(result.inverse_operations);
    response.data = if single_op {
        ResponseData::Record(result.data.into_iter().next().flatten())
    } else {
        ResponseData::Records(result.data.into_iter().flatten().collect())
    };
    if result.changed {
        response.transforms = vec![transform];
    }
    Ok(response)
}

async fn handle_query(cache: &AsyncRecordCache, query: Query) -> Result<FullResponse> {
    let results = cache.query(&query).await?;
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

async fn handle_pull(cache: &AsyncRecordCache, query: Query) -> Result<FullResponse> {
    let results = cache.query(&query).await?;
    let mut operations = Vec::new();
    for result in results {
        match result {
            QueryResult::Record(Some(record)) => {
                operations.push(RecordOperation::UpdateRecord { record });
            }
            QueryResult::Record(None) => {}
            QueryResult::Records(records) => {
                for record in records {
                    operations.push(RecordOperation::UpdateRecord { record });
                }
            }
        }
    }
    let transforms = if operations.is_empty() {
        vec![]
    } else {
        vec![Transform::new(operations)]
    };
    Ok(FullResponse::default()
        .with_data(ResponseData::Transforms(transforms.clone()))
        .with_transforms(transforms))
}

#[async_trait]
impl Performer<Request, FullResponse> for PersistentPerformer {
    async fn perform(&self, request: Request) -> Result<FullResponse> {
        match request {
            Request::Update { transform } => {
                perform_transform_request(&self.core, TransformKind::Update, transform, |t, _| {
                    let cache = Arc::clone(&self.cache);
                    async move { handle_update(&cache, t).await }
                })
                .await
            }
            Request::Sync { transform } => {
                perform_transform_request(&self.core, TransformKind::Sync, transform, |t, _| {
                    let cache = Arc::clone(&self.cache);
                    async move { handle_update(&cache, t).await }
                })
                .await
            }
            Request::Query { query } => {
                perform_query_request(&self.core, QueryKind::Query, query, |q, _| {
                    let cache = Arc::clone(&self.cache);
                    async move { handle_query(&cache, q).await }
                })
                .await
            }
            Request::Pull { query } => {
                perform_query_request(&self.core, QueryKind::Pull, query, |q, _| {
                    let cache = Arc::clone(&self.cache);
                    async move { handle_pull(&cache, q).await }
                })
                .await
            }
            Request::Push { .. } => Err(OrbitError::Assertion(
                "the persistent source is not pushable".to_string(),
            )),
        }
    }
}

/// Durable source over an object store.
pub struct PersistentSource {
    core: Arc<SourceCore>,
    queue: TaskQueue<Request, FullResponse>,
    cache: Arc<AsyncRecordCache>,
}

impl PersistentSource {
    pub async fn open(
        name: impl Into<String>,
        schema: Schema,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        Self::open_with_key_map(name, schema, object_store, None).await
    }

    pub async fn open_with_key_map(
        name: impl Into<String>,
        schema: Schema,
        object_store: Arc<dyn ObjectStore>,
        key_map: Option<Arc<KeyMap>>,
    ) -> Result<Self> {
        let core = SourceCore::new(name);
        let cache = Arc::new(
            AsyncRecordCache::open(Arc::new(schema), key_map, object_store).await?,
        );
        let performer = Arc::new(PersistentPerformer {
            core: Arc::clone(&core),
            cache: Arc::clone(&cache),
        });
        let queue = TaskQueue::new(
            format!("{}-requests", core.name()),
            performer,
            FailurePolicy::Fail,
        );
        // Activation gates the request flow on hydration having finished.
        core.activate();
        Ok(Self { core, queue, cache })
    }

    pub fn record_cache(&self) -> &Arc<AsyncRecordCache> {
        &self.cache
    }
}

impl Source for PersistentSource {
    fn core(&self) -> &Arc<SourceCore> {
        &self.core
    }

    fn request_queue(&self) -> &TaskQueue<Request, FullResponse> {
        &self.queue
    }
}

impl Updatable for PersistentSource {}
impl Queryable for PersistentSource {}
impl Syncable for PersistentSource {}
impl Pullable for PersistentSource {}
