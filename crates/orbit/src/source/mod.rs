//! Source base: event wiring, request queue, transform log, activation.
//!
//! A source is an event-emitting state machine. Every externally visible
//! operation (`update`, `query`, `sync`, `pull`, `push`) follows the same
//! protocol: await activation, build the request, dedup transforms against
//! the log, enqueue, and inside the task run the gated `before*` phase, the
//! protected handler, `transformed()` for produced transforms, and the
//! observational post phase. The public future resolves only after every
//! post-event listener has settled.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, warn};

use orbit_api::{
    FullResponse, NamedResponse, OrbitError, Query, QueryBuilder, QueryOrExpressions,
    RequestOptions, ResponseData, Result, Transform, TransformBuilder, TransformOrOperations,
};
use orbit_core::{Emitter, TaskQueue, TransformLog};

/// Source event names.
pub mod source_events {
    pub const TRANSFORM: &str = "transform";
    pub const ERROR: &str = "error";

    pub const BEFORE_UPDATE: &str = "beforeUpdate";
    pub const UPDATE: &str = "update";
    pub const UPDATE_FAIL: &str = "updateFail";

    pub const BEFORE_QUERY: &str = "beforeQuery";
    pub const QUERY: &str = "query";
    pub const QUERY_FAIL: &str = "queryFail";

    pub const BEFORE_SYNC: &str = "beforeSync";
    pub const SYNC: &str = "sync";
    pub const SYNC_FAIL: &str = "syncFail";

    pub const BEFORE_PULL: &str = "beforePull";
    pub const PULL: &str = "pull";
    pub const PULL_FAIL: &str = "pullFail";

    pub const BEFORE_PUSH: &str = "beforePush";
    pub const PUSH: &str = "push";
    pub const PUSH_FAIL: &str = "pushFail";
}

/// Payload delivered to source listeners.
#[derive(Clone, Debug)]
pub enum SourceEvent {
    Transform(Arc<Transform>),
    BeforeTransformRequest {
        kind: &'static str,
        transform: Arc<Transform>,
    },
    TransformRequest {
        kind: &'static str,
        transform: Arc<Transform>,
        response: Arc<FullResponse>,
    },
    TransformRequestFail {
        kind: &'static str,
        transform: Arc<Transform>,
        message: String,
    },
    BeforeQueryRequest {
        kind: &'static str,
        query: Arc<Query>,
    },
    QueryRequest {
        kind: &'static str,
        query: Arc<Query>,
        response: Arc<FullResponse>,
    },
    QueryRequestFail {
        kind: &'static str,
        query: Arc<Query>,
        message: String,
    },
    Error(String),
}

/// One queued request; the payload half of a source's task queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Request {
    Update { transform: Transform },
    Query { query: Query },
    Sync { transform: Transform },
    Pull { query: Query },
    Push { transform: Transform },
}

/// The innards shared between a source handle and its queue performer.
pub struct SourceCore {
    name: String,
    emitter: Emitter<SourceEvent, NamedResponse>,
    log: TransformLog,
    activated_tx: watch::Sender<bool>,
    activated_rx: watch::Receiver<bool>,
}

impl SourceCore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (activated_tx, activated_rx) = watch::channel(false);
        Arc::new(Self {
            log: TransformLog::new(format!("{name}-log")),
            name,
            emitter: Emitter::new(),
            activated_tx,
            activated_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emitter(&self) -> &Emitter<SourceEvent, NamedResponse> {
        &self.emitter
    }

    pub fn log(&self) -> &TransformLog {
        &self.log
    }

    pub fn activate(&self) {
        let _ = self.activated_tx.send(true);
    }

    pub fn deactivate(&self) {
        let _ = self.activated_tx.send(false);
    }

    pub async fn await_activated(&self) -> Result<()> {
        let mut rx = self.activated_rx.clone();
        rx.wait_for(|activated| *activated)
            .await
            .map_err(|_| OrbitError::TaskCancelled(format!("source {} released", self.name)))?;
        Ok(())
    }

    /// Surface listener failures from settle-in-series events: logged and
    /// re-emitted as an `error` event, never propagated.
    pub async fn surface_listener_errors(&self, errors: Vec<OrbitError>) {
        for err in errors {
            error!(source = %self.name, %err, "listener failed");
            let _ = self
                .emitter
                .settle_in_series(source_events::ERROR, &SourceEvent::Error(err.to_string()))
                .await;
        }
    }
}

/// Append produced transforms to the log (skipping those already contained)
/// and notify `transform` listeners, in order, before the request resolves.
pub async fn transformed(core: &SourceCore, transforms: &[Transform]) {
    for transform in transforms {
        match core.log().append(&transform.id).await {
            Ok(true) => {
                let errors = core
                    .emitter()
                    .settle_in_series(
                        source_events::TRANSFORM,
                        &SourceEvent::Transform(Arc::new(transform.clone())),
                    )
                    .await;
                core.surface_listener_errors(errors).await;
            }
            Ok(false) => {}
            Err(err) => warn!(source = %core.name, %err, "failed to append transform"),
        }
    }
}

#[derive(Clone, Copy)]
pub enum TransformKind {
    Update,
    Sync,
    Push,
}

impl TransformKind {
    fn names(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            TransformKind::Update => (
                source_events::BEFORE_UPDATE,
                source_events::UPDATE,
                source_events::UPDATE_FAIL,
            ),
            TransformKind::Sync => (
                source_events::BEFORE_SYNC,
                source_events::SYNC,
                source_events::SYNC_FAIL,
            ),
            TransformKind::Push => (
                source_events::BEFORE_PUSH,
                source_events::PUSH,
                source_events::PUSH_FAIL,
            ),
        }
    }
}

#[derive(Clone, Copy)]
pub enum QueryKind {
    Query,
    Pull,
}

impl QueryKind {
    fn names(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            QueryKind::Query => (
                source_events::BEFORE_QUERY,
                source_events::QUERY,
                source_events::QUERY_FAIL,
            ),
            QueryKind::Pull => (
                source_events::BEFORE_PULL,
                source_events::PULL,
                source_events::PULL_FAIL,
            ),
        }
    }
}

/// The inside-the-task half of the request protocol for transform-shaped
/// requests (`update`, `sync`, `push`).
pub async fn perform_transform_request<F, Fut>(
    core: &SourceCore,
    kind: TransformKind,
    transform: Transform,
    handler: F,
) -> Result<FullResponse>
where
    F: FnOnce(Transform, Vec<NamedResponse>) -> Fut + Send,
    Fut: std::future::Future<Output = Result<FullResponse>> + Send,
{
    let (before_event, post_event, fail_event) = kind.names();
    let shared = Arc::new(transform.clone());

    // Idempotent re-apply: a transform already in the log is a no-op.
    if core.log().contains(&transform.id) {
        return Ok(FullResponse::empty());
    }

    let include_sources = transform.options.include_sources;
    let result: Result<FullResponse> = async {
        let hints = core
            .emitter()
            .fulfill_in_series(
                before_event,
                &SourceEvent::BeforeTransformRequest {
                    kind: before_event,
                    transform: Arc::clone(&shared),
                },
            )
            .await?;
        let hints: Vec<NamedResponse> = hints.into_iter().flatten().collect();

        let mut response = handler(transform, hints.clone()).await?;
        if include_sources {
            for hint in &hints {
                if let Some(name) = &hint.source {
                    response
                        .sources
                        .insert(name.clone(), hint.response.clone());
                }
            }
        }

        if !response.transforms.is_empty() {
            transformed(core, &response.transforms).await;
        }

        let errors = core
            .emitter()
            .settle_in_series(
                post_event,
                &SourceEvent::TransformRequest {
                    kind: post_event,
                    transform: Arc::clone(&shared),
                    response: Arc::new(response.clone()),
                },
            )
            .await;
        core.surface_listener_errors(errors).await;
        Ok(response)
    }
    .await;

    if let Err(err) = &result {
        let errors = core
            .emitter()
            .settle_in_series(
                fail_event,
                &SourceEvent::TransformRequestFail {
                    kind: fail_event,
                    transform: shared,
                    message: err.to_string(),
                },
            )
            .await;
        core.surface_listener_errors(errors).await;
    }
    result
}

/// The inside-the-task half for query-shaped requests (`query`, `pull`).
pub async fn perform_query_request<F, Fut>(
    core: &SourceCore,
    kind: QueryKind,
    query: Query,
    handler: F,
) -> Result<FullResponse>
where
    F: FnOnce(Query, Vec<NamedResponse>) -> Fut + Send,
    Fut: std::future::Future<Output = Result<FullResponse>> + Send,
{
    let (before_event, post_event, fail_event) = kind.names();
    let shared = Arc::new(query.clone());
    let include_sources = query.options.include_sources;

    let result: Result<FullResponse> = async {
        let hints = core
            .emitter()
            .fulfill_in_series(
                before_event,
                &SourceEvent::BeforeQueryRequest {
                    kind: before_event,
                    query: Arc::clone(&shared),
                },
            )
            .await?;
        let hints: Vec<NamedResponse> = hints.into_iter().flatten().collect();

        let mut response = handler(query, hints.clone()).await?;
        if include_sources {
            for hint in &hints {
                if let Some(name) = &hint.source {
                    response
                        .sources
                        .insert(name.clone(), hint.response.clone());
                }
            }
        }

        if !response.transforms.is_empty() {
            transformed(core, &response.transforms).await;
        }

        let errors = core
            .emitter()
            .settle_in_series(
                post_event,
                &SourceEvent::QueryRequest {
                    kind: post_event,
                    query: Arc::clone(&shared),
                    response: Arc::new(response.clone()),
                },
            )
            .await;
        core.surface_listener_errors(errors).await;
        Ok(response)
    }
    .await;

    if let Err(err) = &result {
        let errors = core
            .emitter()
            .settle_in_series(
                fail_event,
                &SourceEvent::QueryRequestFail {
                    kind: fail_event,
                    query: shared,
                    message: err.to_string(),
                },
            )
            .await;
        core.surface_listener_errors(errors).await;
    }
    result
}

/// Common surface of every source.
#[async_trait]
pub trait Source: Send + Sync {
    fn core(&self) -> &Arc<SourceCore>;
    fn request_queue(&self) -> &TaskQueue<Request, FullResponse>;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Read-only view of the applied-transform log.
    fn transform_log(&self) -> &TransformLog {
        self.core().log()
    }

    /// Event bus: `on`/`off`/`one` plus the emit modes.
    fn events(&self) -> &Emitter<SourceEvent, NamedResponse> {
        self.core().emitter()
    }

    fn transform_builder(&self) -> TransformBuilder {
        TransformBuilder
    }

    fn query_builder(&self) -> QueryBuilder {
        QueryBuilder
    }

    /// Resolves once async initialization has completed.
    async fn activated(&self) -> Result<()> {
        self.core().await_activated().await
    }

    /// Record externally produced transforms in the log and notify
    /// `transform` listeners.
    async fn transformed(&self, transforms: &[Transform]) {
        transformed(self.core(), transforms).await;
    }

    /// Tear down: reject queued work and clear the log.
    async fn deactivate(&self) {
        self.core().deactivate();
        self.request_queue().clear().await;
        self.core().log().clear().await;
    }
}

/// Shared enqueue path for transform-shaped public methods.
pub async fn enqueue_transform_request<S: Source + ?Sized>(
    source: &S,
    wrap: fn(Transform) -> Request,
    input: TransformOrOperations,
    options: Option<RequestOptions>,
    id: Option<String>,
) -> Result<FullResponse> {
    source.activated().await?;
    let transform = input.build(options, id);
    if source.transform_log().contains(&transform.id) {
        return Ok(FullResponse::empty());
    }
    source.request_queue().push(wrap(transform)).await
}

/// Shared enqueue path for query-shaped public methods.
pub async fn enqueue_query_request<S: Source + ?Sized>(
    source: &S,
    wrap: fn(Query) -> Request,
    input: QueryOrExpressions,
    options: Option<RequestOptions>,
    id: Option<String>,
) -> Result<FullResponse> {
    source.activated().await?;
    let query = input.build(options, id);
    source.request_queue().push(wrap(query)).await
}

/// Sources that apply transforms requested by callers.
#[async_trait]
pub trait Updatable: Source {
    async fn update_full(
        &self,
        input: TransformOrOperations,
        options: Option<RequestOptions>,
        id: Option<String>,
    ) -> Result<FullResponse> {
        enqueue_transform_request(
            self,
            |transform| Request::Update { transform },
            input,
            options,
            id,
        )
        .await
    }

    async fn update<I>(&self, input: I) -> Result<ResponseData>
    where
        I: Into<TransformOrOperations> + Send,
    {
        Ok(self.update_full(input.into(), None, None).await?.data)
    }
}

/// Sources that evaluate queries.
#[async_trait]
pub trait Queryable: Source {
    async fn query_full(
        &self,
        input: QueryOrExpressions,
        options: Option<RequestOptions>,
        id: Option<String>,
    ) -> Result<FullResponse> {
        enqueue_query_request(self, |query| Request::Query { query }, input, options, id).await
    }

    async fn query<I>(&self, input: I) -> Result<ResponseData>
    where
        I: Into<QueryOrExpressions> + Send,
    {
        Ok(self.query_full(input.into(), None, None).await?.data)
    }
}

/// Sources that accept transforms produced elsewhere.
#[async_trait]
pub trait Syncable: Source {
    async fn sync(&self, transform: Transform) -> Result<()> {
        self.activated().await?;
        if self.transform_log().contains(&transform.id) {
            return Ok(());
        }
        self.request_queue()
            .push(Request::Sync { transform })
            .await?;
        Ok(())
    }
}

/// Sources that fetch transforms from elsewhere (typically a server).
#[async_trait]
pub trait Pullable: Source {
    async fn pull_full(
        &self,
        input: QueryOrExpressions,
        options: Option<RequestOptions>,
        id: Option<String>,
    ) -> Result<FullResponse> {
        enqueue_query_request(self, |query| Request::Pull { query }, input, options, id).await
    }

    async fn pull<I>(&self, input: I) -> Result<Vec<Transform>>
    where
        I: Into<QueryOrExpressions> + Send,
    {
        let response = self.pull_full(input.into(), None, None).await?;
        match response.data {
            ResponseData::Transforms(transforms) => Ok(transforms),
            _ => Ok(response.transforms),
        }
    }
}

/// Sources that send transforms elsewhere (typically a server).
#[async_trait]
pub trait Pushable: Source {
    async fn push_full(
        &self,
        input: TransformOrOperations,
        options: Option<RequestOptions>,
        id: Option<String>,
    ) -> Result<FullResponse> {
        enqueue_transform_request(
            self,
            |transform| Request::Push { transform },
            input,
            options,
            id,
        )
        .await
    }

    async fn push<I>(&self, input: I) -> Result<Vec<Transform>>
    where
        I: Into<TransformOrOperations> + Send,
    {
        let response = self.push_full(input.into(), None, None).await?;
        match response.data {
            ResponseData::Transforms(transforms) => Ok(transforms),
            _ => Ok(response.transforms),
        }
    }
}
