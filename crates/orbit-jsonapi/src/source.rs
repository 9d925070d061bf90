//! The JSON:API source: updatable / queryable / pullable / pushable over an
//! HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use orbit::{
    perform_query_request, perform_transform_request, KeyMap, Pullable, Pushable, QueryKind,
    Queryable, Request, Source, SourceCore, TransformKind, Updatable,
};
use orbit_api::{
    FullResponse, OrbitError, Query, QueryResult, Record, RecordOperation, RequestOptions,
    ResponseData, Result, Transform,
};
use orbit_core::{FailurePolicy, Performer, TaskQueue};

use crate::documents::{PrimaryData, Resource, ResourceDocument};
use crate::requests::RequestBuilder;
use crate::serializer::JsonApiSerializer;
use crate::transport::{JsonApiResponse, JsonApiTransport};

#[derive(Debug, Clone)]
pub struct JsonApiSourceSettings {
    pub base_url: String,
    /// Key under which remote ids are tracked; `None` shares ids verbatim.
    pub remote_key: Option<String>,
    pub default_timeout_ms: u64,
    /// Deprecated gate, still honoured: the stricter of the two wins.
    pub max_requests_per_transform: Option<usize>,
    /// `defaultTransformOptions.maxRequests` equivalent.
    pub default_max_requests: Option<usize>,
}

impl JsonApiSourceSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            remote_key: Some("remoteId".to_string()),
            default_timeout_ms: 5_000,
            max_requests_per_transform: None,
            default_max_requests: None,
        }
    }
}

struct JsonApiProcessor {
    settings: JsonApiSourceSettings,
    serializer: JsonApiSerializer,
    transport: Arc<dyn JsonApiTransport>,
    key_map: Arc<KeyMap>,
}

impl JsonApiProcessor {
    fn timeout(&self, options: &RequestOptions) -> Duration {
        Duration::from_millis(options.timeout_ms.unwrap_or(self.settings.default_timeout_ms))
    }

    fn builder<'a>(&'a self, options: &RequestOptions) -> RequestBuilder<'a> {
        RequestBuilder::new(
            &self.settings.base_url,
            &self.serializer,
            self.timeout(options),
        )
    }

    /// The stricter of the configured request-count gates, if any.
    fn request_limit(&self, options: &RequestOptions) -> Option<usize> {
        [
            self.settings.max_requests_per_transform,
            self.settings.default_max_requests,
            options.max_requests,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn check_status(&self, response: &JsonApiResponse) -> Result<()> {
        match response.status {
            200..=299 => Ok(()),
            status @ 400..=499 => Err(OrbitError::Client {
                status,
                description: status_description(status).to_string(),
                data: response.body.clone(),
            }),
            status @ 500..=599 => Err(OrbitError::Server {
                status,
                description: status_description(status).to_string(),
            }),
            status => Err(OrbitError::Network(format!(
                "unexpected response status {status}"
            ))),
        }
    }

    fn parse_document(&self, response: &JsonApiResponse) -> Option<ResourceDocument> {
        response
            .body
            .as_ref()
            .and_then(|body| serde_json::from_value(body.clone()).ok())
    }

    /// Send every request one transform fans out into. Returns the primary
    /// records the server answered with and the transforms this request
    /// produced (the transform itself plus a follow-on reconciliation
    /// transform when the server assigned ids or changed attributes).
    async fn process_transform(
        &self,
        transform: &Transform,
    ) -> Result<(Vec<Record>, Vec<Transform>)> {
        let builder = self.builder(&transform.options);

        // Build everything first: a gated or unbuildable transform must not
        // reach the network at all.
        let mut planned = Vec::with_capacity(transform.operations.len());
        for op in &transform.operations {
            planned.push((op, builder.for_operation(op)?));
        }
        let request_count = planned.iter().filter(|(_, r)| r.is_some()).count();
        if let Some(limit) = self.request_limit(&transform.options) {
            if request_count > limit {
                return Err(OrbitError::TransformNotAllowed {
                    transform_id: transform.id.clone(),
                    reason: format!(
                        "transform requires {request_count} requests, but only {limit} are allowed"
                    ),
                });
            }
        }

        let mut records = Vec::new();
        let mut follow_on: Vec<RecordOperation> = Vec::new();
        for (op, request) in planned {
            let Some(request) = request else { continue };
            let response = self.transport.send(request).await?;
            self.check_status(&response)?;

            let Some(document) = self.parse_document(&response) else {
                continue;
            };
            if let PrimaryData::One(Some(resource)) = &document.data {
                if let RecordOperation::AddRecord { record } = op {
                    follow_on.extend(self.reconcile_added_record(record, resource));
                }
                records.push(self.serializer.deserialize_resource(resource));
            }
        }

        let mut produced = vec![transform.clone()];
        if !follow_on.is_empty() {
            produced.push(Transform::new(follow_on));
        }
        Ok((records, produced))
    }

    /// When the server assigns its own id (or rewrites attributes), emit the
    /// local operations that fold the server's truth back into caches.
    fn reconcile_added_record(
        &self,
        sent: &Record,
        received: &Resource,
    ) -> Vec<RecordOperation> {
        let mut operations = Vec::new();

        if let (Some(key), Some(server_id)) = (&self.settings.remote_key, &received.id) {
            let known = self
                .key_map
                .key_from_id(sent.kind(), key, sent.id());
            if known.as_deref() != Some(server_id.as_str()) {
                debug!(
                    kind = sent.kind(),
                    id = sent.id(),
                    server_id = %server_id,
                    "server assigned a new remote id"
                );
                self.key_map
                    .push_key(sent.kind(), sent.id(), key, server_id);
                operations.push(RecordOperation::ReplaceKey {
                    record: sent.identity.clone(),
                    key: key.clone(),
                    value: Some(server_id.clone()),
                });
            }
        }

        if let Some(attributes) = &received.attributes {
            for (name, value) in attributes {
                if sent.attribute(name) != Some(value) {
                    operations.push(RecordOperation::ReplaceAttribute {
                        record: sent.identity.clone(),
                        attribute: name.clone(),
                        value: Some(value.clone()),
                    });
                }
            }
        }
        operations
    }

    async fn handle_update(&self, transform: Transform) -> Result<FullResponse> {
        let single_op = transform.operations.len() == 1;
        let (records, produced) = self.process_transform(&transform).await?;
        let mut response = FullResponse::default().with_transforms(produced);
        response.data = if single_op {
            ResponseData::Record(records.into_iter().next())
        } else {
            ResponseData::Records(records)
        };
        Ok(response)
    }

    async fn handle_push(&self, transform: Transform) -> Result<FullResponse> {
        let (_, produced) = self.process_transform(&transform).await?;
        Ok(FullResponse::default()
            .with_data(ResponseData::Transforms(produced.clone()))
            .with_transforms(produced))
    }

    async fn handle_query(&self, query: Query) -> Result<FullResponse> {
        let builder = self.builder(&query.options);
        let mut results = Vec::with_capacity(query.expressions.len());
        for expression in &query.expressions {
            let request = builder.for_expression(expression)?;
            let response = self.transport.send(request).await?;
            self.check_status(&response)?;
            let result = match self.parse_document(&response).map(|doc| doc.data) {
                Some(PrimaryData::One(resource)) => QueryResult::Record(
                    resource
                        .as_ref()
                        .map(|resource| self.serializer.deserialize_resource(resource)),
                ),
                Some(PrimaryData::Many(resources)) => QueryResult::Records(
                    resources
                        .iter()
                        .map(|resource| self.serializer.deserialize_resource(resource))
                        .collect(),
                ),
                None => QueryResult::Record(None),
            };
            results.push(result);
        }

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

    async fn handle_pull(&self, query: Query) -> Result<FullResponse> {
        let builder = self.builder(&query.options);
        let mut operations = Vec::new();
        for expression in &query.expressions {
            let request = builder.for_expression(expression)?;
            let response = self.transport.send(request).await?;
            self.check_status(&response)?;
            let resources = match self.parse_document(&response).map(|doc| doc.data) {
                Some(PrimaryData::One(Some(resource))) => vec![resource],
                Some(PrimaryData::Many(resources)) => resources,
                _ => vec![],
            };
            for resource in &resources {
                operations.push(RecordOperation::UpdateRecord {
                    record: self.serializer.deserialize_resource(resource),
                });
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
}

struct JsonApiPerformer {
    core: Arc<SourceCore>,
    processor: Arc<JsonApiProcessor>,
}

#[async_trait]
impl Performer<Request, FullResponse> for JsonApiPerformer {
    async fn perform(&self, request: Request) -> Result<FullResponse> {
        match request {
            Request::Update { transform } => {
                perform_transform_request(&self.core, TransformKind::Update, transform, |t, _| {
                    let processor = Arc::clone(&self.processor);
                    async move { processor.handle_update(t).await }
                })
                .await
            }
            Request::Push { transform } => {
                perform_transform_request(&self.core, TransformKind::Push, transform, |t, _| {
                    let processor = Arc::clone(&self.processor);
                    async move { processor.handle_push(t).await }
                })
                .await
            }
            Request::Query { query } => {
                perform_query_request(&self.core, QueryKind::Query, query, |q, _| {
                    let processor = Arc::clone(&self.processor);
                    async move { processor.handle_query(q).await }
                })
                .await
            }
            Request::Pull { query } => {
                perform_query_request(&self.core, QueryKind::Pull, query, |q, _| {
                    let processor = Arc::clone(&self.processor);
                    async move { processor.handle_pull(q).await }
                })
                .await
            }
            Request::Sync { .. } => Err(OrbitError::Assertion(
                "the JSON:API source is not syncable".to_string(),
            )),
        }
    }
}

/// Remote source speaking JSON:API. Construct inside a tokio runtime.
pub struct JsonApiSource {
    core: Arc<SourceCore>,
    queue: TaskQueue<Request, FullResponse>,
    processor: Arc<JsonApiProcessor>,
}

impl JsonApiSource {
    pub fn new(
        name: impl Into<String>,
        settings: JsonApiSourceSettings,
        transport: Arc<dyn JsonApiTransport>,
    ) -> Self {
        Self::with_key_map(name, settings, transport, Arc::new(KeyMap::new()))
    }

    /// Share a key map with other sources (typically the memory source) so
    /// remote ids resolve consistently across them.
    pub fn with_key_map(
        name: impl Into<String>,
        settings: JsonApiSourceSettings,
        transport: Arc<dyn JsonApiTransport>,
        key_map: Arc<KeyMap>,
    ) -> Self {
        let core = SourceCore::new(name);
        let serializer =
            JsonApiSerializer::new(settings.remote_key.clone(), Arc::clone(&key_map));
        let processor = Arc::new(JsonApiProcessor {
            settings,
            serializer,
            transport,
            key_map,
        });
        let performer = Arc::new(JsonApiPerformer {
            core: Arc::clone(&core),
            processor: Arc::clone(&processor),
        });
        let queue = TaskQueue::new(
            format!("{}-requests", core.name()),
            performer,
            FailurePolicy::Fail,
        );
        core.activate();
        Self {
            core,
            queue,
            processor,
        }
    }

    pub fn key_map(&self) -> &Arc<KeyMap> {
        &self.processor.key_map
    }
}

impl Source for JsonApiSource {
    fn core(&self) -> &Arc<SourceCore> {
        &self.core
    }

    fn request_queue(&self) -> &TaskQueue<Request, FullResponse> {
        &self.queue
    }
}

impl Updatable for JsonApiSource {}
impl Queryable for JsonApiSource {}
impl Pullable for JsonApiSource {}
impl Pushable for JsonApiSource {}

fn status_description(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "HTTP Error",
    }
}
