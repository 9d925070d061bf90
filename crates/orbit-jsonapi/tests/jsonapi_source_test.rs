//! JSON:API source scenarios against the fake transport.

use std::sync::{Arc, Mutex};

use orbit::{source_events, Pullable, Pushable, Queryable, Source, Updatable};
use orbit_api::{
    OrbitError, QueryBuilder, Record, RecordIdentity, RecordOperation, RequestOptions,
    ResponseData, Transform, TransformOrOperations,
};
use orbit_jsonapi::{
    FakeTransport, HttpMethod, JsonApiResponse, JsonApiSource, JsonApiSourceSettings,
};
use serde_json::json;

fn source_with_transport() -> (JsonApiSource, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::new());
    let source = JsonApiSource::new(
        "remote",
        JsonApiSourceSettings::new("http://api.test"),
        transport.clone(),
    );
    (source, transport)
}

fn add_planet() -> RecordOperation {
    RecordOperation::AddRecord {
        record: Record::new("planet", "p1").with_attribute("name", "Jupiter"),
    }
}

#[tokio::test]
async fn test_update_posts_and_reconciles_server_id() {
    // The server answers with its own id; the source emits a second
    // transform carrying replaceKey, and the key map learns the mapping.
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse::ok(json!({
        "data": {
            "type": "planet",
            "id": "12345",
            "attributes": { "name": "Jupiter" }
        }
    })));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let events = observed.clone();
    source.events().on(source_events::TRANSFORM, move |event| {
        let events = events.clone();
        async move {
            if let orbit::SourceEvent::Transform(transform) = event {
                events.lock().unwrap().push(transform.operations.clone());
            }
            Ok(None)
        }
    });

    source.update(add_planet()).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, HttpMethod::Post);
    assert_eq!(sent[0].url, "http://api.test/planet");

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    assert!(matches!(observed[0][0], RecordOperation::AddRecord { .. }));
    match &observed[1][0] {
        RecordOperation::ReplaceKey { record, key, value } => {
            assert_eq!(record, &RecordIdentity::new("planet", "p1"));
            assert_eq!(key, "remoteId");
            assert_eq!(value.as_deref(), Some("12345"));
        }
        other => panic!("expected replaceKey, got {other:?}"),
    }

    assert_eq!(
        source.key_map().id_from_key("planet", "remoteId", "12345"),
        Some("p1".to_string())
    );
}

#[tokio::test]
async fn test_client_error_carries_parsed_body() {
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse {
        status: 422,
        body: Some(json!({"errors": [{"detail": "name taken"}]})),
    });

    let result = source.update(add_planet()).await;
    match result {
        Err(OrbitError::Client {
            status,
            description,
            data,
        }) => {
            assert_eq!(status, 422);
            assert_eq!(description, "Unprocessable Entity");
            assert!(data.unwrap().to_string().contains("name taken"));
        }
        other => panic!("expected client error, got {other:?}"),
    }
    // A failed request never advances the log.
    assert!(source.transform_log().is_empty());
}

#[tokio::test]
async fn test_server_error_and_network_error() {
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse {
        status: 503,
        body: None,
    });
    assert!(matches!(
        source.update(add_planet()).await,
        Err(OrbitError::Server { status: 503, .. })
    ));

    source.request_queue().skip().await;
    transport.enqueue_error(OrbitError::Network("No fetch response within 10ms.".into()));
    assert!(matches!(
        source.update(add_planet()).await,
        Err(OrbitError::Network(_))
    ));
}

#[tokio::test]
async fn test_max_requests_gate_blocks_before_any_network_call() {
    let transport = Arc::new(FakeTransport::new());
    let mut settings = JsonApiSourceSettings::new("http://api.test");
    settings.max_requests_per_transform = Some(3);
    settings.default_max_requests = Some(1);
    let source = JsonApiSource::new("remote", settings, transport.clone());

    let transform = Transform::new(vec![
        RecordOperation::AddRecord {
            record: Record::new("planet", "a"),
        },
        RecordOperation::AddRecord {
            record: Record::new("planet", "b"),
        },
    ]);
    let result = source
        .update(TransformOrOperations::from(transform))
        .await;

    // The stricter of the two gates (1) wins, and nothing was sent.
    assert!(matches!(
        result,
        Err(OrbitError::TransformNotAllowed { .. })
    ));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_per_transform_options_can_widen_nothing_but_narrow() {
    let transport = Arc::new(FakeTransport::new());
    let settings = JsonApiSourceSettings::new("http://api.test");
    let source = JsonApiSource::new("remote", settings, transport.clone());

    let mut options = RequestOptions::default();
    options.max_requests = Some(0);
    let transform = Transform::new(vec![add_planet()]);
    let result = source
        .update_full(TransformOrOperations::from(transform), Some(options), None)
        .await;
    assert!(matches!(
        result,
        Err(OrbitError::TransformNotAllowed { .. })
    ));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_query_deserializes_documents() {
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse::ok(json!({
        "data": [
            { "type": "planet", "id": "1", "attributes": { "name": "Jupiter" } },
            { "type": "planet", "id": "2", "attributes": { "name": "Earth" } }
        ]
    })));

    let data = source
        .query(QueryBuilder.find_records("planet"))
        .await
        .unwrap();
    let records = match data {
        ResponseData::Records(records) => records,
        other => panic!("unexpected data: {other:?}"),
    };
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].attribute("name"), Some(&json!("Jupiter")));
    assert_eq!(records[0].key("remoteId"), Some("1"));

    assert_eq!(transport.sent()[0].url, "http://api.test/planet");
}

#[tokio::test]
async fn test_pull_returns_upsert_transforms() {
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse::ok(json!({
        "data": [
            { "type": "planet", "id": "1", "attributes": { "name": "Jupiter" } }
        ]
    })));

    let transforms = source
        .pull(QueryBuilder.find_records("planet"))
        .await
        .unwrap();
    assert_eq!(transforms.len(), 1);
    assert_eq!(transforms[0].operations.len(), 1);
    assert!(matches!(
        transforms[0].operations[0],
        RecordOperation::UpdateRecord { .. }
    ));

    // Pulled transforms are recorded in the source's own log.
    assert!(source.transform_log().contains(&transforms[0].id));
}

#[tokio::test]
async fn test_push_returns_produced_transforms() {
    let (source, transport) = source_with_transport();
    transport.enqueue_response(JsonApiResponse::ok(json!({
        "data": { "type": "planet", "id": "9", "attributes": {} }
    })));

    let transform = Transform::new(vec![add_planet()]).with_id("t1");
    let produced = source
        .push(TransformOrOperations::from(transform))
        .await
        .unwrap();

    // The pushed transform plus the id-reconciliation follow-on.
    assert_eq!(produced.len(), 2);
    assert_eq!(produced[0].id, "t1");
    assert!(source.transform_log().contains("t1"));

    // Pushing the same transform again is a no-op.
    let transform = Transform::new(vec![add_planet()]).with_id("t1");
    let again = source
        .push(TransformOrOperations::from(transform))
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_patch_uses_known_remote_id_in_url() {
    let (source, transport) = source_with_transport();
    source.key_map().push_key("planet", "p1", "remoteId", "12345");

    transport.enqueue_response(JsonApiResponse::no_content());
    source
        .update(RecordOperation::ReplaceAttribute {
            record: RecordIdentity::new("planet", "p1"),
            attribute: "name".to_string(),
            value: Some(json!("Zeus")),
        })
        .await
        .unwrap();

    let sent = transport.sent();
    assert_eq!(sent[0].method, HttpMethod::Patch);
    assert_eq!(sent[0].url, "http://api.test/planet/12345");
}
