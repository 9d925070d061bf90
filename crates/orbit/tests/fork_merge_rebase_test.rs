//! Fork / merge / rebase scenarios on the in-memory source.

use orbit::{MemorySource, MergeOptions, Source, Updatable};
use orbit_api::{
    solar_system_schema, Record, RecordIdentity, RecordOperation, RelationshipData,
};
use serde_json::json;

fn source() -> MemorySource {
    MemorySource::new("store", solar_system_schema())
}

fn add(record: Record) -> RecordOperation {
    RecordOperation::AddRecord { record }
}

fn jupiter() -> Record {
    Record::new("planet", "jupiter").with_attribute("name", "Jupiter")
}

fn moon(id: &str) -> Record {
    Record::new("moon", id).with_relationship(
        "planet",
        RelationshipData::One(Some(RecordIdentity::new("planet", "jupiter"))),
    )
}

#[tokio::test]
async fn test_fork_isolation() {
    // Mutations on a fork never alter the parent's cache or log.
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    fork.update(add(Record::new("planet", "saturn")))
        .await
        .unwrap();
    fork.update(RecordOperation::ReplaceAttribute {
        record: RecordIdentity::new("planet", "jupiter"),
        attribute: "name".to_string(),
        value: Some(json!("Zeus")),
    })
    .await
    .unwrap();

    assert_eq!(parent.cache().records_sync("planet").len(), 1);
    assert_eq!(
        parent
            .cache()
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap()
            .attribute("name"),
        Some(&json!("Jupiter"))
    );
    assert_eq!(parent.transform_log().len(), 1);

    assert_eq!(fork.cache().records_sync("planet").len(), 2);
    assert_eq!(fork.transform_log().len(), 2);
}

#[tokio::test]
async fn test_fork_reads_parent_state_at_fork_point() {
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    assert_eq!(fork.fork_point(), parent.transform_log().head());
    assert!(fork
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
        .is_some());

    // Later parent changes are not visible to the fork.
    parent
        .update(add(Record::new("planet", "saturn")))
        .await
        .unwrap();
    assert!(fork
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "saturn"))
        .is_none());
}

#[tokio::test]
async fn test_merge_applies_forked_changes_as_one_transform() {
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    fork.update(add(Record::new("planet", "saturn").with_attribute("name", "Saturn")))
        .await
        .unwrap();
    fork.update(RecordOperation::UpdateRecord {
        record: Record::new("planet", "saturn").with_attribute("classification", "gas giant"),
    })
    .await
    .unwrap();

    let log_before = parent.transform_log().len();
    parent.merge(&fork, MergeOptions::default()).await.unwrap();

    // Coalescing folds add + update into one reduced transform.
    assert_eq!(parent.transform_log().len(), log_before + 1);
    let saturn = parent
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "saturn"))
        .cloned()
        .unwrap();
    assert_eq!(saturn.attribute("name"), Some(&json!("Saturn")));
    assert_eq!(saturn.attribute("classification"), Some(&json!("gas giant")));
}

#[tokio::test]
async fn test_merge_annihilated_changes_produce_empty_transform() {
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    fork.update(add(Record::new("planet", "saturn")))
        .await
        .unwrap();
    fork.update(RecordOperation::RemoveRecord {
        record: RecordIdentity::new("planet", "saturn"),
    })
    .await
    .unwrap();

    let log_before = parent.transform_log().len();
    parent.merge(&fork, MergeOptions::default()).await.unwrap();

    // Nothing survives coalescing; the no-op transform is not logged.
    assert_eq!(parent.transform_log().len(), log_before);
    assert!(parent
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "saturn"))
        .is_none());
}

#[tokio::test]
async fn test_rebase_replays_parent_delta_under_local_changes() {
    // The fork removes io while the parent adds europa; after rebase the
    // fork sees europa only.
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();
    parent.update(add(moon("io"))).await.unwrap();

    let fork = parent.fork();
    fork.update(RecordOperation::RemoveRecord {
        record: RecordIdentity::new("moon", "io"),
    })
    .await
    .unwrap();

    parent.update(add(moon("europa"))).await.unwrap();

    fork.rebase().await.unwrap();

    let cache = fork.cache();
    let record = cache
        .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
        .unwrap();
    assert_eq!(
        record.relationship("moons").unwrap().as_many().unwrap(),
        &[RecordIdentity::new("moon", "europa")]
    );
    assert!(cache
        .get_record_sync(&RecordIdentity::new("moon", "io"))
        .is_none());
    drop(cache);

    // The fork point advanced to the parent's head.
    assert_eq!(fork.fork_point(), parent.transform_log().head());
}

#[tokio::test]
async fn test_rebase_with_no_parent_delta_is_a_noop() {
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    fork.update(add(Record::new("planet", "saturn")))
        .await
        .unwrap();
    let log_before = fork.transform_log().entries();

    fork.rebase().await.unwrap();
    assert_eq!(fork.transform_log().entries(), log_before);
}

#[tokio::test]
async fn test_rebase_equivalence_with_replay() {
    // After rebase, the fork's cache equals replaying the parent's
    // delta plus the fork's local transforms over the fork-point snapshot.
    let parent = source();
    parent.update(add(jupiter())).await.unwrap();

    let fork = parent.fork();
    fork.update(RecordOperation::ReplaceAttribute {
        record: RecordIdentity::new("planet", "jupiter"),
        attribute: "classification".to_string(),
        value: Some(json!("gas giant")),
    })
    .await
    .unwrap();
    let local = fork.all_transforms();

    parent.update(add(moon("io"))).await.unwrap();
    let base_delta = parent
        .transforms_since(&fork.fork_point().unwrap())
        .unwrap();

    // Independent replay over a fresh source seeded like the fork point.
    let replayed = source();
    replayed.update(add(jupiter())).await.unwrap();
    for transform in base_delta.into_iter().chain(local) {
        replayed
            .update(orbit_api::TransformOrOperations::from(transform))
            .await
            .unwrap();
    }

    fork.rebase().await.unwrap();
    assert_eq!(fork.cache().flattened(), replayed.cache().flattened());
}

#[tokio::test]
async fn test_rebase_on_a_non_fork_is_an_assertion_error() {
    let standalone = source();
    let result = standalone.rebase().await;
    assert!(matches!(result, Err(orbit_api::OrbitError::Assertion(_))));
}

#[tokio::test]
async fn test_merge_since_transform_id() {
    let parent = source();
    let fork = parent.fork();

    fork.update(orbit_api::TransformOrOperations::from(
        orbit_api::Transform::new(vec![add(jupiter())]).with_id("f1"),
    ))
    .await
    .unwrap();
    fork.update(orbit_api::TransformOrOperations::from(
        orbit_api::Transform::new(vec![add(Record::new("planet", "saturn"))]).with_id("f2"),
    ))
    .await
    .unwrap();

    parent
        .merge(
            &fork,
            MergeOptions {
                since_transform_id: Some("f1".to_string()),
                ..MergeOptions::default()
            },
        )
        .await
        .unwrap();

    // Only f2's operations merged.
    assert!(parent
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
        .is_none());
    assert!(parent
        .cache()
        .get_record_sync(&RecordIdentity::new("planet", "saturn"))
        .is_some());
}
