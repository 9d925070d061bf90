//! Transforms: immutable, identified bundles of record operations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::operation::RecordOperation;
use crate::record::{Record, RecordIdentity, RelationshipData};

/// Options attached to a request (transform or query).
///
/// The id and operations of a transform are immutable once built; options are
/// carried alongside and only influence how a request is processed, never
/// what it means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Return the whole response envelope instead of just `data`.
    #[serde(default)]
    pub full_response: bool,
    /// Collect per-source responses into `sources` on the envelope.
    #[serde(default)]
    pub include_sources: bool,
    /// Raise `RecordNotFound` for a missing `FindRecord` target. Defaults to
    /// true; queries that prefer `None` set this to false.
    #[serde(default = "default_true")]
    pub raise_not_found: bool,
    /// Cap on the number of remote requests one transform may fan out into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<usize>,
    /// Per-request network timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Free-form options consumed by specific sources.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            full_response: false,
            include_sources: false,
            raise_not_found: true,
            max_requests: None,
            timeout_ms: None,
            extra: HashMap::new(),
        }
    }
}

/// An immutable, identified bundle of record operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Caller-provided or generated; stable ids are what make replay and
    /// dedup safe.
    pub id: String,
    pub operations: Vec<RecordOperation>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl Transform {
    pub fn new(operations: Vec<RecordOperation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operations,
            options: RequestOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Inputs accepted by `update`/`push`: a finished transform, a bare
/// operation, or a list of operations.
#[derive(Debug, Clone)]
pub enum TransformOrOperations {
    Transform(Transform),
    Operation(RecordOperation),
    Operations(Vec<RecordOperation>),
}

impl TransformOrOperations {
    /// Build a transform, reusing the caller-supplied id when present so that
    /// dedup against the log works across retries.
    pub fn build(self, options: Option<RequestOptions>, id: Option<String>) -> Transform {
        let mut transform = match self {
            TransformOrOperations::Transform(transform) => transform,
            TransformOrOperations::Operation(op) => Transform::new(vec![op]),
            TransformOrOperations::Operations(ops) => Transform::new(ops),
        };
        if let Some(id) = id {
            transform.id = id;
        }
        if let Some(options) = options {
            transform.options = options;
        }
        transform
    }
}

impl From<Transform> for TransformOrOperations {
    fn from(transform: Transform) -> Self {
        TransformOrOperations::Transform(transform)
    }
}

impl From<RecordOperation> for TransformOrOperations {
    fn from(op: RecordOperation) -> Self {
        TransformOrOperations::Operation(op)
    }
}

impl From<Vec<RecordOperation>> for TransformOrOperations {
    fn from(ops: Vec<RecordOperation>) -> Self {
        TransformOrOperations::Operations(ops)
    }
}

/// Sugar for constructing operations; mirrors the query builder so call sites
/// read uniformly.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformBuilder;

impl TransformBuilder {
    pub fn add_record(&self, record: Record) -> RecordOperation {
        RecordOperation::AddRecord { record }
    }

    pub fn update_record(&self, record: Record) -> RecordOperation {
        RecordOperation::UpdateRecord { record }
    }

    pub fn remove_record(&self, record: RecordIdentity) -> RecordOperation {
        RecordOperation::RemoveRecord { record }
    }

    pub fn replace_key(
        &self,
        record: RecordIdentity,
        key: impl Into<String>,
        value: Option<String>,
    ) -> RecordOperation {
        RecordOperation::ReplaceKey {
            record,
            key: key.into(),
            value,
        }
    }

    pub fn replace_attribute(
        &self,
        record: RecordIdentity,
        attribute: impl Into<String>,
        value: Option<Value>,
    ) -> RecordOperation {
        RecordOperation::ReplaceAttribute {
            record,
            attribute: attribute.into(),
            value,
        }
    }

    pub fn add_to_related_records(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
        related_record: RecordIdentity,
    ) -> RecordOperation {
        RecordOperation::AddToRelatedRecords {
            record,
            relationship: relationship.into(),
            related_record,
        }
    }

    pub fn remove_from_related_records(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
        related_record: RecordIdentity,
    ) -> RecordOperation {
        RecordOperation::RemoveFromRelatedRecords {
            record,
            relationship: relationship.into(),
            related_record,
        }
    }

    pub fn replace_related_records(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
        related_records: Vec<RecordIdentity>,
    ) -> RecordOperation {
        RecordOperation::ReplaceRelatedRecords {
            record,
            relationship: relationship.into(),
            related_records,
        }
    }

    pub fn replace_related_record(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
        related_record: Option<RecordIdentity>,
    ) -> RecordOperation {
        RecordOperation::ReplaceRelatedRecord {
            record,
            relationship: relationship.into(),
            related_record,
        }
    }

    /// Convenience for seeding a to-many relationship inline.
    pub fn record_with_many(
        &self,
        mut record: Record,
        relationship: impl Into<String>,
        related: Vec<RecordIdentity>,
    ) -> Record {
        record.set_relationship(
            &relationship.into(),
            Some(RelationshipData::Many(related)),
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_reuses_caller_id() {
        let op = TransformBuilder.add_record(Record::new("planet", "jupiter"));
        let transform = TransformOrOperations::from(op).build(None, Some("t1".to_string()));
        assert_eq!(transform.id, "t1");
        assert_eq!(transform.operations.len(), 1);
    }

    #[test]
    fn test_build_generates_id_when_absent() {
        let op = TransformBuilder.add_record(Record::new("planet", "jupiter"));
        let a = TransformOrOperations::from(op.clone()).build(None, None);
        let b = TransformOrOperations::from(op).build(None, None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_existing_transform_passes_through() {
        let transform = Transform::new(vec![]).with_id("stable");
        let rebuilt = TransformOrOperations::from(transform.clone()).build(None, None);
        assert_eq!(rebuilt.id, "stable");
    }
}
