//! Record-mutating operations.
//!
//! Every mutation flowing through the framework is one of these tagged
//! variants. Caches apply them; for each applied operation the cache produces
//! an inverse operation, which is the substrate for rollback and rebase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{Record, RecordIdentity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RecordOperation {
    /// Set `(type, id)` to the given record and register its declared
    /// inverse relationships.
    AddRecord { record: Record },
    /// Deep-merge the given record over the current one.
    UpdateRecord { record: Record },
    /// Delete `(type, id)` and strip every inverse edge referring to it.
    RemoveRecord { record: RecordIdentity },
    /// Set `keys[key]`; `None` removes the key.
    ReplaceKey {
        record: RecordIdentity,
        key: String,
        value: Option<String>,
    },
    /// Set `attributes[attribute]`; `None` removes the attribute. `Null` is a
    /// value ("set to null"), not a removal.
    ReplaceAttribute {
        record: RecordIdentity,
        attribute: String,
        value: Option<Value>,
    },
    /// Append to a to-many relationship if not already present.
    AddToRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_record: RecordIdentity,
    },
    /// Remove from a to-many relationship by identity equality.
    RemoveFromRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_record: RecordIdentity,
    },
    /// Replace a to-many relationship wholesale.
    ReplaceRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        related_records: Vec<RecordIdentity>,
    },
    /// Replace a to-one relationship; `None` means "known empty".
    ReplaceRelatedRecord {
        record: RecordIdentity,
        relationship: String,
        related_record: Option<RecordIdentity>,
    },
}

impl RecordOperation {
    /// Identity of the primary record this operation targets.
    pub fn record_identity(&self) -> RecordIdentity {
        match self {
            RecordOperation::AddRecord { record } | RecordOperation::UpdateRecord { record } => {
                record.identity.clone()
            }
            RecordOperation::RemoveRecord { record }
            | RecordOperation::ReplaceKey { record, .. }
            | RecordOperation::ReplaceAttribute { record, .. }
            | RecordOperation::AddToRelatedRecords { record, .. }
            | RecordOperation::RemoveFromRelatedRecords { record, .. }
            | RecordOperation::ReplaceRelatedRecords { record, .. }
            | RecordOperation::ReplaceRelatedRecord { record, .. } => record.clone(),
        }
    }

    /// Short tag for logging and coalescing diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RecordOperation::AddRecord { .. } => "addRecord",
            RecordOperation::UpdateRecord { .. } => "updateRecord",
            RecordOperation::RemoveRecord { .. } => "removeRecord",
            RecordOperation::ReplaceKey { .. } => "replaceKey",
            RecordOperation::ReplaceAttribute { .. } => "replaceAttribute",
            RecordOperation::AddToRelatedRecords { .. } => "addToRelatedRecords",
            RecordOperation::RemoveFromRelatedRecords { .. } => "removeFromRelatedRecords",
            RecordOperation::ReplaceRelatedRecords { .. } => "replaceRelatedRecords",
            RecordOperation::ReplaceRelatedRecord { .. } => "replaceRelatedRecord",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_identity_of_each_variant() {
        let id = RecordIdentity::new("planet", "jupiter");
        let ops = vec![
            RecordOperation::AddRecord {
                record: Record::from_identity(id.clone()),
            },
            RecordOperation::RemoveRecord { record: id.clone() },
            RecordOperation::ReplaceAttribute {
                record: id.clone(),
                attribute: "name".to_string(),
                value: Some(serde_json::json!("Jupiter")),
            },
        ];
        for op in ops {
            assert_eq!(op.record_identity(), id);
        }
    }

    #[test]
    fn test_serde_tagging() {
        let op = RecordOperation::ReplaceRelatedRecord {
            record: RecordIdentity::new("moon", "io"),
            relationship: "planet".to_string(),
            related_record: None,
        };
        let text = serde_json::to_string(&op).unwrap();
        assert!(text.contains("\"op\":\"replaceRelatedRecord\""));
        let parsed: RecordOperation = serde_json::from_str(&text).unwrap();
        assert_eq!(op, parsed);
    }
}
