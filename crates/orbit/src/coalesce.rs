//! Operation coalescing: semantics-preserving reduction of an operation
//! sequence by collapsing redundant or annihilating pairs.
//!
//! Used by `merge` to fold a fork's history into a single reduced transform.
//! The fold is stable: relative order of operations that are not collapsed is
//! preserved.

use orbit_api::{RecordIdentity, RecordOperation};

/// Fold the sequence left to right, collapsing:
///
/// - successive `replaceAttribute` (same record + attribute): last wins
/// - successive `replaceKey` (same record + key): last wins
/// - successive `replaceRelatedRecord` (same record + relationship): last wins
/// - `addRecord` followed by `updateRecord`: merged into one `addRecord`
/// - `addRecord` followed by `removeRecord`: both annihilate (other ops on
///   the doomed record in between drop with them)
/// - `addToRelatedRecords` followed by its matching
///   `removeFromRelatedRecords`: both annihilate
/// - `replaceRelatedRecords` supersedes prior add/remove/replace for the
///   same record + relationship
pub fn coalesce_operations(operations: Vec<RecordOperation>) -> Vec<RecordOperation> {
    let mut slots: Vec<Option<RecordOperation>> = Vec::with_capacity(operations.len());

    for op in operations {
        match &op {
            RecordOperation::UpdateRecord { record } => {
                // Fold into an earlier addRecord/updateRecord of the same record.
                let identity = record.identity.clone();
                let mut folded = false;
                for slot in slots.iter_mut().rev() {
                    match slot {
                        Some(RecordOperation::AddRecord { record: earlier })
                        | Some(RecordOperation::UpdateRecord { record: earlier })
                            if earlier.identity == identity =>
                        {
                            earlier.merge(record);
                            folded = true;
                            break;
                        }
                        Some(other) if other.record_identity() == identity => break,
                        _ => {}
                    }
                }
                if !folded {
                    slots.push(Some(op));
                }
            }
            RecordOperation::RemoveRecord { record } => {
                let removed_add = cancel_record_ops(&mut slots, record);
                if !removed_add {
                    slots.push(Some(op));
                }
            }
            RecordOperation::ReplaceAttribute {
                record, attribute, ..
            } => {
                supersede(&mut slots, |earlier| {
                    matches!(
                        earlier,
                        RecordOperation::ReplaceAttribute {
                            record: r,
                            attribute: a,
                            ..
                        } if r == record && a == attribute
                    )
                });
                slots.push(Some(op));
            }
            RecordOperation::ReplaceKey { record, key, .. } => {
                supersede(&mut slots, |earlier| {
                    matches!(
                        earlier,
                        RecordOperation::ReplaceKey { record: r, key: k, .. }
                            if r == record && k == key
                    )
                });
                slots.push(Some(op));
            }
            RecordOperation::RemoveFromRelatedRecords {
                record,
                relationship,
                related_record,
            } => {
                // Annihilate with a matching earlier add.
                let mut annihilated = false;
                for slot in slots.iter_mut().rev() {
                    match slot {
                        Some(RecordOperation::AddToRelatedRecords {
                            record: r,
                            relationship: rel,
                            related_record: related,
                        }) if r == record
                            && rel == relationship
                            && related == related_record =>
                        {
                            *slot = None;
                            annihilated = true;
                            break;
                        }
                        Some(RecordOperation::ReplaceRelatedRecords {
                            record: r,
                            relationship: rel,
                            ..
                        }) if r == record && rel == relationship => break,
                        _ => {}
                    }
                }
                if !annihilated {
                    slots.push(Some(op));
                }
            }
            RecordOperation::ReplaceRelatedRecords {
                record,
                relationship,
                ..
            } => {
                supersede(&mut slots, |earlier| match earlier {
                    RecordOperation::AddToRelatedRecords {
                        record: r,
                        relationship: rel,
                        ..
                    }
                    | RecordOperation::RemoveFromRelatedRecords {
                        record: r,
                        relationship: rel,
                        ..
                    }
                    | RecordOperation::ReplaceRelatedRecords {
                        record: r,
                        relationship: rel,
                        ..
                    } => r == record && rel == relationship,
                    _ => false,
                });
                slots.push(Some(op));
            }
            RecordOperation::ReplaceRelatedRecord {
                record,
                relationship,
                ..
            } => {
                supersede(&mut slots, |earlier| {
                    matches!(
                        earlier,
                        RecordOperation::ReplaceRelatedRecord {
                            record: r,
                            relationship: rel,
                            ..
                        } if r == record && rel == relationship
                    )
                });
                slots.push(Some(op));
            }
            RecordOperation::AddRecord { .. } | RecordOperation::AddToRelatedRecords { .. } => {
                slots.push(Some(op));
            }
        }
    }

    slots.into_iter().flatten().collect()
}

/// Drop earlier operations matched by the predicate.
fn supersede<F>(slots: &mut [Option<RecordOperation>], matches: F)
where
    F: Fn(&RecordOperation) -> bool,
{
    for slot in slots.iter_mut() {
        if slot.as_ref().is_some_and(&matches) {
            *slot = None;
        }
    }
}

/// Drop every earlier operation targeting the removed record. Returns true
/// when one of them was the `addRecord` that created it, in which case the
/// removal itself annihilates too.
fn cancel_record_ops(
    slots: &mut [Option<RecordOperation>],
    identity: &RecordIdentity,
) -> bool {
    let mut saw_add = false;
    for slot in slots.iter_mut() {
        let Some(earlier) = slot else { continue };
        if earlier.record_identity() == *identity {
            if matches!(earlier, RecordOperation::AddRecord { .. }) {
                saw_add = true;
            }
            *slot = None;
        }
    }
    saw_add
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_api::Record;
    use serde_json::json;

    fn jupiter_id() -> RecordIdentity {
        RecordIdentity::new("planet", "jupiter")
    }

    #[test]
    fn test_add_then_remove_annihilates() {
        let ops = vec![
            RecordOperation::AddRecord {
                record: Record::new("planet", "jupiter"),
            },
            RecordOperation::RemoveRecord {
                record: jupiter_id(),
            },
        ];
        assert!(coalesce_operations(ops).is_empty());
    }

    #[test]
    fn test_add_related_then_remove_related_annihilates() {
        let io = RecordIdentity::new("moon", "io");
        let ops = vec![
            RecordOperation::AddToRelatedRecords {
                record: jupiter_id(),
                relationship: "moons".to_string(),
                related_record: io.clone(),
            },
            RecordOperation::RemoveFromRelatedRecords {
                record: jupiter_id(),
                relationship: "moons".to_string(),
                related_record: io,
            },
        ];
        assert!(coalesce_operations(ops).is_empty());
    }

    #[test]
    fn test_successive_replace_attribute_keeps_last() {
        let ops = vec![
            RecordOperation::ReplaceAttribute {
                record: jupiter_id(),
                attribute: "name".to_string(),
                value: Some(json!("v1")),
            },
            RecordOperation::ReplaceAttribute {
                record: jupiter_id(),
                attribute: "name".to_string(),
                value: Some(json!("v2")),
            },
        ];
        let reduced = coalesce_operations(ops);
        assert_eq!(
            reduced,
            vec![RecordOperation::ReplaceAttribute {
                record: jupiter_id(),
                attribute: "name".to_string(),
                value: Some(json!("v2")),
            }]
        );
    }

    #[test]
    fn test_add_then_update_merges_into_add() {
        let ops = vec![
            RecordOperation::AddRecord {
                record: Record::new("planet", "jupiter").with_attribute("name", "Jupiter"),
            },
            RecordOperation::UpdateRecord {
                record: Record::new("planet", "jupiter")
                    .with_attribute("classification", "gas giant"),
            },
        ];
        let reduced = coalesce_operations(ops);
        assert_eq!(reduced.len(), 1);
        match &reduced[0] {
            RecordOperation::AddRecord { record } => {
                assert_eq!(record.attribute("name"), Some(&json!("Jupiter")));
                assert_eq!(record.attribute("classification"), Some(&json!("gas giant")));
            }
            other => panic!("expected addRecord, got {other:?}"),
        }
    }

    #[test]
    fn test_replace_related_records_supersedes_edits() {
        let io = RecordIdentity::new("moon", "io");
        let europa = RecordIdentity::new("moon", "europa");
        let ops = vec![
            RecordOperation::AddToRelatedRecords {
                record: jupiter_id(),
                relationship: "moons".to_string(),
                related_record: io,
            },
            RecordOperation::ReplaceRelatedRecords {
                record: jupiter_id(),
                relationship: "moons".to_string(),
                related_records: vec![europa.clone()],
            },
        ];
        let reduced = coalesce_operations(ops);
        assert_eq!(
            reduced,
            vec![RecordOperation::ReplaceRelatedRecords {
                record: jupiter_id(),
                relationship: "moons".to_string(),
                related_records: vec![europa],
            }]
        );
    }

    #[test]
    fn test_unrelated_operations_keep_relative_order() {
        let ops = vec![
            RecordOperation::AddRecord {
                record: Record::new("planet", "saturn"),
            },
            RecordOperation::ReplaceAttribute {
                record: jupiter_id(),
                attribute: "name".to_string(),
                value: Some(json!("v1")),
            },
            RecordOperation::AddRecord {
                record: Record::new("moon", "titan"),
            },
            RecordOperation::ReplaceAttribute {
                record: jupiter_id(),
                attribute: "name".to_string(),
                value: Some(json!("v2")),
            },
        ];
        let reduced = coalesce_operations(ops);
        let names: Vec<&str> = reduced.iter().map(|op| op.name()).collect();
        assert_eq!(names, vec!["addRecord", "addRecord", "replaceAttribute"]);
    }
}
