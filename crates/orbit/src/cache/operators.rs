//! Operator semantics: how each record operation mutates the cache and what
//! its inverse is.
//!
//! Relationship edits cascade to the declared inverse side: adding a moon
//! with `planet -> jupiter` also writes `jupiter.moons`, records the edge in
//! the inverse-relationship index, and emits inverse operations for every
//! sub-step so that replaying the inverses restores the exact prior state,
//! including "unknown" (absent) relationship data.
//!
//! Edits addressed at records that do not exist create a shell `{type, id}`
//! record uniformly; the recorded inverse is `RemoveRecord`, so a round-trip
//! restores "absent".

use orbit_api::{
    OrbitError, Record, RecordIdentity, RecordOperation, RelationshipData, RelationshipDef,
    RelationshipKind, Result,
};

use super::{InverseRelationship, RecordCache};

pub(crate) struct AppliedOp {
    pub changed: bool,
    /// Post-image of the primary record (`None` after a removal).
    pub data: Option<Record>,
    /// Inverse operations for this operation's sub-steps, in forward order.
    /// The patch loop reverses the accumulated sequence globally.
    pub inverse: Vec<RecordOperation>,
}

impl AppliedOp {
    fn unchanged(data: Option<Record>) -> Self {
        Self {
            changed: false,
            data,
            inverse: Vec::new(),
        }
    }
}

pub(crate) fn apply_operation(cache: &mut RecordCache, op: &RecordOperation) -> Result<AppliedOp> {
    match op {
        RecordOperation::AddRecord { record } => set_record(cache, record.clone()),
        RecordOperation::UpdateRecord { record } => update_record(cache, record),
        RecordOperation::RemoveRecord { record } => remove_record(cache, record),
        RecordOperation::ReplaceKey { record, key, value } => {
            replace_key(cache, record, key, value.clone())
        }
        RecordOperation::ReplaceAttribute {
            record,
            attribute,
            value,
        } => replace_attribute(cache, record, attribute, value.clone()),
        RecordOperation::AddToRelatedRecords {
            record,
            relationship,
            related_record,
        } => add_to_related(cache, record, relationship, related_record),
        RecordOperation::RemoveFromRelatedRecords {
            record,
            relationship,
            related_record,
        } => remove_from_related(cache, record, relationship, related_record),
        RecordOperation::ReplaceRelatedRecords {
            record,
            relationship,
            related_records,
        } => replace_related_records(cache, record, relationship, related_records),
        RecordOperation::ReplaceRelatedRecord {
            record,
            relationship,
            related_record,
        } => replace_related_record(cache, record, relationship, related_record.clone()),
    }
}

fn rel_def(cache: &RecordCache, kind: &str, relationship: &str) -> Result<RelationshipDef> {
    cache
        .schema()
        .relationship_def(kind, relationship)
        .map(Clone::clone)
}

/// Declared-inverse edges carried by a record's own relationship data:
/// `(relationship, target, inverse name on the target model)`.
fn declared_edges(
    cache: &RecordCache,
    record: &Record,
) -> Result<Vec<(String, RecordIdentity, String)>> {
    let mut edges = Vec::new();
    let Some(relationships) = &record.relationships else {
        return Ok(edges);
    };
    for (name, data) in relationships {
        let def = rel_def(cache, record.kind(), name)?;
        let Some(inverse) = def.inverse.clone() else {
            continue;
        };
        match (&def.kind, data) {
            (RelationshipKind::HasMany, RelationshipData::Many(targets)) => {
                for target in targets {
                    edges.push((name.clone(), target.clone(), inverse.clone()));
                }
            }
            (RelationshipKind::HasOne, RelationshipData::One(Some(target))) => {
                edges.push((name.clone(), target.clone(), inverse.clone()));
            }
            (RelationshipKind::HasOne, RelationshipData::One(None)) => {}
            (kind, _) => {
                return Err(OrbitError::Schema(format!(
                    "relationship '{}' on model '{}' is declared {:?} but carries mismatched data",
                    name,
                    record.kind(),
                    kind
                )))
            }
        }
    }
    Ok(edges)
}

/// Make `b.inverse_rel` include (or point at) `a`. Returns the inverse
/// operations for whatever actually changed, in forward order.
fn cascade_link(
    cache: &mut RecordCache,
    a: &RecordIdentity,
    b: &RecordIdentity,
    inverse_rel: &str,
) -> Result<Vec<RecordOperation>> {
    let def = rel_def(cache, &b.kind, inverse_rel)?;
    let entry = InverseRelationship {
        record: b.clone(),
        relationship: inverse_rel.to_string(),
        related_record: a.clone(),
    };

    let Some(pre) = cache.current_record(b) else {
        // Materialize a shell that carries the back-edge.
        let mut shell = Record::from_identity(b.clone());
        let data = match def.kind {
            RelationshipKind::HasMany => RelationshipData::Many(vec![a.clone()]),
            RelationshipKind::HasOne => RelationshipData::One(Some(a.clone())),
        };
        shell.set_relationship(inverse_rel, Some(data));
        cache.write_record(shell);
        cache.add_inverse_entry(entry);
        return Ok(vec![RecordOperation::RemoveRecord { record: b.clone() }]);
    };

    let data = pre.relationship(inverse_rel).cloned();
    let mut inverses = Vec::new();
    match def.kind {
        RelationshipKind::HasMany => match data {
            Some(RelationshipData::Many(mut targets)) => {
                if targets.contains(a) {
                    return Ok(inverses);
                }
                targets.push(a.clone());
                let mut updated = pre;
                updated.set_relationship(inverse_rel, Some(RelationshipData::Many(targets)));
                cache.write_record(updated);
                cache.add_inverse_entry(entry);
                inverses.push(RecordOperation::RemoveFromRelatedRecords {
                    record: b.clone(),
                    relationship: inverse_rel.to_string(),
                    related_record: a.clone(),
                });
            }
            Some(RelationshipData::One(_)) => {
                return Err(mismatch(&b.kind, inverse_rel));
            }
            None => {
                let mut updated = pre.clone();
                updated.set_relationship(
                    inverse_rel,
                    Some(RelationshipData::Many(vec![a.clone()])),
                );
                cache.write_record(updated);
                cache.add_inverse_entry(entry);
                inverses.push(RecordOperation::AddRecord { record: pre });
            }
        },
        RelationshipKind::HasOne => match data {
            Some(RelationshipData::One(Some(ref x))) if x == a => {}
            Some(RelationshipData::One(old)) => {
                // Repointing displaces the old target: its mirror list drops b.
                if let Some(x) = &old {
                    cache.remove_inverse_entry(b, inverse_rel, x);
                    if let Some(mirror) = &def.inverse {
                        inverses.extend(cascade_unlink(cache, b, x, mirror)?);
                    }
                }
                let mut updated = pre;
                updated.set_relationship(
                    inverse_rel,
                    Some(RelationshipData::One(Some(a.clone()))),
                );
                cache.write_record(updated);
                cache.add_inverse_entry(entry);
                inverses.push(RecordOperation::ReplaceRelatedRecord {
                    record: b.clone(),
                    relationship: inverse_rel.to_string(),
                    related_record: old,
                });
            }
            Some(RelationshipData::Many(_)) => {
                return Err(mismatch(&b.kind, inverse_rel));
            }
            None => {
                let mut updated = pre.clone();
                updated.set_relationship(
                    inverse_rel,
                    Some(RelationshipData::One(Some(a.clone()))),
                );
                cache.write_record(updated);
                cache.add_inverse_entry(entry);
                inverses.push(RecordOperation::AddRecord { record: pre });
            }
        },
    }
    Ok(inverses)
}

/// Remove `a` from `b.inverse_rel`. No-op when `b` is absent or the edge is
/// not present.
fn cascade_unlink(
    cache: &mut RecordCache,
    a: &RecordIdentity,
    b: &RecordIdentity,
    inverse_rel: &str,
) -> Result<Vec<RecordOperation>> {
    let def = rel_def(cache, &b.kind, inverse_rel)?;
    let Some(pre) = cache.current_record(b) else {
        return Ok(Vec::new());
    };
    let data = pre.relationship(inverse_rel).cloned();
    let mut inverses = Vec::new();
    match (def.kind, data) {
        (RelationshipKind::HasMany, Some(RelationshipData::Many(targets))) => {
            if !targets.contains(a) {
                return Ok(inverses);
            }
            let filtered: Vec<RecordIdentity> =
                targets.into_iter().filter(|t| t != a).collect();
            let mut updated = pre;
            updated.set_relationship(inverse_rel, Some(RelationshipData::Many(filtered)));
            cache.write_record(updated);
            cache.remove_inverse_entry(b, inverse_rel, a);
            inverses.push(RecordOperation::AddToRelatedRecords {
                record: b.clone(),
                relationship: inverse_rel.to_string(),
                related_record: a.clone(),
            });
        }
        (RelationshipKind::HasOne, Some(RelationshipData::One(Some(ref x)))) if x == a => {
            let mut updated = pre;
            updated.set_relationship(inverse_rel, Some(RelationshipData::One(None)));
            cache.write_record(updated);
            cache.remove_inverse_entry(b, inverse_rel, a);
            inverses.push(RecordOperation::ReplaceRelatedRecord {
                record: b.clone(),
                relationship: inverse_rel.to_string(),
                related_record: Some(a.clone()),
            });
        }
        _ => {}
    }
    Ok(inverses)
}

/// Wholesale set of a record, diffing declared-inverse edges against the
/// prior image. Backs `addRecord` and the `updateRecord`-on-absent path.
fn set_record(cache: &mut RecordCache, mut record: Record) -> Result<AppliedOp> {
    cache.validate_model(record.kind())?;
    record.normalize();
    let identity = record.identity.clone();
    let pre = cache.current_record(&identity);
    if pre.as_ref() == Some(&record) {
        return Ok(AppliedOp::unchanged(Some(record)));
    }

    let new_edges = declared_edges(cache, &record)?;
    let pre_edges = match &pre {
        Some(pre) => declared_edges(cache, pre)?,
        None => Vec::new(),
    };

    let mut inverse = vec![match &pre {
        Some(pre) => RecordOperation::AddRecord { record: pre.clone() },
        None => RecordOperation::RemoveRecord {
            record: identity.clone(),
        },
    }];

    cache.write_record(record.clone());

    for (rel, target, inv) in &pre_edges {
        if !new_edges
            .iter()
            .any(|(r, t, _)| r == rel && t == target)
        {
            cache.remove_inverse_entry(&identity, rel, target);
            inverse.extend(cascade_unlink(cache, &identity, target, inv)?);
        }
    }
    for (rel, target, inv) in &new_edges {
        if !pre_edges
            .iter()
            .any(|(r, t, _)| r == rel && t == target)
        {
            cache.add_inverse_entry(InverseRelationship {
                record: identity.clone(),
                relationship: rel.clone(),
                related_record: target.clone(),
            });
            inverse.extend(cascade_link(cache, &identity, target, inv)?);
        }
    }

    Ok(AppliedOp {
        changed: true,
        data: Some(record),
        inverse,
    })
}

fn update_record(cache: &mut RecordCache, update: &Record) -> Result<AppliedOp> {
    cache.validate_model(update.kind())?;
    let identity = update.identity.clone();
    let Some(pre) = cache.current_record(&identity) else {
        return set_record(cache, update.clone());
    };

    let mut merged = pre.clone();
    merged.merge(update);
    merged.normalize();
    if merged == pre {
        return Ok(AppliedOp::unchanged(Some(pre)));
    }

    // Pre-image limited to the touched members; wholesale restore when a
    // touched member was previously absent (a merge cannot express removal).
    let mut exact = true;
    let mut pre_image = Record::from_identity(identity.clone());
    if let Some(keys) = &update.keys {
        for name in keys.keys() {
            match pre.key(name) {
                Some(old) => pre_image.set_key(name, Some(old.to_string())),
                None => exact = false,
            }
        }
    }
    if let Some(attrs) = &update.attributes {
        for name in attrs.keys() {
            match pre.attribute(name) {
                Some(old) => pre_image.set_attribute(name, Some(old.clone())),
                None => exact = false,
            }
        }
    }
    if let Some(rels) = &update.relationships {
        for name in rels.keys() {
            match pre.relationship(name) {
                Some(old) => pre_image.set_relationship(name, Some(old.clone())),
                None => exact = false,
            }
        }
    }
    let mut inverse = vec![if exact {
        RecordOperation::UpdateRecord { record: pre_image }
    } else {
        RecordOperation::AddRecord { record: pre.clone() }
    }];

    cache.write_record(merged.clone());

    // Relationships mentioned in the update are replaced wholesale: diff the
    // old and new edges of exactly those relationships.
    if let Some(rels) = &update.relationships {
        for (name, new_data) in rels {
            let def = rel_def(cache, identity.kind.as_str(), name)?;
            let Some(inv) = def.inverse.clone() else {
                continue;
            };
            let old_targets = edge_targets(pre.relationship(name));
            let new_targets = edge_targets(Some(new_data));
            for target in &old_targets {
                if !new_targets.contains(target) {
                    cache.remove_inverse_entry(&identity, name, target);
                    inverse.extend(cascade_unlink(cache, &identity, target, &inv)?);
                }
            }
            for target in &new_targets {
                if !old_targets.contains(target) {
                    cache.add_inverse_entry(InverseRelationship {
                        record: identity.clone(),
                        relationship: name.clone(),
                        related_record: target.clone(),
                    });
                    inverse.extend(cascade_link(cache, &identity, target, &inv)?);
                }
            }
        }
    }

    Ok(AppliedOp {
        changed: true,
        data: Some(merged),
        inverse,
    })
}

fn edge_targets(data: Option<&RelationshipData>) -> Vec<RecordIdentity> {
    match data {
        Some(RelationshipData::Many(targets)) => targets.clone(),
        Some(RelationshipData::One(Some(target))) => vec![target.clone()],
        _ => Vec::new(),
    }
}

fn remove_record(cache: &mut RecordCache, identity: &RecordIdentity) -> Result<AppliedOp> {
    cache.validate_model(&identity.kind)?;
    let Some(pre) = cache.current_record(identity) else {
        return Ok(AppliedOp::unchanged(None));
    };

    let mut inverse = vec![RecordOperation::AddRecord { record: pre.clone() }];

    // Drop the record's own edges first; re-adding the pre-image replays the
    // cascades, so the wholesale inverse above is sufficient for them.
    for (rel, target, inv) in declared_edges(cache, &pre)? {
        cache.remove_inverse_entry(identity, &rel, &target);
        inverse.extend(cascade_unlink(cache, identity, &target, &inv)?);
    }

    // Then strip every remaining edge pointing at the removed record.
    for entry in cache.take_inverse_entries(identity) {
        inverse.extend(cascade_unlink(
            cache,
            identity,
            &entry.record,
            &entry.relationship,
        )?);
    }

    cache.erase_record(identity);
    Ok(AppliedOp {
        changed: true,
        data: None,
        inverse,
    })
}

fn replace_key(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    key: &str,
    value: Option<String>,
) -> Result<AppliedOp> {
    cache.validate_model(&identity.kind)?;
    let Some(pre) = cache.current_record(identity) else {
        let mut shell = Record::from_identity(identity.clone());
        shell.set_key(key, value);
        cache.write_record(shell.clone());
        return Ok(AppliedOp {
            changed: true,
            data: Some(shell),
            inverse: vec![RecordOperation::RemoveRecord {
                record: identity.clone(),
            }],
        });
    };

    let old = pre.key(key).map(str::to_string);
    if old == value {
        return Ok(AppliedOp::unchanged(Some(pre)));
    }
    let mut updated = pre;
    updated.set_key(key, value);
    updated.normalize();
    cache.write_record(updated.clone());
    Ok(AppliedOp {
        changed: true,
        data: Some(updated),
        inverse: vec![RecordOperation::ReplaceKey {
            record: identity.clone(),
            key: key.to_string(),
            value: old,
        }],
    })
}

fn replace_attribute(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    attribute: &str,
    value: Option<serde_json::Value>,
) -> Result<AppliedOp> {
    cache.validate_model(&identity.kind)?;
    let Some(pre) = cache.current_record(identity) else {
        let mut shell = Record::from_identity(identity.clone());
        shell.set_attribute(attribute, value);
        shell.normalize();
        cache.write_record(shell.clone());
        return Ok(AppliedOp {
            changed: true,
            data: Some(shell),
            inverse: vec![RecordOperation::RemoveRecord {
                record: identity.clone(),
            }],
        });
    };

    let old = pre.attribute(attribute).cloned();
    if old == value {
        return Ok(AppliedOp::unchanged(Some(pre)));
    }
    let mut updated = pre;
    updated.set_attribute(attribute, value);
    updated.normalize();
    cache.write_record(updated.clone());
    Ok(AppliedOp {
        changed: true,
        data: Some(updated),
        inverse: vec![RecordOperation::ReplaceAttribute {
            record: identity.clone(),
            attribute: attribute.to_string(),
            value: old,
        }],
    })
}

fn expect_many(def: &RelationshipDef, kind: &str, relationship: &str) -> Result<()> {
    if def.kind == RelationshipKind::HasMany {
        Ok(())
    } else {
        Err(mismatch(kind, relationship))
    }
}

fn mismatch(kind: &str, relationship: &str) -> OrbitError {
    OrbitError::Schema(format!(
        "relationship '{relationship}' on model '{kind}' used with the wrong cardinality"
    ))
}

fn add_to_related(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    relationship: &str,
    related: &RecordIdentity,
) -> Result<AppliedOp> {
    let def = rel_def(cache, &identity.kind, relationship)?;
    expect_many(&def, &identity.kind, relationship)?;

    let link_edge = |cache: &mut RecordCache, inverse: &mut Vec<RecordOperation>| -> Result<()> {
        if let Some(inv) = &def.inverse {
            cache.add_inverse_entry(InverseRelationship {
                record: identity.clone(),
                relationship: relationship.to_string(),
                related_record: related.clone(),
            });
            inverse.extend(cascade_link(cache, identity, related, inv)?);
        }
        Ok(())
    };

    let Some(pre) = cache.current_record(identity) else {
        let mut shell = Record::from_identity(identity.clone());
        shell.set_relationship(
            relationship,
            Some(RelationshipData::Many(vec![related.clone()])),
        );
        cache.write_record(shell.clone());
        let mut inverse = vec![RecordOperation::RemoveRecord {
            record: identity.clone(),
        }];
        link_edge(cache, &mut inverse)?;
        return Ok(AppliedOp {
            changed: true,
            data: Some(shell),
            inverse,
        });
    };

    match pre.relationship(relationship).cloned() {
        Some(RelationshipData::Many(targets)) if targets.contains(related) => {
            Ok(AppliedOp::unchanged(Some(pre)))
        }
        Some(RelationshipData::Many(mut targets)) => {
            targets.push(related.clone());
            let mut updated = pre;
            updated.set_relationship(relationship, Some(RelationshipData::Many(targets)));
            cache.write_record(updated.clone());
            let mut inverse = vec![RecordOperation::RemoveFromRelatedRecords {
                record: identity.clone(),
                relationship: relationship.to_string(),
                related_record: related.clone(),
            }];
            link_edge(cache, &mut inverse)?;
            Ok(AppliedOp {
                changed: true,
                data: Some(updated),
                inverse,
            })
        }
        Some(RelationshipData::One(_)) => Err(mismatch(&identity.kind, relationship)),
        None => {
            let mut updated = pre.clone();
            updated.set_relationship(
                relationship,
                Some(RelationshipData::Many(vec![related.clone()])),
            );
            cache.write_record(updated.clone());
            let mut inverse = vec![RecordOperation::AddRecord { record: pre }];
            link_edge(cache, &mut inverse)?;
            Ok(AppliedOp {
                changed: true,
                data: Some(updated),
                inverse,
            })
        }
    }
}

fn remove_from_related(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    relationship: &str,
    related: &RecordIdentity,
) -> Result<AppliedOp> {
    let def = rel_def(cache, &identity.kind, relationship)?;
    expect_many(&def, &identity.kind, relationship)?;

    let Some(pre) = cache.current_record(identity) else {
        // Absent target: materialize a shell with a known-empty set.
        let mut shell = Record::from_identity(identity.clone());
        shell.set_relationship(relationship, Some(RelationshipData::Many(vec![])));
        cache.write_record(shell.clone());
        return Ok(AppliedOp {
            changed: true,
            data: Some(shell),
            inverse: vec![RecordOperation::RemoveRecord {
                record: identity.clone(),
            }],
        });
    };

    match pre.relationship(relationship).cloned() {
        Some(RelationshipData::Many(targets)) if targets.contains(related) => {
            let filtered: Vec<RecordIdentity> =
                targets.into_iter().filter(|t| t != related).collect();
            let mut updated = pre;
            updated.set_relationship(relationship, Some(RelationshipData::Many(filtered)));
            cache.write_record(updated.clone());
            let mut inverse = vec![RecordOperation::AddToRelatedRecords {
                record: identity.clone(),
                relationship: relationship.to_string(),
                related_record: related.clone(),
            }];
            if let Some(inv) = &def.inverse {
                cache.remove_inverse_entry(identity, relationship, related);
                inverse.extend(cascade_unlink(cache, identity, related, inv)?);
            }
            Ok(AppliedOp {
                changed: true,
                data: Some(updated),
                inverse,
            })
        }
        Some(RelationshipData::Many(_)) => Ok(AppliedOp::unchanged(Some(pre))),
        Some(RelationshipData::One(_)) => Err(mismatch(&identity.kind, relationship)),
        None => {
            let mut updated = pre.clone();
            updated.set_relationship(relationship, Some(RelationshipData::Many(vec![])));
            cache.write_record(updated.clone());
            Ok(AppliedOp {
                changed: true,
                data: Some(updated),
                inverse: vec![RecordOperation::AddRecord { record: pre }],
            })
        }
    }
}

fn replace_related_records(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    relationship: &str,
    related: &[RecordIdentity],
) -> Result<AppliedOp> {
    let def = rel_def(cache, &identity.kind, relationship)?;
    expect_many(&def, &identity.kind, relationship)?;

    // A to-many relationship is a set.
    let mut related: Vec<RecordIdentity> = related.to_vec();
    {
        let mut seen: Vec<RecordIdentity> = Vec::with_capacity(related.len());
        related.retain(|target| {
            if seen.contains(target) {
                false
            } else {
                seen.push(target.clone());
                true
            }
        });
    }
    let related = &related[..];

    let pre = cache.current_record(identity);
    let old_data = pre
        .as_ref()
        .and_then(|record| record.relationship(relationship).cloned());
    if let Some(RelationshipData::One(_)) = old_data {
        return Err(mismatch(&identity.kind, relationship));
    }
    let old_targets = edge_targets(old_data.as_ref());
    if matches!(&old_data, Some(RelationshipData::Many(targets)) if targets.as_slice() == related) {
        return Ok(AppliedOp::unchanged(pre));
    }

    let mut updated = pre
        .clone()
        .unwrap_or_else(|| Record::from_identity(identity.clone()));
    updated.set_relationship(
        relationship,
        Some(RelationshipData::Many(related.to_vec())),
    );
    cache.write_record(updated.clone());

    let mut inverse = vec![match (&pre, &old_data) {
        (Some(_), Some(_)) => RecordOperation::ReplaceRelatedRecords {
            record: identity.clone(),
            relationship: relationship.to_string(),
            related_records: old_targets.clone(),
        },
        (Some(pre), None) => RecordOperation::AddRecord { record: pre.clone() },
        (None, _) => RecordOperation::RemoveRecord {
            record: identity.clone(),
        },
    }];

    if let Some(inv) = &def.inverse {
        for target in &old_targets {
            if !related.contains(target) {
                cache.remove_inverse_entry(identity, relationship, target);
                inverse.extend(cascade_unlink(cache, identity, target, inv)?);
            }
        }
        for target in related {
            if !old_targets.contains(target) {
                cache.add_inverse_entry(InverseRelationship {
                    record: identity.clone(),
                    relationship: relationship.to_string(),
                    related_record: target.clone(),
                });
                inverse.extend(cascade_link(cache, identity, target, inv)?);
            }
        }
    }

    Ok(AppliedOp {
        changed: true,
        data: Some(updated),
        inverse,
    })
}

fn replace_related_record(
    cache: &mut RecordCache,
    identity: &RecordIdentity,
    relationship: &str,
    related: Option<RecordIdentity>,
) -> Result<AppliedOp> {
    let def = rel_def(cache, &identity.kind, relationship)?;
    if def.kind != RelationshipKind::HasOne {
        return Err(mismatch(&identity.kind, relationship));
    }

    let pre = cache.current_record(identity);
    let old_data = pre
        .as_ref()
        .and_then(|record| record.relationship(relationship).cloned());
    if let Some(RelationshipData::Many(_)) = old_data {
        return Err(mismatch(&identity.kind, relationship));
    }
    let old = match &old_data {
        Some(RelationshipData::One(old)) => old.clone(),
        _ => None,
    };
    if old_data.is_some() && old == related {
        return Ok(AppliedOp::unchanged(pre));
    }

    let mut updated = pre
        .clone()
        .unwrap_or_else(|| Record::from_identity(identity.clone()));
    updated.set_relationship(relationship, Some(RelationshipData::One(related.clone())));
    cache.write_record(updated.clone());

    let mut inverse = vec![match (&pre, &old_data) {
        (Some(_), Some(_)) => RecordOperation::ReplaceRelatedRecord {
            record: identity.clone(),
            relationship: relationship.to_string(),
            related_record: old.clone(),
        },
        (Some(pre), None) => RecordOperation::AddRecord { record: pre.clone() },
        (None, _) => RecordOperation::RemoveRecord {
            record: identity.clone(),
        },
    }];

    if let Some(inv) = &def.inverse {
        if let Some(old_target) = &old {
            cache.remove_inverse_entry(identity, relationship, old_target);
            inverse.extend(cascade_unlink(cache, identity, old_target, inv)?);
        }
        if let Some(new_target) = &related {
            cache.add_inverse_entry(InverseRelationship {
                record: identity.clone(),
                relationship: relationship.to_string(),
                related_record: new_target.clone(),
            });
            inverse.extend(cascade_link(cache, identity, new_target, inv)?);
        }
    }

    Ok(AppliedOp {
        changed: true,
        data: Some(updated),
        inverse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RecordCache;
    use orbit_api::solar_system_schema;
    use serde_json::json;
    use std::sync::Arc;

    fn cache() -> RecordCache {
        RecordCache::new(Arc::new(solar_system_schema()))
    }

    fn jupiter() -> Record {
        Record::new("planet", "jupiter").with_attribute("name", "Jupiter")
    }

    fn io_with_planet() -> Record {
        Record::new("moon", "io").with_relationship(
            "planet",
            RelationshipData::One(Some(RecordIdentity::new("planet", "jupiter"))),
        )
    }

    #[test]
    fn test_add_record_inverse_is_remove() {
        let mut cache = cache();
        let result = cache
            .patch(&[RecordOperation::AddRecord { record: jupiter() }])
            .unwrap();
        assert!(result.changed);
        assert_eq!(
            result.inverse_operations,
            vec![RecordOperation::RemoveRecord {
                record: RecordIdentity::new("planet", "jupiter"),
            }]
        );
    }

    #[test]
    fn test_add_record_cascades_to_inverse_side() {
        let mut cache = cache();
        cache
            .patch(&[RecordOperation::AddRecord { record: jupiter() }])
            .unwrap();
        cache
            .patch(&[RecordOperation::AddRecord {
                record: io_with_planet(),
            }])
            .unwrap();

        let jupiter = cache
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap();
        assert_eq!(
            jupiter.relationship("moons").unwrap().as_many().unwrap(),
            &[RecordIdentity::new("moon", "io")]
        );

        // The index holds an entry keyed by the edge target.
        let entries =
            cache.inverse_relationships_of(&RecordIdentity::new("planet", "jupiter"));
        assert!(entries.iter().any(|e| {
            e.record == RecordIdentity::new("moon", "io") && e.relationship == "planet"
        }));
    }

    #[test]
    fn test_remove_record_strips_inverse_edges() {
        let mut cache = cache();
        cache
            .patch(&[
                RecordOperation::AddRecord { record: jupiter() },
                RecordOperation::AddRecord {
                    record: io_with_planet(),
                },
            ])
            .unwrap();

        cache
            .patch(&[RecordOperation::RemoveRecord {
                record: RecordIdentity::new("moon", "io"),
            }])
            .unwrap();

        let jupiter = cache
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap();
        assert_eq!(
            jupiter.relationship("moons").unwrap().as_many().unwrap(),
            &[] as &[RecordIdentity]
        );
        assert!(cache
            .inverse_relationships_of(&RecordIdentity::new("planet", "jupiter"))
            .is_empty());
    }

    #[test]
    fn test_update_record_deep_merges() {
        let mut cache = cache();
        cache
            .patch(&[RecordOperation::AddRecord { record: jupiter() }])
            .unwrap();
        cache
            .patch(&[RecordOperation::UpdateRecord {
                record: Record::new("planet", "jupiter")
                    .with_attribute("classification", "gas giant"),
            }])
            .unwrap();

        let jupiter = cache
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap();
        assert_eq!(jupiter.attribute("name"), Some(&json!("Jupiter")));
        assert_eq!(jupiter.attribute("classification"), Some(&json!("gas giant")));
    }

    #[test]
    fn test_replace_attribute_on_absent_record_creates_shell() {
        let mut cache = cache();
        let result = cache
            .patch(&[RecordOperation::ReplaceAttribute {
                record: RecordIdentity::new("planet", "pluto"),
                attribute: "name".to_string(),
                value: Some(json!("Pluto")),
            }])
            .unwrap();

        assert!(result.changed);
        assert_eq!(
            result.inverse_operations,
            vec![RecordOperation::RemoveRecord {
                record: RecordIdentity::new("planet", "pluto"),
            }]
        );
        assert!(cache
            .get_record_sync(&RecordIdentity::new("planet", "pluto"))
            .is_some());
    }

    #[test]
    fn test_remove_from_related_on_absent_record_creates_empty_shell() {
        let mut cache = cache();
        cache
            .patch(&[RecordOperation::RemoveFromRelatedRecords {
                record: RecordIdentity::new("planet", "jupiter"),
                relationship: "moons".to_string(),
                related_record: RecordIdentity::new("moon", "io"),
            }])
            .unwrap();

        let jupiter = cache
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap();
        assert_eq!(
            jupiter.relationship("moons").unwrap().as_many().unwrap(),
            &[] as &[RecordIdentity]
        );
    }

    #[test]
    fn test_add_to_related_is_idempotent() {
        let mut cache = cache();
        let io = RecordIdentity::new("moon", "io");
        cache
            .patch(&[
                RecordOperation::AddRecord { record: jupiter() },
                RecordOperation::AddRecord {
                    record: Record::new("moon", "io"),
                },
            ])
            .unwrap();

        let op = RecordOperation::AddToRelatedRecords {
            record: RecordIdentity::new("planet", "jupiter"),
            relationship: "moons".to_string(),
            related_record: io.clone(),
        };
        cache.patch(&[op.clone()]).unwrap();
        let once = cache.flattened();
        let second = cache.patch(&[op]).unwrap();
        assert!(!second.changed);
        assert!(second.inverse_operations.is_empty());
        assert_eq!(cache.flattened(), once);
    }

    #[test]
    fn test_repointing_a_to_one_displaces_the_old_target() {
        let mut cache = cache();
        cache
            .patch(&[
                RecordOperation::AddRecord { record: jupiter() },
                RecordOperation::AddRecord {
                    record: Record::new("planet", "saturn"),
                },
                RecordOperation::AddRecord {
                    record: io_with_planet(),
                },
            ])
            .unwrap();

        cache
            .patch(&[RecordOperation::ReplaceRelatedRecord {
                record: RecordIdentity::new("moon", "io"),
                relationship: "planet".to_string(),
                related_record: Some(RecordIdentity::new("planet", "saturn")),
            }])
            .unwrap();

        let jupiter = cache
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .unwrap();
        assert_eq!(
            jupiter.relationship("moons").unwrap().as_many().unwrap(),
            &[] as &[RecordIdentity]
        );
        let saturn = cache
            .get_record_sync(&RecordIdentity::new("planet", "saturn"))
            .unwrap();
        assert_eq!(
            saturn.relationship("moons").unwrap().as_many().unwrap(),
            &[RecordIdentity::new("moon", "io")]
        );
    }

    #[test]
    fn test_inverse_round_trip_restores_state() {
        let mut cache = cache();
        cache
            .patch(&[RecordOperation::AddRecord { record: jupiter() }])
            .unwrap();
        let baseline = cache.flattened();

        let result = cache
            .patch(&[
                RecordOperation::AddRecord {
                    record: io_with_planet(),
                },
                RecordOperation::ReplaceAttribute {
                    record: RecordIdentity::new("planet", "jupiter"),
                    attribute: "name".to_string(),
                    value: Some(json!("Zeus")),
                },
            ])
            .unwrap();

        cache.patch(&result.inverse_operations).unwrap();
        assert_eq!(cache.flattened(), baseline);
    }

    #[test]
    fn test_replace_related_records_diffs_edges() {
        let mut cache = cache();
        cache
            .patch(&[
                RecordOperation::AddRecord { record: jupiter() },
                RecordOperation::AddRecord {
                    record: Record::new("moon", "io"),
                },
                RecordOperation::AddRecord {
                    record: Record::new("moon", "europa"),
                },
                RecordOperation::AddToRelatedRecords {
                    record: RecordIdentity::new("planet", "jupiter"),
                    relationship: "moons".to_string(),
                    related_record: RecordIdentity::new("moon", "io"),
                },
            ])
            .unwrap();

        cache
            .patch(&[RecordOperation::ReplaceRelatedRecords {
                record: RecordIdentity::new("planet", "jupiter"),
                relationship: "moons".to_string(),
                related_records: vec![RecordIdentity::new("moon", "europa")],
            }])
            .unwrap();

        let io = cache
            .get_record_sync(&RecordIdentity::new("moon", "io"))
            .unwrap();
        assert_eq!(io.relationship("planet").unwrap().as_one(), None);
        let europa = cache
            .get_record_sync(&RecordIdentity::new("moon", "europa"))
            .unwrap();
        assert_eq!(
            europa.relationship("planet").unwrap().as_one(),
            Some(&RecordIdentity::new("planet", "jupiter"))
        );
    }

    #[test]
    fn test_undeclared_relationship_is_a_schema_error() {
        let mut cache = cache();
        let result = cache.patch(&[RecordOperation::AddToRelatedRecords {
            record: RecordIdentity::new("planet", "jupiter"),
            relationship: "rings".to_string(),
            related_record: RecordIdentity::new("moon", "io"),
        }]);
        assert!(matches!(result, Err(OrbitError::Schema(_))));
    }
}
