//! The in-memory record cache: an operation-sourced store over a typed
//! record graph.
//!
//! State is a per-model map of records plus an inverse-relationship index.
//! Record iteration order within a model is insertion order, kept in an
//! explicit order vector beside the map. A cache built from a base snapshot
//! (a fork) reads through to the base and copies on write; removals of base
//! records are tombstoned in the overlay.
//!
//! Every mutation goes through [`RecordCache::patch`], which applies each
//! operation, cascades relationship edits to the declared inverse side, and
//! accumulates inverse operations. The inverse sequence is returned in
//! reverse of forward order, so it is directly replayable for rollback.

mod key_map;
mod operators;
mod query;

pub use key_map::KeyMap;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use orbit_api::{
    OrbitError, Record, RecordIdentity, RecordOperation, Result, Schema, Transform,
};

/// One entry of the inverse-relationship index: `record.relationship` holds
/// an edge pointing at `related_record` (the index key).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct InverseRelationship {
    pub record: RecordIdentity,
    pub relationship: String,
    pub related_record: RecordIdentity,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ModelBucket {
    /// Record ids in insertion order.
    order: Vec<String>,
    /// `None` marks a tombstone shadowing a base record.
    records: HashMap<String, Option<Record>>,
}

/// The materialized half of a cache: records plus the inverse index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheState {
    models: HashMap<String, ModelBucket>,
    inverse: HashMap<RecordIdentity, Vec<InverseRelationship>>,
}

impl CacheState {
    /// Every record in the state, grouped by model, in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.models.values().flat_map(|bucket| {
            bucket
                .order
                .iter()
                .filter_map(|id| bucket.records.get(id).and_then(Option::as_ref))
        })
    }

    /// Every inverse-index entry list, keyed by the edge target.
    pub fn inverse_entries(
        &self,
    ) -> impl Iterator<Item = (&RecordIdentity, &Vec<InverseRelationship>)> {
        self.inverse.iter()
    }

    pub fn record(&self, identity: &RecordIdentity) -> Option<&Record> {
        self.models
            .get(&identity.kind)
            .and_then(|bucket| bucket.records.get(&identity.id))
            .and_then(Option::as_ref)
    }
}

/// Result of applying a patch.
#[derive(Debug, Clone, Default)]
pub struct PatchResult {
    /// Post-image of each operation's primary record, in operation order.
    pub data: Vec<Option<Record>>,
    /// Inverse operations in reverse of forward order.
    pub inverse_operations: Vec<RecordOperation>,
    /// Whether any operation changed the cache.
    pub changed: bool,
}

#[derive(Clone)]
pub struct RecordCache {
    schema: Arc<Schema>,
    key_map: Option<Arc<KeyMap>>,
    state: CacheState,
    base: Option<Arc<CacheState>>,
}

impl RecordCache {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            key_map: None,
            state: CacheState::default(),
            base: None,
        }
    }

    pub fn with_key_map(schema: Arc<Schema>, key_map: Arc<KeyMap>) -> Self {
        Self {
            schema,
            key_map: Some(key_map),
            state: CacheState::default(),
            base: None,
        }
    }

    /// A cache layered over an immutable snapshot; reads fall through to the
    /// base until the overlay shadows them.
    pub fn fork_from(
        schema: Arc<Schema>,
        key_map: Option<Arc<KeyMap>>,
        base: Arc<CacheState>,
    ) -> Self {
        Self {
            schema,
            key_map,
            state: CacheState::default(),
            base: Some(base),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn key_map(&self) -> Option<&Arc<KeyMap>> {
        self.key_map.as_ref()
    }

    /// Look up one record. Tombstones in the overlay shadow base records.
    pub fn get_record_sync(&self, identity: &RecordIdentity) -> Option<&Record> {
        if let Some(bucket) = self.state.models.get(&identity.kind) {
            if let Some(slot) = bucket.records.get(&identity.id) {
                return slot.as_ref();
            }
        }
        self.base
            .as_ref()
            .and_then(|base| base.models.get(&identity.kind))
            .and_then(|bucket| bucket.records.get(&identity.id))
            .and_then(|slot| slot.as_ref())
    }

    /// All records of one model, in insertion order. Base records come first
    /// (in base insertion order), overlay-only records after.
    pub fn records_sync(&self, kind: &str) -> Vec<&Record> {
        let mut out = Vec::new();
        let overlay = self.state.models.get(kind);
        let base_bucket = self.base.as_ref().and_then(|base| base.models.get(kind));

        if let Some(base_bucket) = base_bucket {
            for id in &base_bucket.order {
                match overlay.and_then(|bucket| bucket.records.get(id)) {
                    Some(Some(record)) => out.push(record),
                    Some(None) => {}
                    None => {
                        if let Some(Some(record)) = base_bucket.records.get(id) {
                            out.push(record);
                        }
                    }
                }
            }
        }
        if let Some(overlay) = overlay {
            for id in &overlay.order {
                if base_bucket.is_some_and(|bucket| bucket.records.contains_key(id)) {
                    continue;
                }
                if let Some(Some(record)) = overlay.records.get(id) {
                    out.push(record);
                }
            }
        }
        out
    }

    /// Index entries keyed by `identity`: every edge pointing at it.
    pub fn inverse_relationships_of(&self, identity: &RecordIdentity) -> Vec<InverseRelationship> {
        if let Some(entries) = self.state.inverse.get(identity) {
            return entries.clone();
        }
        self.base
            .as_ref()
            .and_then(|base| base.inverse.get(identity))
            .cloned()
            .unwrap_or_default()
    }

    /// Collapse base and overlay into one self-contained state, dropping
    /// tombstones and empty index entries.
    pub fn flattened(&self) -> CacheState {
        let mut flat = self
            .base
            .as_ref()
            .map(|base| (**base).clone())
            .unwrap_or_default();

        for (kind, overlay) in &self.state.models {
            let bucket = flat.models.entry(kind.clone()).or_default();
            for id in &overlay.order {
                match overlay.records.get(id) {
                    Some(Some(record)) => {
                        if bucket.records.insert(id.clone(), Some(record.clone())).is_none() {
                            bucket.order.push(id.clone());
                        }
                    }
                    Some(None) => {
                        if bucket.records.remove(id).is_some() {
                            bucket.order.retain(|entry| entry != id);
                        }
                    }
                    None => {}
                }
            }
        }
        for (key, entries) in &self.state.inverse {
            if entries.is_empty() {
                flat.inverse.remove(key);
            } else {
                flat.inverse.insert(key.clone(), entries.clone());
            }
        }
        // Entry order within an index list is not meaningful; normalize it so
        // structurally-equal states compare equal.
        for entries in flat.inverse.values_mut() {
            entries.sort();
        }
        flat.models.retain(|_, bucket| !bucket.order.is_empty());
        flat
    }

    /// Immutable snapshot of the current state, the anchor for forks.
    pub fn snapshot(&self) -> Arc<CacheState> {
        Arc::new(self.flattened())
    }

    /// Apply operations in order. On failure the already-applied prefix is
    /// unwound, leaving the cache as it was before the call.
    pub fn patch(&mut self, operations: &[RecordOperation]) -> Result<PatchResult> {
        let mut data = Vec::with_capacity(operations.len());
        let mut forward_inverse: Vec<RecordOperation> = Vec::new();
        let mut changed = false;

        for op in operations {
            match operators::apply_operation(self, op) {
                Ok(applied) => {
                    changed |= applied.changed;
                    data.push(applied.data);
                    forward_inverse.extend(applied.inverse);
                }
                Err(err) => {
                    // Unwind the applied prefix in reverse order.
                    for inverse in forward_inverse.iter().rev() {
                        if let Err(unwind_err) = operators::apply_operation(self, inverse) {
                            tracing::error!(%unwind_err, "failed to unwind partial patch");
                        }
                    }
                    return Err(err);
                }
            }
        }

        forward_inverse.reverse();
        Ok(PatchResult {
            data,
            inverse_operations: forward_inverse,
            changed,
        })
    }

    /// Apply a transform's operations; identical to [`RecordCache::patch`],
    /// named for the source-facing entry point.
    pub fn update(&mut self, transform: &Transform) -> Result<PatchResult> {
        self.patch(&transform.operations)
    }

    // ---- internals shared with the operator module ----

    fn base_record(&self, identity: &RecordIdentity) -> Option<&Record> {
        self.base
            .as_ref()
            .and_then(|base| base.models.get(&identity.kind))
            .and_then(|bucket| bucket.records.get(&identity.id))
            .and_then(|slot| slot.as_ref())
    }

    pub(crate) fn current_record(&self, identity: &RecordIdentity) -> Option<Record> {
        self.get_record_sync(identity).cloned()
    }

    pub(crate) fn write_record(&mut self, mut record: Record) {
        record.normalize();
        if let Some(key_map) = &self.key_map {
            key_map.push_record(&record);
        }
        let kind = record.kind().to_string();
        let id = record.id().to_string();
        let bucket = self.state.models.entry(kind).or_default();
        if !bucket.records.contains_key(&id) {
            bucket.order.push(id.clone());
        }
        bucket.records.insert(id, Some(record));
    }

    pub(crate) fn erase_record(&mut self, identity: &RecordIdentity) {
        let base_has = self.base_record(identity).is_some();
        let bucket = self.state.models.entry(identity.kind.clone()).or_default();
        if base_has {
            if !bucket.records.contains_key(&identity.id) {
                bucket.order.push(identity.id.clone());
            }
            bucket.records.insert(identity.id.clone(), None);
        } else {
            bucket.records.remove(&identity.id);
            bucket.order.retain(|id| id != &identity.id);
        }
    }

    /// Copy-on-write access to the index entries keyed by `key`.
    fn inverse_mut(&mut self, key: &RecordIdentity) -> &mut Vec<InverseRelationship> {
        if !self.state.inverse.contains_key(key) {
            let seed = self
                .base
                .as_ref()
                .and_then(|base| base.inverse.get(key))
                .cloned()
                .unwrap_or_default();
            self.state.inverse.insert(key.clone(), seed);
        }
        self.state.inverse.get_mut(key).expect("entry just seeded")
    }

    pub(crate) fn add_inverse_entry(&mut self, entry: InverseRelationship) {
        let entries = self.inverse_mut(&entry.related_record);
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    pub(crate) fn remove_inverse_entry(
        &mut self,
        record: &RecordIdentity,
        relationship: &str,
        related_record: &RecordIdentity,
    ) {
        let entries = self.inverse_mut(related_record);
        entries.retain(|entry| {
            !(entry.record == *record && entry.relationship == relationship)
        });
    }

    pub(crate) fn take_inverse_entries(&mut self, key: &RecordIdentity) -> Vec<InverseRelationship> {
        let entries = self.inverse_mut(key);
        std::mem::take(entries)
    }

    pub(crate) fn validate_model(&self, kind: &str) -> Result<()> {
        if self.schema.has_model(kind) {
            Ok(())
        } else {
            Err(OrbitError::Schema(format!("model '{kind}' is not declared")))
        }
    }

    /// Distinct models mentioned anywhere in the state; used by durable
    /// adapters when rebuilding stores.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: HashSet<String> = self.state.models.keys().cloned().collect();
        if let Some(base) = &self.base {
            names.extend(base.models.keys().cloned());
        }
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_api::solar_system_schema;

    fn cache() -> RecordCache {
        RecordCache::new(Arc::new(solar_system_schema()))
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut cache = cache();
        for id in ["a", "c", "b"] {
            cache
                .patch(&[RecordOperation::AddRecord {
                    record: Record::new("planet", id),
                }])
                .unwrap();
        }
        let ids: Vec<&str> = cache
            .records_sync("planet")
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_remove_and_readd_moves_to_end() {
        let mut cache = cache();
        for id in ["a", "b"] {
            cache
                .patch(&[RecordOperation::AddRecord {
                    record: Record::new("planet", id),
                }])
                .unwrap();
        }
        cache
            .patch(&[RecordOperation::RemoveRecord {
                record: RecordIdentity::new("planet", "a"),
            }])
            .unwrap();
        cache
            .patch(&[RecordOperation::AddRecord {
                record: Record::new("planet", "a"),
            }])
            .unwrap();
        let ids: Vec<&str> = cache
            .records_sync("planet")
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_fork_reads_fall_through_and_writes_shadow() {
        let mut parent = cache();
        parent
            .patch(&[RecordOperation::AddRecord {
                record: Record::new("planet", "jupiter").with_attribute("name", "Jupiter"),
            }])
            .unwrap();

        let snapshot = parent.snapshot();
        let mut fork = RecordCache::fork_from(parent.schema().clone(), None, snapshot);

        let jupiter = RecordIdentity::new("planet", "jupiter");
        assert!(fork.get_record_sync(&jupiter).is_some());

        fork.patch(&[RecordOperation::ReplaceAttribute {
            record: jupiter.clone(),
            attribute: "name".to_string(),
            value: Some(serde_json::json!("Giant")),
        }])
        .unwrap();

        assert_eq!(
            fork.get_record_sync(&jupiter).unwrap().attribute("name"),
            Some(&serde_json::json!("Giant"))
        );
        assert_eq!(
            parent.get_record_sync(&jupiter).unwrap().attribute("name"),
            Some(&serde_json::json!("Jupiter"))
        );
    }

    #[test]
    fn test_fork_tombstone_shadows_base_record() {
        let mut parent = cache();
        parent
            .patch(&[RecordOperation::AddRecord {
                record: Record::new("planet", "jupiter"),
            }])
            .unwrap();
        let mut fork = RecordCache::fork_from(parent.schema().clone(), None, parent.snapshot());

        fork.patch(&[RecordOperation::RemoveRecord {
            record: RecordIdentity::new("planet", "jupiter"),
        }])
        .unwrap();

        assert!(fork
            .get_record_sync(&RecordIdentity::new("planet", "jupiter"))
            .is_none());
        assert!(fork.records_sync("planet").is_empty());
        assert_eq!(parent.records_sync("planet").len(), 1);
    }

    #[test]
    fn test_patch_failure_unwinds_prefix() {
        let mut cache = cache();
        let before = cache.flattened();
        let result = cache.patch(&[
            RecordOperation::AddRecord {
                record: Record::new("planet", "jupiter"),
            },
            RecordOperation::AddRecord {
                record: Record::new("asteroid", "ceres"),
            },
        ]);
        assert!(matches!(result, Err(OrbitError::Schema(_))));
        assert_eq!(cache.flattened(), before);
    }
}
