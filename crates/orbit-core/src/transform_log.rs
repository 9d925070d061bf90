//! Append-only log of applied transform ids.
//!
//! The log is the source of truth for "what has this source applied":
//! membership gates idempotent re-application, ordering backs
//! `transforms_since`, and truncation/rollback are the structural half of
//! history rewriting (the cache half is inverse-operation replay, owned by
//! the source).

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::debug;

use orbit_api::{OrbitError, Result};

use crate::bucket::Bucket;
use crate::emitter::Emitter;

/// Payload of every log event: the ids the mutation touched, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub ids: Vec<String>,
}

/// Log event names.
pub mod log_events {
    pub const APPEND: &str = "append";
    pub const TRUNCATE: &str = "truncate";
    pub const ROLLBACK: &str = "rollback";
    pub const CLEAR: &str = "clear";
}

struct LogState {
    entries: Vec<String>,
    index: HashSet<String>,
}

/// Ordered, append-only sequence of transform ids with a membership index.
pub struct TransformLog {
    name: String,
    state: RwLock<LogState>,
    emitter: Emitter<LogEvent, ()>,
    bucket: Option<Arc<dyn Bucket>>,
}

impl TransformLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(LogState {
                entries: Vec::new(),
                index: HashSet::new(),
            }),
            emitter: Emitter::new(),
            bucket: None,
        }
    }

    pub fn with_bucket(name: impl Into<String>, bucket: Arc<dyn Bucket>) -> Self {
        let mut log = Self::new(name);
        log.bucket = Some(bucket);
        log
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event bus for log mutations; see [`log_events`].
    pub fn events(&self) -> &Emitter<LogEvent, ()> {
        &self.emitter
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().index.contains(id)
    }

    pub fn head(&self) -> Option<String> {
        self.read().entries.last().cloned()
    }

    pub fn entries(&self) -> Vec<String> {
        self.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Ids strictly after `id`, in log order.
    pub fn after(&self, id: &str) -> Result<Vec<String>> {
        let state = self.read();
        let pos = Self::position(&state, id)?;
        Ok(state.entries[pos + 1..].to_vec())
    }

    /// Ids strictly before `id`, in log order.
    pub fn before(&self, id: &str) -> Result<Vec<String>> {
        let state = self.read();
        let pos = Self::position(&state, id)?;
        Ok(state.entries[..pos].to_vec())
    }

    /// Append an id. Returns false (and emits nothing) when the id is
    /// already contained, which keeps ids unique within one log.
    pub async fn append(&self, id: &str) -> Result<bool> {
        {
            let mut state = self.write();
            if state.index.contains(id) {
                return Ok(false);
            }
            state.entries.push(id.to_string());
            state.index.insert(id.to_string());
        }
        self.emitter
            .settle_in_series(
                log_events::APPEND,
                &LogEvent {
                    ids: vec![id.to_string()],
                },
            )
            .await;
        self.persist().await;
        Ok(true)
    }

    /// Discard the marker entry and everything before it. `relative` shifts
    /// the marker within the log before the cut.
    pub async fn truncate(&self, id: &str, relative: i64) -> Result<()> {
        let removed = {
            let mut state = self.write();
            let cut = Self::resolve(&state, id, relative)?;
            let removed: Vec<String> = state.entries.drain(..=cut).collect();
            for id in &removed {
                state.index.remove(id);
            }
            removed
        };
        debug!(log = %self.name, count = removed.len(), "log truncated");
        self.emitter
            .settle_in_series(log_events::TRUNCATE, &LogEvent { ids: removed })
            .await;
        self.persist().await;
        Ok(())
    }

    /// Discard everything strictly after the marker entry, which becomes the
    /// new head. Returns the discarded ids in log order.
    pub async fn rollback(&self, id: &str, relative: i64) -> Result<Vec<String>> {
        let removed = {
            let mut state = self.write();
            let keep = Self::resolve(&state, id, relative)?;
            let removed: Vec<String> = state.entries.drain(keep + 1..).collect();
            for id in &removed {
                state.index.remove(id);
            }
            removed
        };
        debug!(log = %self.name, count = removed.len(), "log rolled back");
        self.emitter
            .settle_in_series(
                log_events::ROLLBACK,
                &LogEvent {
                    ids: removed.clone(),
                },
            )
            .await;
        self.persist().await;
        Ok(removed)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Vec<String> {
        let removed = {
            let mut state = self.write();
            state.index.clear();
            std::mem::take(&mut state.entries)
        };
        self.emitter
            .settle_in_series(
                log_events::CLEAR,
                &LogEvent {
                    ids: removed.clone(),
                },
            )
            .await;
        self.persist().await;
        removed
    }

    /// Reload entries persisted by a previous process.
    pub async fn restore(&self) -> Result<usize> {
        let Some(bucket) = &self.bucket else {
            return Ok(0);
        };
        let Some(value) = bucket.get(&self.bucket_key()).await? else {
            return Ok(0);
        };
        let entries: Vec<String> =
            serde_json::from_value(value).map_err(|e| OrbitError::Storage(e.to_string()))?;
        let count = entries.len();
        let mut state = self.write();
        state.index = entries.iter().cloned().collect();
        state.entries = entries;
        Ok(count)
    }

    fn position(state: &LogState, id: &str) -> Result<usize> {
        state
            .entries
            .iter()
            .position(|entry| entry == id)
            .ok_or_else(|| OrbitError::NotLogged(id.to_string()))
    }

    fn resolve(state: &LogState, id: &str, relative: i64) -> Result<usize> {
        let pos = Self::position(state, id)? as i64 + relative;
        if pos < 0 || pos >= state.entries.len() as i64 {
            return Err(OrbitError::OutOfRange {
                id: id.to_string(),
                relative,
            });
        }
        Ok(pos as usize)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LogState> {
        self.state.read().expect("transform log lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LogState> {
        self.state.write().expect("transform log lock poisoned")
    }

    fn bucket_key(&self) -> String {
        format!("transformlog:{}", self.name)
    }

    async fn persist(&self) {
        let Some(bucket) = &self.bucket else { return };
        let entries = self.entries();
        if let Err(err) = bucket
            .set(&self.bucket_key(), serde_json::json!(entries))
            .await
        {
            tracing::warn!(log = %self.name, %err, "failed to persist transform log");
        }
    }
}
