//! Reverse index from remote key values to local record ids.
//!
//! Shared between a cache and the network sources that resolve remote
//! identifiers: `('planet', 'remoteId', '12345') -> local id`. Updated on
//! every mutation that writes a key.

use std::collections::HashMap;
use std::sync::RwLock;

use orbit_api::Record;

#[derive(Default)]
struct KeyMapState {
    /// (model, key name, key value) -> record id
    key_to_id: HashMap<(String, String, String), String>,
    /// (model, key name, record id) -> key value
    id_to_key: HashMap<(String, String, String), String>,
}

#[derive(Default)]
pub struct KeyMap {
    state: RwLock<KeyMapState>,
}

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every key carried by the record.
    pub fn push_record(&self, record: &Record) {
        let Some(keys) = &record.keys else { return };
        let mut state = self.state.write().expect("key map lock poisoned");
        for (key_name, key_value) in keys {
            state.key_to_id.insert(
                (
                    record.kind().to_string(),
                    key_name.clone(),
                    key_value.clone(),
                ),
                record.id().to_string(),
            );
            state.id_to_key.insert(
                (
                    record.kind().to_string(),
                    key_name.clone(),
                    record.id().to_string(),
                ),
                key_value.clone(),
            );
        }
    }

    pub fn push_key(&self, kind: &str, id: &str, key_name: &str, key_value: &str) {
        let mut state = self.state.write().expect("key map lock poisoned");
        state.key_to_id.insert(
            (kind.to_string(), key_name.to_string(), key_value.to_string()),
            id.to_string(),
        );
        state.id_to_key.insert(
            (kind.to_string(), key_name.to_string(), id.to_string()),
            key_value.to_string(),
        );
    }

    pub fn id_from_key(&self, kind: &str, key_name: &str, key_value: &str) -> Option<String> {
        self.state
            .read()
            .expect("key map lock poisoned")
            .key_to_id
            .get(&(
                kind.to_string(),
                key_name.to_string(),
                key_value.to_string(),
            ))
            .cloned()
    }

    pub fn key_from_id(&self, kind: &str, key_name: &str, id: &str) -> Option<String> {
        self.state
            .read()
            .expect("key map lock poisoned")
            .id_to_key
            .get(&(kind.to_string(), key_name.to_string(), id.to_string()))
            .cloned()
    }
}
