//! Records, identities and relationship data.
//!
//! A record is a value object: the cache clones on modify, so nothing here
//! carries interior mutability. Cross-references between records are always
//! expressed as [`RecordIdentity`] pairs, never as owned records, which keeps
//! the record graph free of ownership cycles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a record: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct RecordIdentity {
    /// Model name ("type" on the wire).
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl RecordIdentity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Data of a single relationship.
///
/// Absence of a relationship key on a record means "unknown"; `One(None)` and
/// `Many(vec![])` mean "known empty", which is a different statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    /// To-one: a single identity or known-empty.
    One(Option<RecordIdentity>),
    /// To-many: an ordered set of identities.
    Many(Vec<RecordIdentity>),
}

impl RelationshipData {
    pub fn as_one(&self) -> Option<&RecordIdentity> {
        match self {
            RelationshipData::One(data) => data.as_ref(),
            RelationshipData::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&[RecordIdentity]> {
        match self {
            RelationshipData::Many(data) => Some(data),
            RelationshipData::One(_) => None,
        }
    }

    pub fn contains(&self, identity: &RecordIdentity) -> bool {
        match self {
            RelationshipData::One(data) => data.as_ref() == Some(identity),
            RelationshipData::Many(data) => data.contains(identity),
        }
    }
}

/// A typed record: identity plus optional keys, attributes and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub identity: RecordIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationships: Option<HashMap<String, RelationshipData>>,
}

impl Record {
    /// A bare record shell: identity only.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            identity: RecordIdentity::new(kind, id),
            keys: None,
            attributes: None,
            relationships: None,
        }
    }

    pub fn from_identity(identity: RecordIdentity) -> Self {
        Self {
            identity,
            keys: None,
            attributes: None,
            relationships: None,
        }
    }

    pub fn kind(&self) -> &str {
        &self.identity.kind
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.as_ref().and_then(|attrs| attrs.get(name))
    }

    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys
            .as_ref()
            .and_then(|keys| keys.get(name))
            .map(String::as_str)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipData> {
        self.relationships.as_ref().and_then(|rels| rels.get(name))
    }

    /// Builder-style attribute setter, used heavily in tests.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        data: RelationshipData,
    ) -> Self {
        self.relationships
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), data);
        self
    }

    pub fn set_attribute(&mut self, name: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.attributes
                    .get_or_insert_with(HashMap::new)
                    .insert(name.to_string(), value);
            }
            None => {
                if let Some(attrs) = self.attributes.as_mut() {
                    attrs.remove(name);
                }
            }
        }
    }

    pub fn set_key(&mut self, name: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.keys
                    .get_or_insert_with(HashMap::new)
                    .insert(name.to_string(), value);
            }
            None => {
                if let Some(keys) = self.keys.as_mut() {
                    keys.remove(name);
                }
            }
        }
    }

    pub fn set_relationship(&mut self, name: &str, data: Option<RelationshipData>) {
        match data {
            Some(data) => {
                self.relationships
                    .get_or_insert_with(HashMap::new)
                    .insert(name.to_string(), data);
            }
            None => {
                if let Some(rels) = self.relationships.as_mut() {
                    rels.remove(name);
                }
            }
        }
    }

    /// Drop empty member maps and deduplicate to-many data (a to-many
    /// relationship is a set) so structurally-equal records compare equal
    /// regardless of how they were built up.
    pub fn normalize(&mut self) {
        if self.keys.as_ref().is_some_and(HashMap::is_empty) {
            self.keys = None;
        }
        if self.attributes.as_ref().is_some_and(HashMap::is_empty) {
            self.attributes = None;
        }
        if let Some(rels) = self.relationships.as_mut() {
            for data in rels.values_mut() {
                if let RelationshipData::Many(targets) = data {
                    let mut seen = Vec::with_capacity(targets.len());
                    targets.retain(|target| {
                        if seen.contains(target) {
                            false
                        } else {
                            seen.push(target.clone());
                            true
                        }
                    });
                }
            }
        }
        if self.relationships.as_ref().is_some_and(HashMap::is_empty) {
            self.relationships = None;
        }
    }

    /// Deep-merge `update` over this record: incoming keys/attributes/
    /// relationship entries win; entries the update does not mention are kept.
    pub fn merge(&mut self, update: &Record) {
        if let Some(keys) = &update.keys {
            let target = self.keys.get_or_insert_with(HashMap::new);
            for (k, v) in keys {
                target.insert(k.clone(), v.clone());
            }
        }
        if let Some(attrs) = &update.attributes {
            let target = self.attributes.get_or_insert_with(HashMap::new);
            for (k, v) in attrs {
                target.insert(k.clone(), v.clone());
            }
        }
        if let Some(rels) = &update.relationships {
            let target = self.relationships.get_or_insert_with(HashMap::new);
            for (k, v) in rels {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

impl From<&Record> for RecordIdentity {
    fn from(record: &Record) -> Self {
        record.identity.clone()
    }
}
