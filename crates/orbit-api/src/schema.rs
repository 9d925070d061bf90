//! Schema declarations: the models, keys and relationships a cache knows.
//!
//! Declaration syntax, attribute validators and key generation live outside
//! the core; this module carries just enough structure for the cache to
//! maintain inverse relationships and for sources to resolve remote keys.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    HasOne,
    HasMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub kind: RelationshipKind,
    /// Target model name.
    pub model: String,
    /// Name of the relationship on the target model that mirrors this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub relationships: HashMap<String, RelationshipDef>,
}

impl ModelDef {
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.keys.push(name.into());
        self
    }

    pub fn has_one(
        mut self,
        name: impl Into<String>,
        model: impl Into<String>,
        inverse: Option<&str>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipDef {
                kind: RelationshipKind::HasOne,
                model: model.into(),
                inverse: inverse.map(str::to_string),
            },
        );
        self
    }

    pub fn has_many(
        mut self,
        name: impl Into<String>,
        model: impl Into<String>,
        inverse: Option<&str>,
    ) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipDef {
                kind: RelationshipKind::HasMany,
                model: model.into(),
                inverse: inverse.map(str::to_string),
            },
        );
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub models: HashMap<String, ModelDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, name: impl Into<String>, def: ModelDef) -> Self {
        self.models.insert(name.into(), def);
        self
    }

    pub fn model_def(&self, name: &str) -> Result<&ModelDef> {
        self.models
            .get(name)
            .ok_or_else(|| OrbitError::Schema(format!("model '{name}' is not declared")))
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn relationship_def(&self, model: &str, relationship: &str) -> Result<&RelationshipDef> {
        self.model_def(model)?
            .relationships
            .get(relationship)
            .ok_or_else(|| {
                OrbitError::Schema(format!(
                    "relationship '{relationship}' is not declared on model '{model}'"
                ))
            })
    }

    /// Stable fingerprint of the declared structure; durable adapters derive
    /// their store version from it so declaration changes rebuild stores.
    pub fn fingerprint(&self) -> u64 {
        let mut names: Vec<String> = Vec::new();
        let mut models: Vec<_> = self.models.iter().collect();
        models.sort_by(|a, b| a.0.cmp(b.0));
        for (model, def) in models {
            let mut attrs = def.attributes.clone();
            attrs.sort();
            let mut keys = def.keys.clone();
            keys.sort();
            let mut rels: Vec<_> = def
                .relationships
                .iter()
                .map(|(name, rel)| {
                    format!(
                        "{name}:{:?}:{}:{}",
                        rel.kind,
                        rel.model,
                        rel.inverse.as_deref().unwrap_or("")
                    )
                })
                .collect();
            rels.sort();
            names.push(format!(
                "{model}|{}|{}|{}",
                attrs.join(","),
                keys.join(","),
                rels.join(",")
            ));
        }
        let mut hasher = DefaultHasher::new();
        names.hash(&mut hasher);
        hasher.finish()
    }
}

/// The solar-system schema used throughout the test suites.
pub fn solar_system_schema() -> Schema {
    Schema::new()
        .model(
            "planet",
            ModelDef::default()
                .attribute("name")
                .attribute("classification")
                .key("remoteId")
                .has_many("moons", "moon", Some("planet")),
        )
        .model(
            "moon",
            ModelDef::default()
                .attribute("name")
                .key("remoteId")
                .has_one("planet", "planet", Some("moons")),
        )
}
