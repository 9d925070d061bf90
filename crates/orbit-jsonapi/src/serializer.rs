//! Record to resource-document conversion.
//!
//! When a remote key is configured (e.g. `remoteId`), resource ids on the
//! wire are the remote key values; local ids stay local. The shared key map
//! resolves one to the other, and unknown remote ids are assigned fresh
//! local ids on deserialization.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use orbit::KeyMap;
use orbit_api::{Record, RecordIdentity, RelationshipData};

use crate::documents::{
    RelationshipData as WireRelationshipData, RelationshipObject, Resource, ResourceIdentifier,
};

pub struct JsonApiSerializer {
    /// Key used for remote ids; `None` shares ids with the server verbatim.
    remote_key: Option<String>,
    key_map: Arc<KeyMap>,
}

impl JsonApiSerializer {
    pub fn new(remote_key: Option<String>, key_map: Arc<KeyMap>) -> Self {
        Self {
            remote_key,
            key_map,
        }
    }

    pub fn remote_key(&self) -> Option<&str> {
        self.remote_key.as_deref()
    }

    /// The wire id for a local identity, when one is known.
    pub fn resource_id(&self, identity: &RecordIdentity) -> Option<String> {
        match &self.remote_key {
            Some(key) => self.key_map.key_from_id(&identity.kind, key, &identity.id),
            None => Some(identity.id.clone()),
        }
    }

    /// The local id for a wire id, assigning a fresh one when unknown.
    pub fn local_id(&self, kind: &str, resource_id: &str) -> String {
        match &self.remote_key {
            Some(key) => match self.key_map.id_from_key(kind, key, resource_id) {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4().to_string();
                    self.key_map.push_key(kind, &id, key, resource_id);
                    id
                }
            },
            None => resource_id.to_string(),
        }
    }

    fn identifier(&self, identity: &RecordIdentity) -> ResourceIdentifier {
        ResourceIdentifier {
            kind: identity.kind.clone(),
            id: self
                .resource_id(identity)
                .unwrap_or_else(|| identity.id.clone()),
        }
    }

    pub fn serialize_identity(&self, identity: &RecordIdentity) -> ResourceIdentifier {
        self.identifier(identity)
    }

    pub fn serialize_record(&self, record: &Record) -> Resource {
        let relationships = record.relationships.as_ref().map(|rels| {
            rels.iter()
                .map(|(name, data)| {
                    let data = match data {
                        RelationshipData::One(identity) => WireRelationshipData::One(
                            identity.as_ref().map(|identity| self.identifier(identity)),
                        ),
                        RelationshipData::Many(identities) => WireRelationshipData::Many(
                            identities
                                .iter()
                                .map(|identity| self.identifier(identity))
                                .collect(),
                        ),
                    };
                    (name.clone(), RelationshipObject { data })
                })
                .collect::<HashMap<_, _>>()
        });

        Resource {
            kind: record.kind().to_string(),
            id: self.resource_id(&record.identity),
            attributes: record.attributes.clone(),
            relationships,
        }
    }

    pub fn deserialize_identifier(&self, identifier: &ResourceIdentifier) -> RecordIdentity {
        RecordIdentity::new(
            identifier.kind.clone(),
            self.local_id(&identifier.kind, &identifier.id),
        )
    }

    pub fn deserialize_resource(&self, resource: &Resource) -> Record {
        let local_id = match &resource.id {
            Some(id) => self.local_id(&resource.kind, id),
            None => Uuid::new_v4().to_string(),
        };
        let mut record = Record::new(resource.kind.clone(), local_id);
        if let (Some(key), Some(id)) = (&self.remote_key, &resource.id) {
            record.set_key(key, Some(id.clone()));
        }
        record.attributes = resource.attributes.clone();
        record.relationships = resource.relationships.as_ref().map(|rels| {
            rels.iter()
                .map(|(name, object)| {
                    let data = match &object.data {
                        WireRelationshipData::One(identifier) => RelationshipData::One(
                            identifier
                                .as_ref()
                                .map(|identifier| self.deserialize_identifier(identifier)),
                        ),
                        WireRelationshipData::Many(identifiers) => RelationshipData::Many(
                            identifiers
                                .iter()
                                .map(|identifier| self.deserialize_identifier(identifier))
                                .collect(),
                        ),
                    };
                    (name.clone(), data)
                })
                .collect()
        });
        record.normalize();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn serializer() -> JsonApiSerializer {
        JsonApiSerializer::new(Some("remoteId".to_string()), Arc::new(KeyMap::new()))
    }

    #[test]
    fn test_serialize_uses_remote_key_as_wire_id() {
        let serializer = serializer();
        let record = Record::new("planet", "p1")
            .with_key("remoteId", "12345")
            .with_attribute("name", "Jupiter");
        serializer.key_map.push_record(&record);

        let resource = serializer.serialize_record(&record);
        assert_eq!(resource.id.as_deref(), Some("12345"));
        assert_eq!(
            resource.attributes.as_ref().unwrap().get("name"),
            Some(&json!("Jupiter"))
        );
    }

    #[test]
    fn test_serialize_omits_unknown_wire_id() {
        let serializer = serializer();
        let record = Record::new("planet", "p1").with_attribute("name", "Jupiter");
        let resource = serializer.serialize_record(&record);
        assert_eq!(resource.id, None);
    }

    #[test]
    fn test_deserialize_assigns_local_id_and_registers_key() {
        let serializer = serializer();
        let resource = Resource {
            kind: "planet".to_string(),
            id: Some("12345".to_string()),
            attributes: Some(HashMap::from([("name".to_string(), json!("Jupiter"))])),
            relationships: None,
        };

        let record = serializer.deserialize_resource(&resource);
        assert_eq!(record.key("remoteId"), Some("12345"));
        assert_eq!(
            serializer
                .key_map
                .id_from_key("planet", "remoteId", "12345")
                .as_deref(),
            Some(record.id())
        );

        // A second document with the same wire id maps to the same record.
        let again = serializer.deserialize_resource(&resource);
        assert_eq!(again.id(), record.id());
    }

    #[test]
    fn test_without_remote_key_ids_pass_through() {
        let serializer = JsonApiSerializer::new(None, Arc::new(KeyMap::new()));
        let record = Record::new("planet", "jupiter");
        let resource = serializer.serialize_record(&record);
        assert_eq!(resource.id.as_deref(), Some("jupiter"));
        let back = serializer.deserialize_resource(&resource);
        assert_eq!(back.id(), "jupiter");
    }
}
