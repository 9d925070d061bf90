//! Operation and query-expression to HTTP request mapping.

use std::time::Duration;

use serde_json::{json, Value};

use orbit_api::{
    FilterOp, OrbitError, QueryExpression, RecordIdentity, RecordOperation, Result, SortOrder,
};

use crate::documents::ResourceDocument;
use crate::serializer::JsonApiSerializer;
use crate::transport::{HttpMethod, JsonApiRequest};

pub struct RequestBuilder<'a> {
    base_url: &'a str,
    serializer: &'a JsonApiSerializer,
    timeout: Duration,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(base_url: &'a str, serializer: &'a JsonApiSerializer, timeout: Duration) -> Self {
        Self {
            base_url,
            serializer,
            timeout,
        }
    }

    fn wire_id(&self, identity: &RecordIdentity) -> Result<String> {
        self.serializer.resource_id(identity).ok_or_else(|| {
            OrbitError::Assertion(format!("no remote id is known for {identity}"))
        })
    }

    fn record_url(&self, identity: &RecordIdentity) -> Result<String> {
        Ok(format!(
            "{}/{}/{}",
            self.base_url,
            identity.kind,
            self.wire_id(identity)?
        ))
    }

    fn relationship_url(&self, identity: &RecordIdentity, relationship: &str) -> Result<String> {
        Ok(format!(
            "{}/relationships/{}",
            self.record_url(identity)?,
            relationship
        ))
    }

    fn request(&self, method: HttpMethod, url: String, body: Option<Value>) -> JsonApiRequest {
        JsonApiRequest {
            method,
            url,
            body,
            timeout: self.timeout,
        }
    }

    /// Build the request for one operation; `None` for operations with no
    /// wire counterpart (key bookkeeping stays local).
    pub fn for_operation(&self, op: &RecordOperation) -> Result<Option<JsonApiRequest>> {
        let request = match op {
            RecordOperation::AddRecord { record } => {
                let document = ResourceDocument::one(self.serializer.serialize_record(record));
                let url = format!("{}/{}", self.base_url, record.kind());
                Some(self.request(
                    HttpMethod::Post,
                    url,
                    Some(serde_json::to_value(document).expect("document serializes")),
                ))
            }
            RecordOperation::UpdateRecord { record } => {
                let document = ResourceDocument::one(self.serializer.serialize_record(record));
                Some(self.request(
                    HttpMethod::Patch,
                    self.record_url(&record.identity)?,
                    Some(serde_json::to_value(document).expect("document serializes")),
                ))
            }
            RecordOperation::RemoveRecord { record } => {
                Some(self.request(HttpMethod::Delete, self.record_url(record)?, None))
            }
            RecordOperation::ReplaceKey { .. } => None,
            RecordOperation::ReplaceAttribute {
                record,
                attribute,
                value,
            } => {
                let mut attributes = serde_json::Map::new();
                attributes.insert(attribute.clone(), value.clone().unwrap_or(Value::Null));
                let body = json!({
                    "data": {
                        "type": record.kind,
                        "id": self.wire_id(record)?,
                        "attributes": attributes,
                    }
                });
                Some(self.request(HttpMethod::Patch, self.record_url(record)?, Some(body)))
            }
            RecordOperation::AddToRelatedRecords {
                record,
                relationship,
                related_record,
            } => {
                let body = json!({
                    "data": [self.serializer.serialize_identity(related_record)],
                });
                Some(self.request(
                    HttpMethod::Post,
                    self.relationship_url(record, relationship)?,
                    Some(body),
                ))
            }
            RecordOperation::RemoveFromRelatedRecords {
                record,
                relationship,
                related_record,
            } => {
                let body = json!({
                    "data": [self.serializer.serialize_identity(related_record)],
                });
                Some(self.request(
                    HttpMethod::Delete,
                    self.relationship_url(record, relationship)?,
                    Some(body),
                ))
            }
            RecordOperation::ReplaceRelatedRecords {
                record,
                relationship,
                related_records,
            } => {
                let identifiers: Vec<_> = related_records
                    .iter()
                    .map(|identity| self.serializer.serialize_identity(identity))
                    .collect();
                Some(self.request(
                    HttpMethod::Patch,
                    self.relationship_url(record, relationship)?,
                    Some(json!({ "data": identifiers })),
                ))
            }
            RecordOperation::ReplaceRelatedRecord {
                record,
                relationship,
                related_record,
            } => {
                let data = related_record
                    .as_ref()
                    .map(|identity| self.serializer.serialize_identity(identity));
                let mut relationships = serde_json::Map::new();
                relationships.insert(relationship.clone(), json!({ "data": data }));
                let body = json!({
                    "data": {
                        "type": record.kind,
                        "id": self.wire_id(record)?,
                        "relationships": relationships,
                    }
                });
                Some(self.request(HttpMethod::Patch, self.record_url(record)?, Some(body)))
            }
        };
        Ok(request)
    }

    pub fn for_expression(&self, expression: &QueryExpression) -> Result<JsonApiRequest> {
        let url = match expression {
            QueryExpression::FindRecord { record } => self.record_url(record)?,
            QueryExpression::FindRecords {
                model,
                records,
                filter,
                sort,
                page,
            } => {
                if records.is_some() {
                    return Err(OrbitError::Assertion(
                        "findRecords by identity is not supported over JSON:API".to_string(),
                    ));
                }
                let model = model.as_ref().ok_or_else(|| {
                    OrbitError::Assertion("findRecords requires a model".to_string())
                })?;
                let mut url = format!("{}/{}", self.base_url, model);
                let mut params: Vec<String> = Vec::new();
                for spec in filter {
                    if spec.op != FilterOp::Equal {
                        return Err(OrbitError::Assertion(
                            "only equality filters are supported over JSON:API".to_string(),
                        ));
                    }
                    let value = match &spec.value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    params.push(format!("filter[{}]={}", spec.attribute, value));
                }
                if !sort.is_empty() {
                    let fields: Vec<String> = sort
                        .iter()
                        .map(|spec| match spec.order {
                            SortOrder::Ascending => spec.attribute.clone(),
                            SortOrder::Descending => format!("-{}", spec.attribute),
                        })
                        .collect();
                    params.push(format!("sort={}", fields.join(",")));
                }
                if let Some(page) = page {
                    params.push(format!("page[offset]={}", page.offset));
                    if let Some(limit) = page.limit {
                        params.push(format!("page[limit]={limit}"));
                    }
                }
                if !params.is_empty() {
                    url = format!("{url}?{}", params.join("&"));
                }
                url
            }
            QueryExpression::FindRelatedRecord {
                record,
                relationship,
            }
            | QueryExpression::FindRelatedRecords {
                record,
                relationship,
                ..
            } => format!("{}/{}", self.record_url(record)?, relationship),
        };
        Ok(self.request(HttpMethod::Get, url, None))
    }
}
