//! The uniform response envelope returned by request-flow handlers.

use std::collections::HashMap;

use crate::operation::RecordOperation;
use crate::query::QueryResult;
use crate::record::Record;
use crate::transform::Transform;

/// Primary payload of a response.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseData {
    #[default]
    None,
    Record(Option<Record>),
    Records(Vec<Record>),
    /// One entry per query expression, in expression order.
    Results(Vec<QueryResult>),
    Transforms(Vec<Transform>),
}

impl ResponseData {
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            ResponseData::Record(record) => record.as_ref(),
            _ => None,
        }
    }

    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            ResponseData::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn as_results(&self) -> Option<&[QueryResult]> {
        match self {
            ResponseData::Results(results) => Some(results),
            _ => None,
        }
    }
}

/// Source-specific detail attached to a response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseDetails {
    /// Inverse operations in reverse of their forward order, directly
    /// replayable for rollback.
    pub inverse_operations: Vec<RecordOperation>,
    /// Remote response metadata (status, document meta) when a network
    /// source produced this response.
    pub meta: Option<serde_json::Value>,
}

/// The `{data, details, transforms, sources}` envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FullResponse {
    pub data: ResponseData,
    pub details: Option<ResponseDetails>,
    /// Transforms produced as a side effect of this request, in application
    /// order.
    pub transforms: Vec<Transform>,
    /// Per-source responses, populated when `include_sources` is requested.
    pub sources: HashMap<String, FullResponse>,
}

impl FullResponse {
    /// The empty-success envelope used for idempotent re-application.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, data: ResponseData) -> Self {
        self.data = data;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<Transform>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_inverse_operations(mut self, inverse_operations: Vec<RecordOperation>) -> Self {
        self.details
            .get_or_insert_with(ResponseDetails::default)
            .inverse_operations = inverse_operations;
        self
    }
}

/// A listener's contribution to a request: an optional response attributed to
/// a named source. Collected by the `before*` events and handed to the
/// protected handler as hints.
#[derive(Debug, Clone, Default)]
pub struct NamedResponse {
    pub source: Option<String>,
    pub response: FullResponse,
}

impl NamedResponse {
    pub fn from_source(source: impl Into<String>, response: FullResponse) -> Self {
        Self {
            source: Some(source.into()),
            response,
        }
    }
}
