//! Shared data model for the orbit data framework.
//!
//! Everything here is a plain value type: records and identities, the record
//! operations, transforms and queries with their builders, schema
//! declarations, the response envelope, and the error taxonomy. Behaviour
//! (caches, logs, queues, sources) lives in the sibling crates.

pub mod error;
pub mod operation;
pub mod query;
pub mod record;
pub mod response;
pub mod schema;
pub mod transform;

pub use error::{OrbitError, Result};
pub use operation::RecordOperation;
pub use query::{
    FilterOp, FilterSpec, PageSpec, Query, QueryBuilder, QueryExpression, QueryOrExpressions,
    QueryResult, SortOrder, SortSpec,
};
pub use record::{Record, RecordIdentity, RelationshipData};
pub use response::{FullResponse, NamedResponse, ResponseData, ResponseDetails};
pub use schema::{solar_system_schema, ModelDef, RelationshipDef, RelationshipKind, Schema};
pub use transform::{RequestOptions, Transform, TransformBuilder, TransformOrOperations};
