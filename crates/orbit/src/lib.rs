//! orbit: a client-side data framework.
//!
//! Sources (an in-memory store, a remote JSON:API server, a durable
//! key-value cache) are composed and kept in sync through an immutable,
//! append-only log of data-mutating transforms. This crate carries the core:
//! the operation-sourced record cache with its inverse-relationship index,
//! the query engine, operation coalescing, and the source base with the
//! fork / merge / rebase protocol on top of the in-memory source.

pub mod cache;
pub mod coalesce;
pub mod source;

pub use cache::{CacheState, InverseRelationship, KeyMap, PatchResult, RecordCache};
pub use coalesce::coalesce_operations;
pub use source::memory::{MemorySource, MergeOptions};
pub use source::{
    enqueue_query_request, enqueue_transform_request, perform_query_request,
    perform_transform_request, source_events, transformed, Pullable, Pushable, QueryKind,
    Queryable, Request, Source, SourceCore, SourceEvent, Syncable, TransformKind, Updatable,
};

pub use orbit_api as api;
pub use orbit_core::{Bucket, Emitter, FailurePolicy, MemoryBucket, TaskQueue, TransformLog};
