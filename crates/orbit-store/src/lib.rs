//! Durable adapters for orbit.
//!
//! The object-store abstraction plus two implementations (in-memory, file
//! backed), the async record cache that reuses the core operator semantics
//! over a store, a file-backed bucket for queue/log persistence, and the
//! persistent source composing it all with the request protocol.

pub mod async_cache;
pub mod file_store;
pub mod object_store;
pub mod source;

pub use async_cache::{
    record_key, AsyncRecordCache, DEFAULT_DB_NAME, INVERSE_RELATIONSHIPS_STORE, RECORDS_STORE,
};
pub use file_store::{FileObjectStore, JsonBucket};
pub use object_store::{MemoryObjectStore, ObjectStore, WriteOp};
pub use source::PersistentSource;
