//! Substrate shared by every orbit source: the event emitter, the per-source
//! task queue, the append-only transform log, and the persistence bucket
//! abstraction. No record semantics live here; this crate only knows how to
//! order, gate and remember work.

pub mod bucket;
pub mod emitter;
pub mod task_queue;
pub mod transform_log;

pub use bucket::{Bucket, MemoryBucket};
pub use emitter::{Emitter, ListenerId};
pub use task_queue::{FailurePolicy, Performer, TaskQueue};
pub use transform_log::{log_events, LogEvent, TransformLog};
