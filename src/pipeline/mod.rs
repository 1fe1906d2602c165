//! Ingestion-to-delivery pipeline.
//!
//! Every candidate item flows through:
//! 1. `ItemSource::next_batch()` or `POST /api/ingest`: collaborator I/O
//! 2. `Pipeline::ingest()`: health gate, then per-item admission
//! 3. `PublishQueue`: durable, bounded, priority/time ordered
//! 4. `Pipeline::next_ready()`: health gate and rate slots
//! 5. `Publisher::publish()` and `Pipeline::report_outcome()`
//!
//! **An item is admitted at most once.** Retries create follow-up queue
//! entries for the same item, never a second admission.

pub mod coordinator;
pub mod status;
pub mod types;
pub mod workers;

pub use coordinator::Pipeline;
pub use status::{CounterSnapshot, PipelineCounters, PipelineStatus};
pub use types::{Dispatch, DispatchResult, Halt, IngestReport, ReadyItem};
