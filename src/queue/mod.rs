//! Admission gate and publish queue.

pub mod dedup;
pub mod model;
pub mod publish;

pub use dedup::DedupGate;
pub use model::{
    Admission, EnqueueOutcome, EntryId, EntryStatus, Placement, QueueEntry, QueueStats,
};
pub use publish::PublishQueue;
