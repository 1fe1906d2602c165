//! Persistence layer: libSQL-backed storage for dedup records, the publish
//! queue, health state, and shared rate-limit grants.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{PruneReport, Store, Transition};
