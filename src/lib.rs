//! Deal Relay: deduplicating, rate-limited ingestion-to-delivery pipeline.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod health;
pub mod ingest;
pub mod items;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
