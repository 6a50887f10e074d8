//! Ingestion pipeline.
//!
//! Every remote message flows through the same five stages:
//! 1. `ProviderAdapter::fetch_by_id()`: provider-specific I/O
//! 2. `SenderRules`: per-account sender block rules
//! 3. `normalize()`: one plain-text body for every provider
//! 4. `Database::insert_record()`: idempotent on `(account, provider id)`
//! 5. `ClassificationOrchestrator` then `LabelReplicator`
//!
//! `Dispatcher` fans pushes and reconciliation out over a bounded pool of
//! `MessagePipeline` runs.

pub mod alert;
pub mod classifier;
pub mod dispatcher;
pub mod rules;
pub mod runner;
pub mod scheduler;
pub mod types;
pub mod webhook;

pub use dispatcher::Dispatcher;
pub use runner::MessagePipeline;
