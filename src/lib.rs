//! Per-tenant print job queue for kiln firing requests, served to ePOS
//! receipt printers through their poll webhook.

pub mod api;
pub mod config;
pub mod epos;
pub mod errors;
pub mod hook;
pub mod job;
pub mod photo;
pub mod protocol;
pub mod queue;
pub mod runner;
pub mod sentry_init;
pub mod store;
pub mod supabase_client;
pub mod tasks;
pub mod telemetry;

pub use errors::{QueueError, Result};
pub use hook::CompletionHook;
pub use job::{KilnRequest, QueuedJob};
pub use queue::{QueueManager, RemovalMatch};
pub use runner::{RetryPolicy, RunnerConfig, TaskRunner};
pub use store::{QueueStore, SqliteQueueStore, StoredEntry};
