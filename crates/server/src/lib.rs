//! The Recall retrieval service.
//!
//! Ties the storage backends, providers, and indexing pipeline together
//! into a process-wide service with an explicit lifecycle: folder
//! manifest, persisted job queue with a single indexing worker, the
//! query engine, and health snapshots. Transport layers (HTTP, IPC) sit
//! on top of [`RecallServer`]'s operation surface and receive structured
//! failures.

mod error;
pub mod folders;
pub mod health;
pub mod jobs;
pub mod query;
mod server;

pub use error::ServerError;
pub use folders::FolderManager;
pub use health::HealthSnapshot;
pub use jobs::{Job, JobQueue, JobStatus, Worker};
pub use query::{QueryEngine, QueryMode, QueryOutcome, QueryRequest};
pub use server::{EnqueueReceipt, PresetInfo, RecallServer, RemoveOutcome};
