// ABOUTME: Library root for database-extractor
// ABOUTME: PostgreSQL full-refresh, incremental and CDC extraction engine with resumable checkpoints

pub mod catalog;
pub mod config;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod postgres;
pub mod preflight;
pub mod slot;
pub mod snapshot;
pub mod state;
pub mod utils;
pub mod wal;

pub use error::{Result, SourceError};
pub use orchestrator::{Orchestrator, SourceSeams, StreamStatus, SyncSummary};
