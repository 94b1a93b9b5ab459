//! Ingestion pipeline
//!
//! ```text
//! topic log --poll--> decode --> resolve classifier --> aggregate --> store write
//!                       |                                                 |
//!                    skipped                                     dead letter on
//!                                                              constraint violation
//! ```
//!
//! Messages are processed strictly in delivery order, one at a time. The
//! offset of a message is committed only once its write is durable, which
//! gives at-least-once ingestion across restarts.

mod state;
pub mod ingest;
pub mod poll_loop;

pub use ingest::{Ingestor, MessageOutcome};
pub use poll_loop::{FnHook, MessageHook, PollLoop};
pub use state::*;

use thiserror::Error;

use crate::acquisition::SourceError;
use crate::storage::StorageError;

/// Failures that end a run. Per-message problems are outcomes, not errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("message source failed: {0}")]
    Source(#[from] SourceError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("ingest task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
