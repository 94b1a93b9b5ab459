//! Loop state, stop reasons and progress reporting.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Loop State
// ============================================================================

/// `Idle -> Polling -> Processing -> (Polling | Stopped)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LoopState {
    #[default]
    Idle,
    Polling,
    Processing,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Polling => "POLLING",
            Self::Processing => "PROCESSING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The message quota was reached.
    Quota,
    /// The wall-clock `stop_after` bound elapsed.
    Deadline,
    /// More consecutive empty polls than allowed.
    Quiescent,
    /// Stopped through the cancellation token.
    Cancelled,
    /// A source or storage failure ended the run.
    Failed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Quota => "message quota reached",
            Self::Deadline => "stop-after deadline elapsed",
            Self::Quiescent => "stream quiescent",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// When a run should stop. Unset limits never trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopConditions {
    pub max_messages: Option<u64>,
    pub stop_after: Option<Duration>,
    pub max_empty_polls: Option<u32>,
}

// ============================================================================
// Progress
// ============================================================================

/// Counters published after every batch and on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestProgress {
    pub state: LoopState,
    /// Messages taken off the stream (stored, skipped or dead-lettered).
    pub consumed: u64,
    pub stored: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    pub classifications: u64,
    pub batches: u64,
    pub empty_polls: u32,
    pub stop: Option<StopReason>,
}

impl IngestProgress {
    pub const fn is_stopped(&self) -> bool {
        matches!(self.state, LoopState::Stopped)
    }
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub progress: IngestProgress,
    pub reason: StopReason,
    pub elapsed: Duration,
}

/// Wait until `stored` reaches `count` or the loop stops, whichever comes
/// first. Returns the progress that satisfied the wait.
pub async fn wait_for_stored(
    rx: &mut watch::Receiver<IngestProgress>,
    count: u64,
) -> Result<IngestProgress, watch::error::RecvError> {
    let progress = rx
        .wait_for(|p| p.stored >= count || p.is_stopped())
        .await?;
    Ok(*progress)
}

/// Wait until the loop has stopped.
pub async fn wait_for_stop(
    rx: &mut watch::Receiver<IngestProgress>,
) -> Result<IngestProgress, watch::error::RecvError> {
    let progress = rx.wait_for(IngestProgress::is_stopped).await?;
    Ok(*progress)
}
