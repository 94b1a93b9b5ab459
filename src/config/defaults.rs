//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Source
// ============================================================================

/// Data directory holding the sled database and the process lock.
pub const DATA_DIR: &str = "./data";

/// Topic brokers publish classifications to.
pub const CLASSIFICATION_TOPIC: &str = "classifications";

/// Consumer group used when none is configured.
pub const CONSUMER_GROUP: &str = "brokerpoll";

// ============================================================================
// Poll Loop
// ============================================================================

/// Maximum messages returned by one poll.
pub const POLL_BATCH_SIZE: usize = 100;

/// How long one poll waits for the first message (milliseconds).
pub const POLL_TIMEOUT_MS: u64 = 10_000;

/// Consecutive transient poll failures tolerated before the run fails.
pub const POLL_RETRY_LIMIT: u32 = 3;

/// Attempts for a write failing with a transient backend error before the
/// run stops.
pub const WRITE_ATTEMPTS: u32 = 2;

// ============================================================================
// Derived Views
// ============================================================================

/// Forced photometry only counts once a source is more than this many days
/// after the object's first detection.
pub const FORCED_SOURCE_LAG_DAYS: f64 = 0.5;

/// Recompute attempts when source tables change underneath a refresh.
pub const VIEW_SNAPSHOT_RETRIES: u32 = 3;
