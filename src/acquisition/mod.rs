//! Message acquisition
//!
//! Classification messages arrive on named topics of a durable, append-only
//! topic log. Consumers read through a [`MessageSource`] cursor that belongs
//! to a consumer group; each group keeps its own committed offsets, so
//! independent ingestion paths can drain the same topic without interfering.
//!
//! Delivery is at-least-once: anything read but not committed is delivered
//! again to the next cursor opened for the same group.

pub mod topic_log;

pub use topic_log::{TopicConsumer, TopicLog};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// One undecoded message with its delivery position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub offset: u64,
    /// Time the log accepted the message.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn position(&self) -> TopicOffset {
        TopicOffset {
            topic: self.topic.clone(),
            offset: self.offset,
        }
    }
}

/// A position in one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicOffset {
    pub topic: String,
    pub offset: u64,
}

/// Acquisition errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("topic '{0}' is not subscribed by this consumer")]
    NotSubscribed(String),

    #[error("corrupt log entry at {topic}:{offset}")]
    Corrupt { topic: String, offset: u64 },

    #[error("topic log backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("poll wait aborted: {0}")]
    Wait(String),
}

impl SourceError {
    /// Transient failures a caller may retry by polling again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Wait(_))
    }
}

/// A restartable cursor over one or more topics.
///
/// `poll` and the storage write are the only operations in the pipeline that
/// may block.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for at least one message, then return whatever
    /// is available, at most `max_batch` messages. May return empty.
    async fn poll(
        &mut self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError>;

    /// Mark `offset` (and everything before it in its topic) as processed
    /// for this consumer group.
    fn commit(&mut self, offset: &TopicOffset) -> Result<(), SourceError>;

    /// Rewind this consumer group to the first message of `topic`.
    fn reset_to_start(&mut self, topic: &str) -> Result<(), SourceError>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

fn topic_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,249}$").expect("topic name pattern compiles"))
}

/// Topic names follow the usual broker convention: 1-249 characters of
/// ASCII alphanumerics, `.`, `_` and `-`.
pub fn is_valid_topic_name(name: &str) -> bool {
    topic_name_pattern().is_match(name)
}
