//! Per-message ingestion: decode, resolve, aggregate, write.

use std::sync::Arc;
use tracing::{debug, warn};

use super::PipelineError;
use crate::acquisition::RawMessage;
use crate::aggregator::MessageAggregator;
use crate::config::defaults;
use crate::decode::{ClassificationDecoder, DecodeError};
use crate::registry::ClassifierRegistry;
use crate::storage::{ClassificationStore, DeadLetter, Partition, StorageError};
use crate::types::{BrokerMessageId, ClassifierId};

/// What happened to one message. Only backend failures are errors; every
/// other outcome lets the loop continue.
#[derive(Debug)]
pub enum MessageOutcome {
    Stored {
        broker_message_id: BrokerMessageId,
        classifier_id: ClassifierId,
        rows: usize,
        partition: Partition,
        new_pending_source: bool,
    },
    /// Failed to decode; nothing was written.
    Skipped(DecodeError),
    /// Rejected by a store constraint and recorded in the dead-letter log.
    DeadLettered { error: String },
}

impl MessageOutcome {
    pub const fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Runs one raw message through the whole pipeline.
pub struct Ingestor {
    decoder: ClassificationDecoder,
    registry: Arc<ClassifierRegistry>,
    aggregator: MessageAggregator,
    store: ClassificationStore,
    write_attempts: u32,
}

impl Ingestor {
    pub fn new(
        decoder: ClassificationDecoder,
        registry: Arc<ClassifierRegistry>,
        store: ClassificationStore,
    ) -> Self {
        Self {
            decoder,
            registry,
            aggregator: MessageAggregator::new(store.ids()),
            store,
            write_attempts: defaults::WRITE_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &ClassificationStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClassifierRegistry> {
        &self.registry
    }

    pub fn ingest(&self, raw: &RawMessage) -> Result<MessageOutcome, PipelineError> {
        let decoded = match self.decoder.decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic = %raw.topic, offset = raw.offset, error = %e, "Skipping undecodable message");
                return Ok(MessageOutcome::Skipped(e));
            }
        };

        let result = retry_transient(
            self.write_attempts,
            || {
                let classifier_id = self.registry.resolve(&decoded.record.classifier)?;
                let aggregated = self.aggregator.aggregate(&decoded, classifier_id)?;
                let outcome = self.store.write(&aggregated.message, &aggregated.rows)?;
                Ok((aggregated.message, outcome))
            },
            |attempt, e| {
                warn!(
                    topic = %raw.topic,
                    offset = raw.offset,
                    attempt,
                    error = %e,
                    "Transient write failure, retrying"
                );
            },
        );

        match result {
            Ok((message, outcome)) => {
                debug!(
                    topic = %raw.topic,
                    offset = raw.offset,
                    alert_id = message.alert_id,
                    message_id = %message.broker_message_id,
                    "Ingested message"
                );
                Ok(MessageOutcome::Stored {
                    broker_message_id: message.broker_message_id,
                    classifier_id: message.classifier_id,
                    rows: outcome.rows,
                    partition: outcome.partition,
                    new_pending_source: outcome.new_pending_source,
                })
            }
            Err(e) if e.is_constraint() => self.dead_letter(raw, &e),
            Err(e) => Err(PipelineError::Storage(e)),
        }
    }

    fn dead_letter(
        &self,
        raw: &RawMessage,
        error: &StorageError,
    ) -> Result<MessageOutcome, PipelineError> {
        let letter = DeadLetter {
            topic: raw.topic.clone(),
            offset: raw.offset,
            payload: raw.payload.clone(),
            error: error.to_string(),
            recorded_at: chrono::Utc::now(),
        };
        self.store.dead_letters().record(&letter)?;
        Ok(MessageOutcome::DeadLettered { error: letter.error })
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `attempts` runs are used up.
fn retry_transient<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, StorageError>,
    mut on_retry: impl FnMut(u32, &StorageError),
) -> Result<T, StorageError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Err(e) if e.is_retryable() && attempt < attempts => on_retry(attempt, &e),
            other => return other,
        }
    }
}
