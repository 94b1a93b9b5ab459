//! Broker message aggregation
//!
//! One decoded wire message carries a classifier's whole decision about one
//! alert. It becomes exactly one [`BrokerMessage`] with parallel class and
//! probability sequences, kept in broker order (repeated class ids included),
//! plus one classification row per pair.
//!
//! Every call allocates a fresh message id: a retransmitted message is a new
//! row, never an update of an earlier one.

use chrono::Utc;

use crate::storage::{classification_rows, IdAllocator, StorageError};
use crate::types::{BrokerClassification, BrokerMessage, ClassifierId, DecodedMessage};

/// A message and its rows, ready for one store write.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMessage {
    pub message: BrokerMessage,
    pub rows: Vec<BrokerClassification>,
}

#[derive(Clone)]
pub struct MessageAggregator {
    ids: IdAllocator,
}

impl MessageAggregator {
    pub const fn new(ids: IdAllocator) -> Self {
        Self { ids }
    }

    pub fn aggregate(
        &self,
        decoded: &DecodedMessage,
        classifier_id: ClassifierId,
    ) -> Result<AggregatedMessage, StorageError> {
        let record = &decoded.record;
        let now = Utc::now();

        let (class_id, probability): (Vec<i32>, Vec<f64>) = record
            .classifications
            .iter()
            .map(|c| (c.class_id, c.probability))
            .unzip();

        let message = BrokerMessage {
            broker_message_id: self.ids.next_message_id()?,
            dia_source_id: record.dia_source_id,
            alert_id: record.alert_id,
            classifier_id,
            elasticc_publish_timestamp: record.elasticc_publish_timestamp,
            broker_ingest_timestamp: record.broker_ingest_timestamp,
            msg_hdr_timestamp: decoded.origin.msg_hdr_timestamp,
            desc_ingest_timestamp: now,
            class_id,
            probability,
            modified: now,
        };
        let rows = classification_rows(&message, &self.ids, now)?;

        Ok(AggregatedMessage { message, rows })
    }
}
