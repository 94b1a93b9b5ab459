//! Decoded classification records, before classifier identity resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::{AlertId, DiaSourceId};
use super::broker::ClassifierKey;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassProbability {
    pub class_id: i32,
    pub probability: f64,
}

/// A validated brokerClassification record.
///
/// `classifications` keeps the broker's order, including repeated class ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRecord {
    pub alert_id: AlertId,
    pub dia_source_id: DiaSourceId,
    pub elasticc_publish_timestamp: DateTime<Utc>,
    pub broker_ingest_timestamp: DateTime<Utc>,
    pub classifier: ClassifierKey,
    pub classifications: Vec<ClassProbability>,
}

/// Where a raw message came from in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOrigin {
    pub topic: String,
    pub offset: u64,
    pub msg_hdr_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub origin: MessageOrigin,
    pub record: ClassificationRecord,
}
