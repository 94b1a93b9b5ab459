//! Wire encoding of brokerClassification records.
//!
//! Payloads are the JSON form of the record, optionally wrapped in a zstd
//! frame. Producers (brokers, the `load` command, tests) use [`encode_record`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClassProbability, ClassificationRecord, ClassifierKey};

/// First four bytes of every zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd(i32),
}

/// The record exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireClassification {
    pub alert_id: i64,
    pub dia_source_id: i64,
    pub elasticc_publish_timestamp: i64,
    pub broker_ingest_timestamp: i64,
    pub broker_name: String,
    pub broker_version: String,
    pub classifier_name: String,
    pub classifier_params: String,
    pub classifications: Vec<ClassProbability>,
}

impl From<&ClassificationRecord> for WireClassification {
    fn from(record: &ClassificationRecord) -> Self {
        Self {
            alert_id: record.alert_id,
            dia_source_id: record.dia_source_id,
            elasticc_publish_timestamp: record.elasticc_publish_timestamp.timestamp_millis(),
            broker_ingest_timestamp: record.broker_ingest_timestamp.timestamp_millis(),
            broker_name: record.classifier.broker_name.clone(),
            broker_version: record.classifier.broker_version.clone(),
            classifier_name: record.classifier.classifier_name.clone(),
            classifier_params: record.classifier.classifier_params.clone(),
            classifications: record.classifications.clone(),
        }
    }
}

impl WireClassification {
    pub(crate) fn classifier(&self) -> ClassifierKey {
        ClassifierKey::new(
            &self.broker_name,
            &self.broker_version,
            &self.classifier_name,
            &self.classifier_params,
        )
    }
}

pub(crate) fn millis(value: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
}

pub fn is_zstd(payload: &[u8]) -> bool {
    payload.starts_with(&ZSTD_MAGIC)
}

/// Encode a record for publishing.
pub fn encode_record(
    record: &ClassificationRecord,
    compression: Compression,
) -> Result<Vec<u8>, std::io::Error> {
    let json = serde_json::to_vec(&WireClassification::from(record))?;
    match compression {
        Compression::None => Ok(json),
        Compression::Zstd(level) => zstd::encode_all(json.as_slice(), level),
    }
}
