//! Classification decoding
//!
//! Turns a [`RawMessage`] into a [`DecodedMessage`]. Every payload is checked
//! against the configured [`SchemaDocument`] first; a mismatch fails closed
//! with [`DecodeError::SchemaMismatch`]. Decode errors are never fatal to the
//! stream: the poll loop logs and skips them.

pub mod schema;
pub mod wire;

pub use schema::{SchemaDocument, SchemaError, BUNDLED_CLASSIFICATION_SCHEMA};
pub use wire::{encode_record, Compression, WireClassification};

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::acquisition::RawMessage;
use crate::types::{ClassificationRecord, DecodedMessage, MessageOrigin};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a valid zstd frame: {0}")]
    Decompress(std::io::Error),

    #[error("payload is not JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload does not match schema {schema}: {reason}")]
    SchemaMismatch { schema: String, reason: String },

    #[error("classification {index} has probability {value} outside [0, 1]")]
    ProbabilityOutOfRange { index: usize, value: f64 },

    #[error("message carries no classifications")]
    EmptyClassifications,

    #[error("field {field} holds an unrepresentable timestamp {value}")]
    Timestamp { field: &'static str, value: i64 },
}

/// Validating decoder bound to one schema version.
#[derive(Debug, Clone)]
pub struct ClassificationDecoder {
    schema: Arc<SchemaDocument>,
}

impl Default for ClassificationDecoder {
    fn default() -> Self {
        Self::new(SchemaDocument::bundled())
    }
}

impl ClassificationDecoder {
    pub fn new(schema: SchemaDocument) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    /// Load the schema from `path`, or use the bundled one when `None`.
    pub fn from_schema_path(path: Option<&Path>) -> Result<Self, SchemaError> {
        match path {
            Some(p) => SchemaDocument::from_path(p).map(Self::new),
            None => Ok(Self::default()),
        }
    }

    pub fn schema(&self) -> &SchemaDocument {
        &self.schema
    }

    pub fn decode(&self, raw: &RawMessage) -> Result<DecodedMessage, DecodeError> {
        let record = self.decode_payload(&raw.payload)?;
        Ok(DecodedMessage {
            origin: MessageOrigin {
                topic: raw.topic.clone(),
                offset: raw.offset,
                msg_hdr_timestamp: raw.timestamp,
            },
            record,
        })
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<ClassificationRecord, DecodeError> {
        let value: serde_json::Value = if wire::is_zstd(payload) {
            let json = zstd::decode_all(payload).map_err(DecodeError::Decompress)?;
            serde_json::from_slice(&json)?
        } else {
            serde_json::from_slice(payload)?
        };

        self.schema
            .validate(&value)
            .map_err(|reason| DecodeError::SchemaMismatch {
                schema: self.schema.to_string(),
                reason,
            })?;

        let wire: WireClassification = serde_json::from_value(value)?;

        if wire.classifications.is_empty() {
            return Err(DecodeError::EmptyClassifications);
        }
        if let Some((index, c)) = wire
            .classifications
            .iter()
            .enumerate()
            .find(|(_, c)| !(0.0..=1.0).contains(&c.probability))
        {
            // NaN fails `contains` as well.
            return Err(DecodeError::ProbabilityOutOfRange {
                index,
                value: c.probability,
            });
        }

        let elasticc_publish_timestamp =
            wire::millis(wire.elasticc_publish_timestamp).ok_or(DecodeError::Timestamp {
                field: "elasticcPublishTimestamp",
                value: wire.elasticc_publish_timestamp,
            })?;
        let broker_ingest_timestamp =
            wire::millis(wire.broker_ingest_timestamp).ok_or(DecodeError::Timestamp {
                field: "brokerIngestTimestamp",
                value: wire.broker_ingest_timestamp,
            })?;

        Ok(ClassificationRecord {
            alert_id: wire.alert_id,
            dia_source_id: wire.dia_source_id,
            elasticc_publish_timestamp,
            broker_ingest_timestamp,
            classifier: wire.classifier(),
            classifications: wire.classifications,
        })
    }
}
