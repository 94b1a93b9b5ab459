//! brokerpoll: broker classification ingestion
//!
//! Consumes classification messages published by alert brokers, resolves
//! each classifier to a stable identity, and stores every message together
//! with its per-class probabilities in a partitioned store. Derived views
//! join the stored classifications with the authoritative source tables.
//!
//! ## Architecture
//!
//! - **Acquisition**: durable topic log and consumer-group cursors
//! - **Decode**: schema-validated wire records
//! - **Registry**: classifier identity resolution with a shared cache
//! - **Aggregator**: one broker message plus its classification rows
//! - **Storage**: partitioned classification store, pending sources, source tables
//! - **Views**: previous-source counts (materialized) and source classifications (live)
//! - **Pipeline**: poll loop supervisor with at-least-once commits
//! - **Reconcile**: promotion of pending sources from an alert feed

pub mod acquisition;
pub mod aggregator;
pub mod config;
pub mod decode;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod storage;
pub mod types;
pub mod views;

// Re-export configuration
pub use config::{BrokerpollConfig, ConfigError};

// Re-export commonly used types
pub use types::{
    AlertPacket, BrokerClassification, BrokerMessage, BrokerMessageId, ClassProbability,
    ClassificationRecord, ClassifierId, ClassifierIdentity, ClassifierKey, DecodedMessage,
};

// Re-export pipeline components
pub use acquisition::{MessageSource, RawMessage, SourceError, TopicConsumer, TopicLog};
pub use decode::{ClassificationDecoder, DecodeError};
pub use pipeline::{Ingestor, IngestProgress, MessageOutcome, PipelineError, PollLoop, RunReport, StopReason};
pub use registry::ClassifierRegistry;

// Re-export storage
pub use storage::{open_database, ClassificationStore, Partition, ProcessLock, SourceTables, StorageError};

// Re-export views and reconciliation
pub use reconcile::{reconcile, AlertFeed, AlertIndex, ReconcileError, ReconcileReport};
pub use views::{ViewError, ViewMaintainer, ViewName};
