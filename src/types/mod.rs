//! Data model shared by every stage of the ingestion pipeline.
//!
//! - [`broker`]: classifier identities, broker messages and the partitioned
//!   per-class classification rows.
//! - [`classification`]: decoded wire records, before identity resolution.
//! - [`alert`]: the astronomical source/object tables consumed read-only by
//!   the derived views and written only by reconciliation.

pub mod alert;
pub mod broker;
pub mod classification;

pub use alert::{
    AlertPacket, DiaAlert, DiaForcedSource, DiaForcedSourceId, DiaObject, DiaObjectId,
    DiaObjectTruth, DiaSource, DiaSourceId, AlertId, GentypeOfClassId,
};
pub use broker::{
    BrokerClassification, BrokerMessage, BrokerMessageId, ClassificationId, ClassificationKey,
    ClassifierId, ClassifierIdentity, ClassifierKey,
};
pub use classification::{ClassProbability, ClassificationRecord, DecodedMessage, MessageOrigin};
