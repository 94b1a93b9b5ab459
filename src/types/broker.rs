//! Broker-side entities: who classified, what they said, and where it is stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::alert::{AlertId, DiaSourceId};

macro_rules! surrogate_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Big-endian key bytes; sorts in id order inside sled.
            pub const fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
                Some(Self(u64::from_be_bytes(arr)))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

surrogate_id!(
    /// Stable surrogate id of a classifier, assigned once on first sight.
    ClassifierId
);
surrogate_id!(
    /// Surrogate id of one stored broker message.
    BrokerMessageId
);
surrogate_id!(
    /// Local id of a classification row. Only unique together with its
    /// [`ClassifierId`]; see [`ClassificationKey`].
    ClassificationId
);

/// The natural key of a classifier.
///
/// Two messages resolve to the same [`ClassifierId`] exactly when all four
/// fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierKey {
    pub broker_name: String,
    pub broker_version: String,
    pub classifier_name: String,
    pub classifier_params: String,
}

impl ClassifierKey {
    pub fn new(
        broker_name: impl Into<String>,
        broker_version: impl Into<String>,
        classifier_name: impl Into<String>,
        classifier_params: impl Into<String>,
    ) -> Self {
        Self {
            broker_name: broker_name.into(),
            broker_version: broker_version.into(),
            classifier_name: classifier_name.into(),
            classifier_params: classifier_params.into(),
        }
    }

    /// Unambiguous byte encoding used as the uniqueness key.
    ///
    /// Each field is length-prefixed, so `("ab", "c")` and `("a", "bc")`
    /// never collide.
    pub fn storage_key(&self) -> Vec<u8> {
        let fields = [
            &self.broker_name,
            &self.broker_version,
            &self.classifier_name,
            &self.classifier_params,
        ];
        let mut out = Vec::with_capacity(fields.iter().map(|f| f.len() + 4).sum());
        for field in fields {
            // Field lengths are bounded by message size; u32 is ample.
            #[allow(clippy::cast_possible_truncation)]
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out
    }
}

impl fmt::Display for ClassifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} / {} [{}]",
            self.broker_name, self.broker_version, self.classifier_name, self.classifier_params
        )
    }
}

/// A registered classifier. Never mutated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierIdentity {
    pub classifier_id: ClassifierId,
    #[serde(flatten)]
    pub key: ClassifierKey,
    pub created_at: DateTime<Utc>,
}

/// One classifier decision about one alert, as delivered by a broker.
///
/// `class_id` and `probability` are parallel sequences in broker order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    pub broker_message_id: BrokerMessageId,
    pub dia_source_id: DiaSourceId,
    pub alert_id: AlertId,
    pub classifier_id: ClassifierId,
    pub elasticc_publish_timestamp: DateTime<Utc>,
    pub broker_ingest_timestamp: DateTime<Utc>,
    /// Timestamp carried by the transport envelope, when it had one.
    pub msg_hdr_timestamp: Option<DateTime<Utc>>,
    /// When this pipeline wrote the message.
    pub desc_ingest_timestamp: DateTime<Utc>,
    pub class_id: Vec<i32>,
    pub probability: Vec<f64>,
    pub modified: DateTime<Utc>,
}

impl BrokerMessage {
    /// Number of class/probability pairs.
    pub fn len(&self) -> usize {
        self.class_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_id.is_empty()
    }

    /// Parallel arrays are the same length.
    pub fn is_aligned(&self) -> bool {
        self.class_id.len() == self.probability.len()
    }
}

/// Composite identity of a classification row under partitioning.
///
/// The partition key leads, so every row of one classifier is contiguous
/// and a partition can be scanned by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationKey {
    pub classifier_id: ClassifierId,
    pub classification_id: ClassificationId,
}

impl ClassificationKey {
    pub const fn new(classifier_id: ClassifierId, classification_id: ClassificationId) -> Self {
        Self {
            classifier_id,
            classification_id,
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.classifier_id.to_be_bytes());
        out[8..].copy_from_slice(&self.classification_id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        Some(Self {
            classifier_id: ClassifierId::from_be_slice(&bytes[..8])?,
            classification_id: ClassificationId::from_be_slice(&bytes[8..])?,
        })
    }
}

/// One class/probability row, stored in its classifier's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClassification {
    #[serde(flatten)]
    pub key: ClassificationKey,
    pub class_id: i32,
    pub probability: f64,
    pub modified: DateTime<Utc>,
    pub broker_message_id: Option<BrokerMessageId>,
}
