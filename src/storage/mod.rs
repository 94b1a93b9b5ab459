//! Durable storage on sled.
//!
//! One sled database holds every table; each table (and each classification
//! partition) is its own tree, and every multi-table change is a single
//! multi-tree transaction, so a reader never sees half a write.

pub mod classifications;
pub mod dead_letter;
pub mod lockfile;
pub mod sources;

pub use classifications::{
    classification_rows, ClassificationStore, IdAllocator, Partition, StoreStats, WriteOutcome,
};
pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use lockfile::{LockError, ProcessLock};
pub use sources::SourceTables;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Tree names
// ============================================================================

pub(crate) const MESSAGES_TREE: &str = "brokermessage";
pub(crate) const BY_MESSAGE_TREE: &str = "brokerclassification_by_message";
pub(crate) const DEFAULT_PARTITION_TREE: &str = "brokerclassification_default";
pub(crate) const PARTITIONS_TREE: &str = "brokerclassification_partitions";
pub(crate) const PENDING_TREE: &str = "brokersourceids";
pub(crate) const DEAD_LETTER_TREE: &str = "dead_letters";

pub(crate) const OBJECT_TREE: &str = "diaobject";
pub(crate) const SOURCE_TREE: &str = "diasource";
pub(crate) const FORCED_TREE: &str = "diaforcedsource";
pub(crate) const ALERT_TREE: &str = "diaalert";
pub(crate) const TRUTH_TREE: &str = "diaobjecttruth";
pub(crate) const GENTYPE_TREE: &str = "gentypeofclassid";
pub(crate) const SOURCE_BY_OBJECT_TREE: &str = "diasource_by_object";
pub(crate) const FORCED_BY_OBJECT_TREE: &str = "diaforcedsource_by_object";
pub(crate) const META_TREE: &str = "meta";

/// Key in [`META_TREE`] bumped by every change to source or forced-source rows.
pub(crate) const SOURCE_GENERATION_KEY: &[u8] = b"source_generation";

// ============================================================================
// Errors
// ============================================================================

/// A write rejected by a table constraint. Retrying the same write fails the
/// same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintViolation {
    #[error("duplicate key {key} in {table}")]
    Unique { table: &'static str, key: String },

    #[error("{table} row {key} references missing {references}")]
    ForeignKey {
        table: &'static str,
        key: String,
        references: String,
    },

    #[error("brokermessage {0} has {1} class ids but {2} probabilities")]
    Misaligned(String, usize, usize),

    #[error("classification {key} has probability {value} outside [0, 1]")]
    ProbabilityRange { key: String, value: String },

    #[error("classification {key} belongs to classifier {row} but message is from classifier {message}")]
    PartitionKey {
        key: String,
        row: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintViolation),

    #[error("corrupt record in {tree}: {detail}")]
    Corrupt { tree: String, detail: String },

    #[error("partition layout changed for classifier {0} during the write")]
    PartitionMoved(crate::types::ClassifierId),
}

impl StorageError {
    /// Transient failures that may succeed on redelivery.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::PartitionMoved(_))
    }

    pub const fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }

    pub(crate) fn corrupt(tree: &str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            tree: tree.to_string(),
            detail: detail.into(),
        }
    }
}

pub(crate) fn abort<T>(e: impl Into<StorageError>) -> Result<T, ConflictableTransactionError<StorageError>> {
    Err(ConflictableTransactionError::Abort(e.into()))
}

pub(crate) fn flatten<T>(result: TransactionResult<T, StorageError>) -> Result<T, StorageError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::Backend(e),
    })
}

/// Open (or create) the database under `data_dir`.
pub fn open_database(data_dir: impl AsRef<Path>) -> Result<sled::Db, StorageError> {
    let path = data_dir.as_ref().join("brokerpoll.db");
    let db = sled::open(&path)?;
    tracing::info!(path = %path.display(), recovered = db.was_recovered(), "Database opened");
    Ok(db)
}

pub(crate) fn u64_from_key(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn i64_key(value: i64) -> [u8; 8] {
    // Flip the sign bit so negative ids sort before positive ones.
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn i64_from_key(bytes: &[u8]) -> Option<i64> {
    Some((u64_from_key(bytes)? ^ (1 << 63)) as i64)
}
