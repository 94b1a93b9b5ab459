//! Messages whose write was rejected by a constraint.
//!
//! Each entry keeps the raw payload and position, so it can be inspected and
//! republished once the cause is fixed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use super::{u64_from_key, StorageError, DEAD_LETTER_TREE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub topic: String,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DeadLetterLog {
    db: Db,
    tree: Tree,
}

impl DeadLetterLog {
    pub fn open(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            tree: db.open_tree(DEAD_LETTER_TREE)?,
        })
    }

    /// Append an entry; returns its id.
    pub fn record(&self, letter: &DeadLetter) -> Result<u64, StorageError> {
        let id = self.db.generate_id()?;
        self.tree.insert(id.to_be_bytes(), serde_json::to_vec(letter)?)?;
        tracing::error!(
            topic = %letter.topic,
            offset = letter.offset,
            error = %letter.error,
            id,
            "Message dead-lettered"
        );
        Ok(id)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<(u64, DeadLetter)>, StorageError> {
        self.tree
            .iter()
            .map(|item| {
                let (key, value) = item?;
                let id = u64_from_key(&key)
                    .ok_or_else(|| StorageError::corrupt(DEAD_LETTER_TREE, "short key"))?;
                Ok((id, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    pub fn remove(&self, id: u64) -> Result<Option<DeadLetter>, StorageError> {
        self.tree
            .remove(id.to_be_bytes())?
            .map(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
