//! Classifier registry
//!
//! Maps a classifier's natural key (broker name, broker version, classifier
//! name, classifier params) to its stable [`ClassifierId`]. The registry is a
//! read-through cache over two trees:
//! - `classifier_by_key`: key [`ClassifierKey::storage_key`], value id (be u64)
//! - `classifier`: key id (be u64), value JSON [`ClassifierIdentity`]
//!
//! A cache miss runs an insert-or-fetch transaction, so concurrent resolvers
//! of the same key (in this process or another registry on the same
//! database) always agree on one id. Identities are never updated or removed.

use chrono::Utc;
use dashmap::DashMap;
use sled::transaction::TransactionResult;
use sled::{Db, Transactional, Tree};
use tracing::{debug, info};

use crate::storage::{abort, flatten, StorageError};
use crate::types::{ClassifierId, ClassifierIdentity, ClassifierKey};

pub(crate) const BY_KEY_TREE: &str = "classifier_by_key";
const IDENTITY_TREE: &str = "classifier";

pub struct ClassifierRegistry {
    db: Db,
    by_key: Tree,
    identities: Tree,
    cache: DashMap<ClassifierKey, ClassifierId>,
}

impl ClassifierRegistry {
    pub fn open(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            by_key: db.open_tree(BY_KEY_TREE)?,
            identities: db.open_tree(IDENTITY_TREE)?,
            cache: DashMap::new(),
        })
    }

    /// Id of the classifier with this natural key, registering it on first
    /// sight.
    pub fn resolve(&self, key: &ClassifierKey) -> Result<ClassifierId, StorageError> {
        if let Some(id) = self.cache.get(key) {
            return Ok(*id);
        }

        let storage_key = key.storage_key();
        let id = match self.by_key.get(&storage_key)? {
            Some(raw) => decode_id(&raw)?,
            None => self.insert_or_fetch(key, storage_key)?,
        };

        // Another thread may have raced us here; both saw the same id.
        Ok(*self.cache.entry(key.clone()).or_insert(id))
    }

    pub fn resolve_parts(
        &self,
        broker_name: &str,
        broker_version: &str,
        classifier_name: &str,
        classifier_params: &str,
    ) -> Result<ClassifierId, StorageError> {
        self.resolve(&ClassifierKey::new(
            broker_name,
            broker_version,
            classifier_name,
            classifier_params,
        ))
    }

    fn insert_or_fetch(
        &self,
        key: &ClassifierKey,
        storage_key: Vec<u8>,
    ) -> Result<ClassifierId, StorageError> {
        // Drawn up front; ids are not dense, so an unused candidate is fine.
        let candidate = ClassifierId(self.db.generate_id()?);
        let identity = ClassifierIdentity {
            classifier_id: candidate,
            key: key.clone(),
            created_at: Utc::now(),
        };
        let identity_value = serde_json::to_vec(&identity)?;

        let result: TransactionResult<(ClassifierId, bool), StorageError> =
            (&self.by_key, &self.identities).transaction(|(by_key, identities)| {
                if let Some(raw) = by_key.get(&storage_key)? {
                    return match decode_id(&raw) {
                        Ok(existing) => Ok((existing, false)),
                        Err(e) => abort(e),
                    };
                }
                by_key.insert(storage_key.clone(), candidate.to_be_bytes().to_vec())?;
                identities.insert(candidate.to_be_bytes().to_vec(), identity_value.clone())?;
                Ok((candidate, true))
            });
        let (id, created) = flatten(result)?;

        if created {
            info!(classifier_id = %id, classifier = %key, "Registered classifier");
        } else {
            debug!(classifier_id = %id, "Classifier registered concurrently, reusing id");
        }
        Ok(id)
    }

    pub fn identity(&self, id: ClassifierId) -> Result<Option<ClassifierIdentity>, StorageError> {
        self.identities
            .get(id.to_be_bytes())?
            .map(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
            .transpose()
    }

    /// All identities in id order.
    pub fn identities(&self) -> Result<Vec<ClassifierIdentity>, StorageError> {
        self.identities
            .iter()
            .values()
            .map(|raw| Ok(serde_json::from_slice(&raw?)?))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of keys currently held in the in-memory cache.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn decode_id(raw: &[u8]) -> Result<ClassifierId, StorageError> {
    ClassifierId::from_be_slice(raw).ok_or_else(|| StorageError::corrupt(BY_KEY_TREE, "short id"))
}
