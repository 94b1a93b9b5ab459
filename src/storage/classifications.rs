//! Partitioned classification store.
//!
//! Layout:
//! - `brokermessage`: key message id (be u64), value JSON [`BrokerMessage`]
//! - `brokerclassification_p{id}`: one tree per dedicated classifier partition
//! - `brokerclassification_default`: rows of every other classifier
//! - `brokerclassification_by_message`: key `message id ++ ClassificationKey`
//! - `brokerclassification_partitions`: classifier ids with a dedicated tree
//! - `brokersourceids`: pending diaSourceIds awaiting reconciliation
//!
//! Row keys are [`ClassificationKey`]s (classifier id first), so uniqueness
//! is enforced on the composite key and a classifier's rows are one prefix.

use chrono::{DateTime, Utc};
use sled::transaction::TransactionResult;
use sled::{Db, Transactional, Tree};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::{
    abort, flatten, i64_from_key, i64_key, ConstraintViolation, DeadLetterLog, StorageError,
    BY_MESSAGE_TREE, DEFAULT_PARTITION_TREE, MESSAGES_TREE, PARTITIONS_TREE, PENDING_TREE,
    SOURCE_TREE,
};
use crate::types::{
    BrokerClassification, BrokerMessage, BrokerMessageId, ClassificationId, ClassificationKey,
    ClassifierId, DiaSourceId,
};

/// Write attempts when the partition layout changes underneath a write.
const ROUTE_ATTEMPTS: u32 = 3;

/// Physical location of a classification row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    Dedicated(ClassifierId),
    Default,
}

impl Partition {
    pub fn tree_name(self) -> String {
        match self {
            Self::Dedicated(id) => format!("brokerclassification_p{id}"),
            Self::Default => DEFAULT_PARTITION_TREE.to_string(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tree_name())
    }
}

/// Hands out surrogate ids. Ids are unique and increasing per database, not
/// dense.
#[derive(Clone)]
pub struct IdAllocator {
    db: Db,
}

impl IdAllocator {
    pub fn new(db: &Db) -> Self {
        Self { db: db.clone() }
    }

    pub fn next_message_id(&self) -> Result<BrokerMessageId, StorageError> {
        Ok(BrokerMessageId(self.db.generate_id()?))
    }

    pub fn next_classification_id(&self) -> Result<ClassificationId, StorageError> {
        Ok(ClassificationId(self.db.generate_id()?))
    }
}

/// What one successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub partition: Partition,
    pub rows: usize,
    /// The message's source entered the pending set with this write.
    pub new_pending_source: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub messages: usize,
    pub classifications: usize,
    pub partitions: Vec<(Partition, usize)>,
    pub pending_sources: usize,
    pub dead_letters: usize,
}

#[derive(Clone)]
pub struct ClassificationStore {
    db: Db,
    messages: Tree,
    by_message: Tree,
    default_partition: Tree,
    partition_index: Tree,
    pending: Tree,
    sources: Tree,
    /// Cache of dedicated partitions. `partition_index` is authoritative: the
    /// cache is re-synced before use and every write re-checks its route
    /// inside the transaction, so handles opened on the same database agree.
    partitions: Arc<RwLock<BTreeMap<ClassifierId, Tree>>>,
    dead_letters: DeadLetterLog,
}

impl ClassificationStore {
    /// Open the store and make sure every classifier in `partitions` has a
    /// dedicated partition.
    pub fn open(db: &Db, partitions: &[ClassifierId]) -> Result<Self, StorageError> {
        let store = Self {
            db: db.clone(),
            messages: db.open_tree(MESSAGES_TREE)?,
            by_message: db.open_tree(BY_MESSAGE_TREE)?,
            default_partition: db.open_tree(DEFAULT_PARTITION_TREE)?,
            partition_index: db.open_tree(PARTITIONS_TREE)?,
            pending: db.open_tree(PENDING_TREE)?,
            sources: db.open_tree(SOURCE_TREE)?,
            partitions: Arc::new(RwLock::new(BTreeMap::new())),
            dead_letters: DeadLetterLog::open(db)?,
        };
        store.sync_partitions()?;

        for &id in partitions {
            store.create_partition(id)?;
        }

        Ok(store)
    }

    pub fn ids(&self) -> IdAllocator {
        IdAllocator::new(&self.db)
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    /// Pick up partitions attached through another handle. The index only
    /// ever grows, so a length match means the cache is current.
    fn sync_partitions(&self) -> Result<(), StorageError> {
        let known = self.partition_index.len();
        if self.partitions.read().unwrap_or_else(PoisonError::into_inner).len() == known {
            return Ok(());
        }

        let mut guard = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        for key in self.partition_index.iter().keys() {
            let key = key?;
            let id = ClassifierId::from_be_slice(&key)
                .ok_or_else(|| StorageError::corrupt(PARTITIONS_TREE, "short key"))?;
            if !guard.contains_key(&id) {
                let tree = self.db.open_tree(Partition::Dedicated(id).tree_name())?;
                guard.insert(id, tree);
            }
        }
        Ok(())
    }

    /// Synced read view of the partition cache. Infallible readers fall back
    /// to the cached map when the index cannot be read.
    fn partition_map(&self) -> RwLockReadGuard<'_, BTreeMap<ClassifierId, Tree>> {
        if let Err(e) = self.sync_partitions() {
            warn!(error = %e, "Could not sync partition index, using cached partitions");
        }
        self.partitions.read().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist `message` and its classification rows atomically.
    ///
    /// Rows are inserted before the message; their reference to it is only
    /// checked once everything is staged, so the order inside the unit does
    /// not matter. Any violation aborts the whole unit. The route is checked
    /// against the partition index in the same transaction, so a partition
    /// attached through another handle is never bypassed.
    pub fn write(
        &self,
        message: &BrokerMessage,
        rows: &[BrokerClassification],
    ) -> Result<WriteOutcome, StorageError> {
        check_message(message, rows)?;

        let message_key = message.broker_message_id.to_be_bytes().to_vec();
        let message_value = serde_json::to_vec(message)?;
        let staged = rows
            .iter()
            .map(|row| Ok((row.key, serde_json::to_vec(row)?, row.broker_message_id)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let source_key = i64_key(message.dia_source_id).to_vec();
        let classifier_key = message.classifier_id.to_be_bytes().to_vec();

        let mut attempt = 0;
        let (partition, new_pending_source) = loop {
            attempt += 1;
            self.sync_partitions()?;
            let guard = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
            let (partition, tree) = match guard.get(&message.classifier_id) {
                Some(tree) => (Partition::Dedicated(message.classifier_id), tree),
                None => (Partition::Default, &self.default_partition),
            };

            // Rows are staged before the message; the reference check runs
            // once everything is in place.
            let result: TransactionResult<bool, StorageError> = (
                tree,
                &self.messages,
                &self.by_message,
                &self.pending,
                &self.sources,
                &self.partition_index,
            )
                .transaction(|(part, messages, by_message, pending, sources, index)| {
                    let dedicated = index.get(&classifier_key)?.is_some();
                    if dedicated != matches!(partition, Partition::Dedicated(_)) {
                        return abort(StorageError::PartitionMoved(message.classifier_id));
                    }

                    for (key, value, reference) in &staged {
                        let row_key = key.to_bytes().to_vec();
                        if part.get(&row_key)?.is_some() {
                            return abort(ConstraintViolation::Unique {
                                table: "brokerclassification",
                                key: key_label(*key),
                            });
                        }
                        part.insert(row_key, value.clone())?;
                        if let Some(reference) = reference {
                            by_message.insert(index_key(*reference, *key), Vec::new())?;
                        }
                    }

                    if messages.get(&message_key)?.is_some() {
                        return abort(ConstraintViolation::Unique {
                            table: "brokermessage",
                            key: message.broker_message_id.to_string(),
                        });
                    }
                    messages.insert(message_key.clone(), message_value.clone())?;

                    for (key, _, reference) in &staged {
                        if let Some(reference) = reference {
                            if messages.get(reference.to_be_bytes())?.is_none() {
                                return abort(ConstraintViolation::ForeignKey {
                                    table: "brokerclassification",
                                    key: key_label(*key),
                                    references: format!("brokermessage {reference}"),
                                });
                            }
                        }
                    }

                    let first_sight = sources.get(&source_key)?.is_none()
                        && pending.get(&source_key)?.is_none();
                    if first_sight {
                        pending.insert(source_key.clone(), Vec::new())?;
                    }
                    Ok(first_sight)
                });
            drop(guard);

            match flatten(result) {
                Ok(first_sight) => break (partition, first_sight),
                Err(StorageError::PartitionMoved(id)) if attempt < ROUTE_ATTEMPTS => {
                    debug!(classifier_id = %id, attempt, "Partition attached elsewhere, re-routing");
                }
                Err(e) => return Err(e),
            }
        };

        debug!(
            message_id = %message.broker_message_id,
            classifier_id = %message.classifier_id,
            rows = rows.len(),
            partition = %partition,
            "Stored broker message"
        );

        Ok(WriteOutcome {
            partition,
            rows: rows.len(),
            new_pending_source,
        })
    }

    /// Give `classifier_id` a dedicated partition, moving its existing rows
    /// out of the default partition. Returns the number of rows moved; a
    /// classifier that already has a partition is left alone.
    ///
    /// The first pass moves rows and records the partition in one
    /// transaction. Later passes sweep rows that a writer routed to the
    /// default partition before the index entry was visible to it.
    pub fn create_partition(&self, classifier_id: ClassifierId) -> Result<usize, StorageError> {
        self.sync_partitions()?;
        let mut guard = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(&classifier_id) {
            return Ok(0);
        }

        let partition = Partition::Dedicated(classifier_id);
        let tree = self.db.open_tree(partition.tree_name())?;
        let index_key = classifier_id.to_be_bytes().to_vec();

        let mut moved = 0;
        let mut attached = false;
        loop {
            let moving = self
                .default_partition
                .scan_prefix(classifier_id.to_be_bytes())
                .keys()
                .collect::<Result<Vec<_>, _>>()?;
            if attached && moving.is_empty() {
                break;
            }

            let result: TransactionResult<usize, StorageError> =
                (&self.default_partition, &tree, &self.partition_index).transaction(
                    |(default, dedicated, index)| {
                        let mut n = 0;
                        for key in &moving {
                            if let Some(value) = default.remove(key)? {
                                dedicated.insert(key, value)?;
                                n += 1;
                            }
                        }
                        index.insert(index_key.clone(), Vec::new())?;
                        Ok(n)
                    },
                );
            moved += flatten(result)?;
            attached = true;
        }

        guard.insert(classifier_id, tree);
        info!(
            classifier_id = %classifier_id,
            moved,
            partition = %partition,
            "Partition attached"
        );
        Ok(moved)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Classifiers that have a dedicated partition.
    pub fn partitions(&self) -> Vec<ClassifierId> {
        self.partition_map().keys().copied().collect()
    }

    /// Where the row identified by `key` physically lives, if it exists.
    pub fn partition_of(&self, key: ClassificationKey) -> Result<Option<Partition>, StorageError> {
        let raw = key.to_bytes();
        let guard = self.partition_map();
        for (&id, tree) in guard.iter() {
            if tree.contains_key(raw)? {
                return Ok(Some(Partition::Dedicated(id)));
            }
        }
        if self.default_partition.contains_key(raw)? {
            return Ok(Some(Partition::Default));
        }
        Ok(None)
    }

    pub fn message(&self, id: BrokerMessageId) -> Result<Option<BrokerMessage>, StorageError> {
        self.messages
            .get(id.to_be_bytes())?
            .map(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
            .transpose()
    }

    /// Every stored message in id order.
    pub fn messages(&self) -> Result<Vec<BrokerMessage>, StorageError> {
        self.messages
            .iter()
            .values()
            .map(|raw| Ok(serde_json::from_slice(&raw?)?))
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Rows of one message, in classification-key order.
    pub fn classifications_for(
        &self,
        message_id: BrokerMessageId,
    ) -> Result<Vec<BrokerClassification>, StorageError> {
        let guard = self.partition_map();
        let mut out = Vec::new();
        for key in self.by_message.scan_prefix(message_id.to_be_bytes()).keys() {
            let key = key?;
            let row_key = key
                .get(8..)
                .and_then(ClassificationKey::from_bytes)
                .ok_or_else(|| StorageError::corrupt(BY_MESSAGE_TREE, "bad index key"))?;
            let tree = guard
                .get(&row_key.classifier_id)
                .unwrap_or(&self.default_partition);
            let raw = tree.get(row_key.to_bytes())?.ok_or_else(|| {
                StorageError::corrupt(BY_MESSAGE_TREE, format!("dangling {}", key_label(row_key)))
            })?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Rows of one classifier.
    pub fn classifications_of(
        &self,
        classifier_id: ClassifierId,
    ) -> Result<Vec<BrokerClassification>, StorageError> {
        let guard = self.partition_map();
        let tree = guard.get(&classifier_id).unwrap_or(&self.default_partition);
        tree.scan_prefix(classifier_id.to_be_bytes())
            .values()
            .map(|raw| Ok(serde_json::from_slice(&raw?)?))
            .collect()
    }

    /// Every row across all partitions, in classification-key order.
    pub fn classifications(&self) -> Result<Vec<BrokerClassification>, StorageError> {
        let guard = self.partition_map();
        let mut out: Vec<BrokerClassification> = Vec::new();
        for tree in guard.values().chain(std::iter::once(&self.default_partition)) {
            for raw in tree.iter().values() {
                out.push(serde_json::from_slice(&raw?)?);
            }
        }
        out.sort_by_key(|row| row.key);
        Ok(out)
    }

    pub fn classification_count(&self) -> usize {
        self.partition_counts().iter().map(|(_, n)| n).sum()
    }

    pub fn partition_counts(&self) -> Vec<(Partition, usize)> {
        let guard = self.partition_map();
        guard
            .iter()
            .map(|(&id, tree)| (Partition::Dedicated(id), tree.len()))
            .chain(std::iter::once((Partition::Default, self.default_partition.len())))
            .collect()
    }

    /// Sources seen in a classification but not yet reconciled.
    pub fn pending_sources(&self) -> Result<Vec<DiaSourceId>, StorageError> {
        self.pending
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                i64_from_key(&key).ok_or_else(|| StorageError::corrupt(PENDING_TREE, "short key"))
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> StoreStats {
        let partitions = self.partition_counts();
        StoreStats {
            messages: self.message_count(),
            classifications: partitions.iter().map(|(_, n)| n).sum(),
            partitions,
            pending_sources: self.pending_count(),
            dead_letters: self.dead_letters.len(),
        }
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Build the rows for a message, one per class/probability pair, in order.
pub fn classification_rows(
    message: &BrokerMessage,
    ids: &IdAllocator,
    modified: DateTime<Utc>,
) -> Result<Vec<BrokerClassification>, StorageError> {
    message
        .class_id
        .iter()
        .zip(&message.probability)
        .map(|(&class_id, &probability)| {
            Ok(BrokerClassification {
                key: ClassificationKey::new(message.classifier_id, ids.next_classification_id()?),
                class_id,
                probability,
                modified,
                broker_message_id: Some(message.broker_message_id),
            })
        })
        .collect()
}

fn check_message(
    message: &BrokerMessage,
    rows: &[BrokerClassification],
) -> Result<(), ConstraintViolation> {
    if !message.is_aligned() {
        return Err(ConstraintViolation::Misaligned(
            message.broker_message_id.to_string(),
            message.class_id.len(),
            message.probability.len(),
        ));
    }
    for row in rows {
        if row.key.classifier_id != message.classifier_id {
            return Err(ConstraintViolation::PartitionKey {
                key: key_label(row.key),
                row: row.key.classifier_id.to_string(),
                message: message.classifier_id.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&row.probability) {
            return Err(ConstraintViolation::ProbabilityRange {
                key: key_label(row.key),
                value: row.probability.to_string(),
            });
        }
    }
    Ok(())
}

fn index_key(message_id: BrokerMessageId, key: ClassificationKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&message_id.to_be_bytes());
    out.extend_from_slice(&key.to_bytes());
    out
}

fn key_label(key: ClassificationKey) -> String {
    format!("({}, {})", key.classifier_id, key.classification_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(partitions: &[u64]) -> (tempfile::TempDir, Db, ClassificationStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let ids: Vec<ClassifierId> = partitions.iter().copied().map(ClassifierId).collect();
        let store = ClassificationStore::open(&db, &ids).unwrap();
        (dir, db, store)
    }

    fn message(store: &ClassificationStore, classifier: u64, source: i64, probs: &[(i32, f64)]) -> BrokerMessage {
        let now = Utc::now();
        BrokerMessage {
            broker_message_id: store.ids().next_message_id().unwrap(),
            dia_source_id: source,
            alert_id: source * 10,
            classifier_id: ClassifierId(classifier),
            elasticc_publish_timestamp: now,
            broker_ingest_timestamp: now,
            msg_hdr_timestamp: None,
            desc_ingest_timestamp: now,
            class_id: probs.iter().map(|p| p.0).collect(),
            probability: probs.iter().map(|p| p.1).collect(),
            modified: now,
        }
    }

    fn write(store: &ClassificationStore, msg: &BrokerMessage) -> WriteOutcome {
        let rows = classification_rows(msg, &store.ids(), Utc::now()).unwrap();
        store.write(msg, &rows).unwrap()
    }

    #[test]
    fn test_write_routes_to_partition() {
        let (_dir, _db, store) = open(&[7]);

        let a = message(&store, 7, 1, &[(2222, 0.7), (2223, 0.3)]);
        let b = message(&store, 9, 2, &[(2222, 1.0)]);
        assert_eq!(write(&store, &a).partition, Partition::Dedicated(ClassifierId(7)));
        assert_eq!(write(&store, &b).partition, Partition::Default);

        assert_eq!(store.message_count(), 2);
        assert_eq!(store.classification_count(), 3);
        for row in store.classifications().unwrap() {
            let expected = if row.key.classifier_id == ClassifierId(7) {
                Partition::Dedicated(ClassifierId(7))
            } else {
                Partition::Default
            };
            assert_eq!(store.partition_of(row.key).unwrap(), Some(expected));
        }
    }

    #[test]
    fn test_rows_follow_message_order() {
        let (_dir, _db, store) = open(&[]);
        let msg = message(&store, 1, 1, &[(5, 0.1), (3, 0.2), (5, 0.7)]);
        write(&store, &msg);

        let rows = store.classifications_for(msg.broker_message_id).unwrap();
        let pairs: Vec<(i32, f64)> = rows.iter().map(|r| (r.class_id, r.probability)).collect();
        assert_eq!(pairs, vec![(5, 0.1), (3, 0.2), (5, 0.7)]);
        assert_eq!(store.message(msg.broker_message_id).unwrap(), Some(msg));
    }

    #[test]
    fn test_duplicate_row_key_rolls_back() {
        let (_dir, _db, store) = open(&[]);
        let first = message(&store, 1, 1, &[(1, 1.0)]);
        let rows = classification_rows(&first, &store.ids(), Utc::now()).unwrap();
        store.write(&first, &rows).unwrap();

        // A second message reusing the first row's composite key.
        let second = message(&store, 1, 2, &[(1, 1.0)]);
        let mut dup = rows.clone();
        dup[0].broker_message_id = Some(second.broker_message_id);
        let err = store.write(&second, &dup).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Constraint(ConstraintViolation::Unique { table: "brokerclassification", .. })
        ));
        assert!(!err.is_retryable());

        // Nothing from the failed unit is visible.
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.classification_count(), 1);
        assert_eq!(store.pending_sources().unwrap(), vec![1]);
    }

    #[test]
    fn test_same_local_id_under_other_classifier_is_allowed() {
        let (_dir, _db, store) = open(&[]);
        let a = message(&store, 1, 1, &[(1, 1.0)]);
        let rows = classification_rows(&a, &store.ids(), Utc::now()).unwrap();
        store.write(&a, &rows).unwrap();

        let b = message(&store, 2, 1, &[(1, 1.0)]);
        let mut other = rows;
        other[0].key.classifier_id = ClassifierId(2);
        other[0].broker_message_id = Some(b.broker_message_id);
        store.write(&b, &other).unwrap();
        assert_eq!(store.classification_count(), 2);
    }

    #[test]
    fn test_dangling_reference_rolls_back() {
        let (_dir, _db, store) = open(&[]);
        let msg = message(&store, 1, 1, &[(1, 1.0)]);
        let mut rows = classification_rows(&msg, &store.ids(), Utc::now()).unwrap();
        rows[0].broker_message_id = Some(BrokerMessageId(u64::MAX));

        let err = store.write(&msg, &rows).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Constraint(ConstraintViolation::ForeignKey { .. })
        ));
        assert_eq!(store.message_count(), 0);
        assert_eq!(store.classification_count(), 0);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_misaligned_message_rejected() {
        let (_dir, _db, store) = open(&[]);
        let mut msg = message(&store, 1, 1, &[(1, 0.5), (2, 0.5)]);
        msg.probability.pop();
        let err = store.write(&msg, &[]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Constraint(ConstraintViolation::Misaligned(_, 2, 1))
        ));
    }

    #[test]
    fn test_pending_source_added_once() {
        let (_dir, _db, store) = open(&[]);
        let first = message(&store, 1, 42, &[(1, 1.0)]);
        let again = message(&store, 2, 42, &[(1, 1.0)]);
        assert!(write(&store, &first).new_pending_source);
        assert!(!write(&store, &again).new_pending_source);
        assert_eq!(store.pending_sources().unwrap(), vec![42]);
    }

    #[test]
    fn test_create_partition_moves_rows() {
        let (_dir, db, store) = open(&[]);
        let a = message(&store, 3, 1, &[(1, 0.4), (2, 0.6)]);
        let b = message(&store, 4, 2, &[(1, 1.0)]);
        write(&store, &a);
        write(&store, &b);

        assert_eq!(store.create_partition(ClassifierId(3)).unwrap(), 2);
        assert_eq!(store.create_partition(ClassifierId(3)).unwrap(), 0);

        let counts = store.partition_counts();
        assert_eq!(
            counts,
            vec![(Partition::Dedicated(ClassifierId(3)), 2), (Partition::Default, 1)]
        );
        for row in store.classifications_for(a.broker_message_id).unwrap() {
            assert_eq!(
                store.partition_of(row.key).unwrap(),
                Some(Partition::Dedicated(ClassifierId(3)))
            );
        }

        // New writes for the classifier go straight to its partition.
        let c = message(&store, 3, 3, &[(9, 1.0)]);
        assert_eq!(write(&store, &c).partition, Partition::Dedicated(ClassifierId(3)));

        // The partition survives reopening.
        drop(store);
        let reopened = ClassificationStore::open(&db, &[]).unwrap();
        assert_eq!(reopened.partitions(), vec![ClassifierId(3)]);
        assert_eq!(reopened.classifications_of(ClassifierId(3)).unwrap().len(), 3);
    }

    #[test]
    fn test_partition_attached_through_other_handle() {
        let (_dir, db, a) = open(&[]);
        let b = ClassificationStore::open(&db, &[]).unwrap();

        assert_eq!(a.create_partition(ClassifierId(7)).unwrap(), 0);

        let msg = message(&b, 7, 1, &[(2222, 0.6), (2223, 0.4)]);
        assert_eq!(write(&b, &msg).partition, Partition::Dedicated(ClassifierId(7)));
        assert_eq!(b.partitions(), vec![ClassifierId(7)]);

        // Both handles find the rows where they were written.
        for store in [&a, &b] {
            assert_eq!(store.classifications_of(ClassifierId(7)).unwrap().len(), 2);
            let rows = store.classifications_for(msg.broker_message_id).unwrap();
            assert_eq!(rows.len(), 2);
            for row in rows {
                assert_eq!(
                    store.partition_of(row.key).unwrap(),
                    Some(Partition::Dedicated(ClassifierId(7)))
                );
            }
        }
        assert_eq!(
            a.partition_counts(),
            vec![(Partition::Dedicated(ClassifierId(7)), 2), (Partition::Default, 0)]
        );

        // Attaching again through the other handle is a no-op.
        assert_eq!(b.create_partition(ClassifierId(7)).unwrap(), 0);
    }

    #[test]
    fn test_stale_handle_rows_move_with_partition() {
        let (_dir, db, a) = open(&[]);
        let b = ClassificationStore::open(&db, &[]).unwrap();

        let early = message(&b, 5, 1, &[(1, 1.0)]);
        assert_eq!(write(&b, &early).partition, Partition::Default);

        assert_eq!(a.create_partition(ClassifierId(5)).unwrap(), 1);
        let late = message(&b, 5, 2, &[(1, 1.0)]);
        assert_eq!(write(&b, &late).partition, Partition::Dedicated(ClassifierId(5)));

        assert_eq!(a.classifications_of(ClassifierId(5)).unwrap().len(), 2);
        assert_eq!(b.classification_count(), 2);
        assert_eq!(db.open_tree(DEFAULT_PARTITION_TREE).unwrap().len(), 0);
    }
}
