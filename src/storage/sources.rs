//! Authoritative object, source, forced-source, alert and truth tables.
//!
//! Source and forced-source rows are also indexed by object
//! (`object key ++ row key`), which is the access path of the
//! previous-source-counts view. Every change to them bumps a generation
//! counter in the `meta` tree inside the same transaction, so a reader can
//! tell whether the tables moved underneath a multi-read computation.

use sled::transaction::{TransactionResult, TransactionalTree, UnabortableTransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info};

use super::{
    flatten, i64_from_key, i64_key, u64_from_key, StorageError, ALERT_TREE, FORCED_BY_OBJECT_TREE,
    FORCED_TREE, GENTYPE_TREE, META_TREE, OBJECT_TREE, PENDING_TREE, SOURCE_BY_OBJECT_TREE,
    SOURCE_GENERATION_KEY, SOURCE_TREE, TRUTH_TREE,
};
use crate::types::{
    AlertId, AlertPacket, DiaAlert, DiaForcedSource, DiaObject, DiaObjectId, DiaObjectTruth,
    DiaSource, DiaSourceId, GentypeOfClassId,
};

/// Result of promoting one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub new_object: bool,
    pub new_source: bool,
    pub forced_sources: usize,
    /// The source was in the pending set and has been removed from it.
    pub was_pending: bool,
}

#[derive(Clone)]
pub struct SourceTables {
    objects: Tree,
    sources: Tree,
    forced: Tree,
    alerts: Tree,
    truth: Tree,
    gentypes: Tree,
    source_by_object: Tree,
    forced_by_object: Tree,
    pending: Tree,
    meta: Tree,
}

impl SourceTables {
    pub fn open(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            objects: db.open_tree(OBJECT_TREE)?,
            sources: db.open_tree(SOURCE_TREE)?,
            forced: db.open_tree(FORCED_TREE)?,
            alerts: db.open_tree(ALERT_TREE)?,
            truth: db.open_tree(TRUTH_TREE)?,
            gentypes: db.open_tree(GENTYPE_TREE)?,
            source_by_object: db.open_tree(SOURCE_BY_OBJECT_TREE)?,
            forced_by_object: db.open_tree(FORCED_BY_OBJECT_TREE)?,
            pending: db.open_tree(PENDING_TREE)?,
            meta: db.open_tree(META_TREE)?,
        })
    }

    /// Current source generation; changes whenever a source or forced
    /// source row is written.
    pub fn generation(&self) -> Result<u64, StorageError> {
        Ok(self
            .meta
            .get(SOURCE_GENERATION_KEY)?
            .and_then(|raw| u64_from_key(&raw))
            .unwrap_or(0))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Upsert everything an alert carries and take its source off the
    /// pending set, as one unit.
    pub fn promote(&self, alert: &AlertPacket) -> Result<Promotion, StorageError> {
        let object = &alert.dia_object;
        let source = &alert.dia_source;
        let object_key = i64_key(object.dia_object_id).to_vec();
        let source_key = i64_key(source.dia_source_id).to_vec();

        let object_value = serde_json::to_vec(object)?;
        let source_value = serde_json::to_vec(source)?;
        let alert_value = serde_json::to_vec(&alert.alert_row())?;
        let forced = alert
            .prv_dia_forced_sources
            .iter()
            .map(|f| Ok((f.dia_forced_source_id, f.dia_object_id, serde_json::to_vec(f)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let result: TransactionResult<Promotion, StorageError> = (
            &self.objects,
            &self.sources,
            &self.forced,
            &self.alerts,
            &self.source_by_object,
            &self.forced_by_object,
            &self.pending,
            &self.meta,
        )
            .transaction(
                |(objects, sources, forced_tree, alerts, by_object, forced_by_object, pending, meta)| {
                    let new_object = objects.insert(object_key.clone(), object_value.clone())?.is_none();
                    let new_source = sources.insert(source_key.clone(), source_value.clone())?.is_none();
                    by_object.insert(
                        pair_key(source.dia_object_id, source.dia_source_id),
                        Vec::new(),
                    )?;
                    for (forced_id, forced_object, value) in &forced {
                        forced_tree.insert(i64_key(*forced_id).to_vec(), value.clone())?;
                        forced_by_object.insert(pair_key(*forced_object, *forced_id), Vec::new())?;
                    }
                    alerts.insert(i64_key(alert.alert_id).to_vec(), alert_value.clone())?;
                    let was_pending = pending.remove(source_key.clone())?.is_some();
                    bump_generation(meta)?;
                    Ok(Promotion {
                        new_object,
                        new_source,
                        forced_sources: forced.len(),
                        was_pending,
                    })
                },
            );
        let promotion = flatten(result)?;

        debug!(
            alert_id = alert.alert_id,
            dia_source_id = source.dia_source_id,
            dia_object_id = object.dia_object_id,
            forced = promotion.forced_sources,
            "Promoted alert"
        );
        Ok(promotion)
    }

    /// Load simulation truth and the gentype to class mapping. Existing rows
    /// with the same keys are replaced.
    pub fn load_truth(
        &self,
        truth: &[DiaObjectTruth],
        gentypes: &[GentypeOfClassId],
    ) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        for row in truth {
            batch.insert(i64_key(row.dia_object_id).to_vec(), serde_json::to_vec(row)?);
        }
        self.truth.apply_batch(batch)?;

        let mut batch = sled::Batch::default();
        for row in gentypes {
            batch.insert(i64_key(i64::from(row.gentype)).to_vec(), serde_json::to_vec(row)?);
        }
        self.gentypes.apply_batch(batch)?;

        info!(truth = truth.len(), gentypes = gentypes.len(), "Truth tables loaded");
        Ok(truth.len() + gentypes.len())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn object(&self, id: DiaObjectId) -> Result<Option<DiaObject>, StorageError> {
        get_json(&self.objects, i64_key(id))
    }

    pub fn source(&self, id: DiaSourceId) -> Result<Option<DiaSource>, StorageError> {
        get_json(&self.sources, i64_key(id))
    }

    pub fn alert(&self, id: AlertId) -> Result<Option<DiaAlert>, StorageError> {
        get_json(&self.alerts, i64_key(id))
    }

    pub fn truth(&self, id: DiaObjectId) -> Result<Option<DiaObjectTruth>, StorageError> {
        get_json(&self.truth, i64_key(id))
    }

    pub fn gentype(&self, gentype: i32) -> Result<Option<GentypeOfClassId>, StorageError> {
        get_json(&self.gentypes, i64_key(i64::from(gentype)))
    }

    /// Object ids that have at least one source, ascending.
    pub fn object_ids_with_sources(&self) -> Result<Vec<DiaObjectId>, StorageError> {
        let mut out: Vec<DiaObjectId> = Vec::new();
        for key in self.source_by_object.iter().keys() {
            let key = key?;
            let id = i64_from_key(&key)
                .ok_or_else(|| StorageError::corrupt(SOURCE_BY_OBJECT_TREE, "short key"))?;
            if out.last() != Some(&id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn sources_of(&self, object: DiaObjectId) -> Result<Vec<DiaSource>, StorageError> {
        self.indexed(&self.source_by_object, &self.sources, object, SOURCE_BY_OBJECT_TREE)
    }

    pub fn forced_of(&self, object: DiaObjectId) -> Result<Vec<DiaForcedSource>, StorageError> {
        self.indexed(&self.forced_by_object, &self.forced, object, FORCED_BY_OBJECT_TREE)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn forced_count(&self) -> usize {
        self.forced.len()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }

    fn indexed<T: serde::de::DeserializeOwned>(
        &self,
        index: &Tree,
        rows: &Tree,
        object: DiaObjectId,
        index_name: &str,
    ) -> Result<Vec<T>, StorageError> {
        let mut out = Vec::new();
        for key in index.scan_prefix(i64_key(object)).keys() {
            let key = key?;
            let row_key = key
                .get(8..16)
                .ok_or_else(|| StorageError::corrupt(index_name, "short key"))?;
            let raw = rows
                .get(row_key)?
                .ok_or_else(|| StorageError::corrupt(index_name, "dangling index entry"))?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }
}

fn pair_key(object: DiaObjectId, row: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&i64_key(object));
    out.extend_from_slice(&i64_key(row));
    out
}

fn bump_generation(meta: &TransactionalTree) -> Result<(), UnabortableTransactionError> {
    let current = meta
        .get(SOURCE_GENERATION_KEY)?
        .and_then(|raw| u64_from_key(&raw))
        .unwrap_or(0);
    meta.insert(SOURCE_GENERATION_KEY, (current + 1).to_be_bytes().to_vec())?;
    Ok(())
}

fn get_json<T: serde::de::DeserializeOwned>(
    tree: &Tree,
    key: [u8; 8],
) -> Result<Option<T>, StorageError> {
    tree.get(key)?
        .map(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Db, SourceTables) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let tables = SourceTables::open(&db).unwrap();
        (dir, db, tables)
    }

    fn packet(alert_id: i64, source: i64, object: i64, t: f64, forced: &[(i64, f64)]) -> AlertPacket {
        AlertPacket {
            alert_id,
            alert_sent_timestamp: None,
            dia_source: DiaSource {
                dia_source_id: source,
                dia_object_id: object,
                mid_point_tai: t,
                filter_name: "r".into(),
                ps_flux: 10.0,
                ps_flux_err: 1.0,
                snr: 10.0,
            },
            dia_object: DiaObject {
                dia_object_id: object,
                ra: 1.0,
                decl: -1.0,
                mw_ebv: None,
            },
            prv_dia_forced_sources: forced
                .iter()
                .map(|&(id, t)| DiaForcedSource {
                    dia_forced_source_id: id,
                    dia_object_id: object,
                    mid_point_tai: t,
                    filter_name: "r".into(),
                    ps_flux: 1.0,
                    ps_flux_err: 1.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_promote_clears_pending_and_bumps_generation() {
        let (_dir, db, tables) = open();
        db.open_tree(PENDING_TREE)
            .unwrap()
            .insert(i64_key(11), Vec::<u8>::new())
            .unwrap();

        let before = tables.generation().unwrap();
        let p = tables.promote(&packet(1, 11, 100, 60000.0, &[(5, 59990.0)])).unwrap();
        assert!(p.new_object && p.new_source && p.was_pending);
        assert_eq!(p.forced_sources, 1);
        assert!(tables.generation().unwrap() > before);
        assert!(db.open_tree(PENDING_TREE).unwrap().is_empty());

        // Promoting again is an upsert.
        let again = tables.promote(&packet(1, 11, 100, 60000.0, &[(5, 59990.0)])).unwrap();
        assert!(!again.new_object && !again.new_source && !again.was_pending);
        assert_eq!(tables.source_count(), 1);
        assert_eq!(tables.forced_count(), 1);
        assert_eq!(tables.alert(1).unwrap().unwrap().dia_source_id, 11);
    }

    #[test]
    fn test_object_index() {
        let (_dir, _db, tables) = open();
        tables.promote(&packet(1, 11, -3, 1.0, &[])).unwrap();
        tables.promote(&packet(2, 12, -3, 2.0, &[(7, 0.5), (8, 0.7)])).unwrap();
        tables.promote(&packet(3, 13, 9, 1.0, &[])).unwrap();

        assert_eq!(tables.object_ids_with_sources().unwrap(), vec![-3, 9]);
        let ids: Vec<i64> = tables.sources_of(-3).unwrap().iter().map(|s| s.dia_source_id).collect();
        assert_eq!(ids, vec![11, 12]);
        assert_eq!(tables.forced_of(-3).unwrap().len(), 2);
        assert!(tables.forced_of(9).unwrap().is_empty());
    }

    #[test]
    fn test_load_truth() {
        let (_dir, _db, tables) = open();
        let truth = DiaObjectTruth {
            dia_object_id: 100,
            gentype: 10,
            zcmb: 0.1,
            galnmatch: 0,
            galid: None,
            galzphot: None,
            galzphoterr: None,
            galsnsep: None,
            galsnddlr: None,
        };
        let map = GentypeOfClassId {
            gentype: 10,
            class_id: 2222,
            description: "SNIa".into(),
        };
        assert_eq!(tables.load_truth(&[truth.clone()], &[map.clone()]).unwrap(), 2);
        assert_eq!(tables.truth(100).unwrap(), Some(truth));
        assert_eq!(tables.gentype(10).unwrap(), Some(map));
        assert_eq!(tables.gentype(11).unwrap(), None);
    }
}
