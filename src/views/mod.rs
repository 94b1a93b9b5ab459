//! Derived views
//!
//! Two read projections over the stored tables:
//! - [`ViewName::PrevSourceCounts`] is materialized. `refresh` recomputes it
//!   from scratch and swaps the new snapshot in atomically; `query` reads the
//!   current snapshot. The snapshot is also persisted under one key, so it
//!   survives restarts.
//! - [`ViewName::SourceClassifications`] is live. Every `query` joins the
//!   current committed rows.
//!
//! Nothing here runs on a timer; refreshes are requested by the operator or
//! by the poll loop after a run.

pub mod prev_source_counts;
pub mod source_classifications;

pub use prev_source_counts::{PrevSourceCount, PrevSourceSnapshot};
pub use source_classifications::SourceClassification;

use arc_swap::ArcSwap;
use chrono::Utc;
use sled::{Db, Tree};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::defaults;
use crate::registry::ClassifierRegistry;
use crate::storage::{ClassificationStore, SourceTables, StorageError, META_TREE};

const PREV_SOURCE_COUNTS_KEY: &[u8] = b"view:prevsourcecounts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewName {
    PrevSourceCounts,
    SourceClassifications,
}

impl ViewName {
    pub const ALL: [Self; 2] = [Self::PrevSourceCounts, Self::SourceClassifications];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PrevSourceCounts => "prevsourcecounts",
            Self::SourceClassifications => "sourceclassifications",
        }
    }

    pub const fn is_materialized(self) -> bool {
        matches!(self, Self::PrevSourceCounts)
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewName {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ViewError::UnknownView(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("view {0} is computed on read and cannot be refreshed")]
    NotMaterialized(ViewName),

    #[error("source tables kept changing during refresh of {view} ({attempts} attempts); previous snapshot kept")]
    Unstable { view: ViewName, attempts: u32 },

    #[error("unknown view '{0}'")]
    UnknownView(String),
}

/// A row of either view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewRow {
    PrevSourceCount(PrevSourceCount),
    SourceClassification(SourceClassification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub view: ViewName,
    pub rows: usize,
    pub generation: u64,
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct ViewMaintainer {
    store: ClassificationStore,
    registry: Arc<ClassifierRegistry>,
    tables: SourceTables,
    meta: Tree,
    prev_source_counts: ArcSwap<PrevSourceSnapshot>,
    lag_days: f64,
    retries: u32,
}

impl ViewMaintainer {
    /// Build the maintainer, restoring the last persisted snapshot.
    pub fn open(
        db: &Db,
        store: ClassificationStore,
        registry: Arc<ClassifierRegistry>,
        tables: SourceTables,
    ) -> Result<Self, ViewError> {
        let meta = db.open_tree(META_TREE).map_err(StorageError::from)?;

        let snapshot = match meta.get(PREV_SOURCE_COUNTS_KEY).map_err(StorageError::from)? {
            Some(raw) => {
                let mut snapshot: PrevSourceSnapshot =
                    serde_json::from_slice(&raw).map_err(StorageError::from)?;
                snapshot.reindex();
                snapshot
            }
            None => PrevSourceSnapshot::default(),
        };

        Ok(Self {
            store,
            registry,
            tables,
            meta,
            prev_source_counts: ArcSwap::from_pointee(snapshot),
            lag_days: defaults::FORCED_SOURCE_LAG_DAYS,
            retries: defaults::VIEW_SNAPSHOT_RETRIES,
        })
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    #[must_use]
    pub fn with_lag_days(mut self, lag_days: f64) -> Self {
        self.lag_days = lag_days;
        self
    }

    /// Recompute a materialized view and swap it in.
    ///
    /// The computation reads the source tables without locking them. If
    /// their generation moves while it runs, the result is discarded and the
    /// computation repeats; after `retries` attempts the old snapshot stays.
    pub fn refresh(&self, view: ViewName) -> Result<RefreshReport, ViewError> {
        if !view.is_materialized() {
            return Err(ViewError::NotMaterialized(view));
        }
        self.refresh_with(view, prev_source_counts::compute)
    }

    fn refresh_with<F>(&self, view: ViewName, compute: F) -> Result<RefreshReport, ViewError>
    where
        F: Fn(&SourceTables, f64) -> Result<Vec<PrevSourceCount>, StorageError>,
    {
        let started = Instant::now();
        for attempt in 1..=self.retries {
            let generation = self.tables.generation()?;
            let rows = compute(&self.tables, self.lag_days)?;
            if self.tables.generation()? != generation {
                warn!(view = %view, attempt, "Source tables changed during refresh, recomputing");
                continue;
            }

            let snapshot = PrevSourceSnapshot::new(generation, Utc::now(), rows);
            // One key, one insert: the persisted copy is never half written.
            let encoded = serde_json::to_vec(&snapshot).map_err(StorageError::from)?;
            self.meta
                .insert(PREV_SOURCE_COUNTS_KEY, encoded)
                .map_err(StorageError::from)?;
            let report = RefreshReport {
                view,
                rows: snapshot.len(),
                generation,
                attempts: attempt,
                elapsed: started.elapsed(),
            };
            self.prev_source_counts.store(Arc::new(snapshot));

            info!(
                view = %view,
                rows = report.rows,
                generation,
                elapsed_ms = report.elapsed.as_millis(),
                "View refreshed"
            );
            return Ok(report);
        }

        Err(ViewError::Unstable {
            view,
            attempts: self.retries,
        })
    }

    /// Refresh every materialized view.
    pub fn refresh_all(&self) -> Result<Vec<RefreshReport>, ViewError> {
        ViewName::ALL
            .into_iter()
            .filter(|v| v.is_materialized())
            .map(|v| self.refresh(v))
            .collect()
    }

    /// Rows of `view` matching `predicate`.
    pub fn query<F>(&self, view: ViewName, predicate: F) -> Result<Vec<ViewRow>, ViewError>
    where
        F: Fn(&ViewRow) -> bool,
    {
        let rows: Vec<ViewRow> = match view {
            ViewName::PrevSourceCounts => self
                .prev_source_counts
                .load()
                .rows
                .iter()
                .cloned()
                .map(ViewRow::PrevSourceCount)
                .collect(),
            ViewName::SourceClassifications => {
                source_classifications::compute(&self.store, &self.registry, &self.tables)?
                    .into_iter()
                    .map(ViewRow::SourceClassification)
                    .collect()
            }
        };
        Ok(rows.into_iter().filter(|row| predicate(row)).collect())
    }

    /// The current previous-source-counts snapshot.
    pub fn prev_source_counts(&self) -> Arc<PrevSourceSnapshot> {
        self.prev_source_counts.load_full()
    }

    pub fn source_classifications(&self) -> Result<Vec<SourceClassification>, ViewError> {
        Ok(source_classifications::compute(
            &self.store,
            &self.registry,
            &self.tables,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertPacket, DiaObject, DiaSource};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn alert(id: i64, t: f64) -> AlertPacket {
        AlertPacket {
            alert_id: id,
            alert_sent_timestamp: None,
            dia_source: DiaSource {
                dia_source_id: id,
                dia_object_id: 1,
                mid_point_tai: t,
                filter_name: "g".into(),
                ps_flux: 50.0,
                ps_flux_err: 5.0,
                snr: 10.0,
            },
            dia_object: DiaObject {
                dia_object_id: 1,
                ra: 10.0,
                decl: -20.0,
                mw_ebv: None,
            },
            prv_dia_forced_sources: Vec::new(),
        }
    }

    #[test]
    fn test_unstable_refresh_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = ClassificationStore::open(&db, &[]).unwrap();
        let registry = Arc::new(ClassifierRegistry::open(&db).unwrap());
        let tables = SourceTables::open(&db).unwrap();
        tables.promote(&alert(1, 60_000.0)).unwrap();

        let views = ViewMaintainer::open(&db, store.clone(), registry.clone(), tables.clone())
            .unwrap()
            .with_retries(2);
        let first = views.refresh(ViewName::PrevSourceCounts).unwrap();
        assert_eq!(first.rows, 1);

        // Every attempt sees a new source land while it computes.
        let next = AtomicI64::new(2);
        let err = views
            .refresh_with(ViewName::PrevSourceCounts, |tables, lag| {
                let rows = prev_source_counts::compute(tables, lag)?;
                let id = next.fetch_add(1, Ordering::SeqCst);
                tables.promote(&alert(id, 60_000.0 + id as f64))?;
                Ok(rows)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ViewError::Unstable {
                view: ViewName::PrevSourceCounts,
                attempts: 2
            }
        ));

        let current = views.prev_source_counts();
        assert_eq!(current.len(), 1);
        assert_eq!(current.generation, first.generation);

        // The persisted copy is the old one as well.
        let reopened = ViewMaintainer::open(&db, store, registry, tables).unwrap();
        assert_eq!(reopened.prev_source_counts().len(), 1);

        // Once the tables settle, a refresh picks up every source.
        assert_eq!(reopened.refresh(ViewName::PrevSourceCounts).unwrap().rows, 3);
    }

    #[test]
    fn test_view_names() {
        assert_eq!("prevsourcecounts".parse::<ViewName>().unwrap(), ViewName::PrevSourceCounts);
        assert_eq!(
            "SourceClassifications".parse::<ViewName>().unwrap(),
            ViewName::SourceClassifications
        );
        assert!(matches!("nope".parse::<ViewName>(), Err(ViewError::UnknownView(_))));
        assert!(ViewName::PrevSourceCounts.is_materialized());
        assert!(!ViewName::SourceClassifications.is_materialized());
    }
}
