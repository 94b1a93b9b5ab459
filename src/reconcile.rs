//! Alert source reconciliation
//!
//! Ingestion only remembers which `diaSourceId`s it has seen. This pass
//! looks each pending id up in an [`AlertFeed`] and promotes the alert
//! (object, source, previous forced sources, alert row) into the source
//! tables; the promotion and the removal from the pending set commit
//! together. Ids the feed does not know stay pending for the next pass.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{ClassificationStore, SourceTables, StorageError};
use crate::types::{AlertPacket, DiaSourceId};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to read alert feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed alert at {path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Lookup of raw alerts by the source that triggered them.
pub trait AlertFeed {
    fn alert_for(&self, dia_source_id: DiaSourceId) -> Option<&AlertPacket>;
}

/// Alerts held in memory, indexed by `diaSourceId`. When a source appears
/// in several alerts the last one wins.
#[derive(Debug, Default, Clone)]
pub struct AlertIndex {
    by_source: HashMap<DiaSourceId, AlertPacket>,
}

impl AlertIndex {
    pub fn from_alerts<I>(alerts: I) -> Self
    where
        I: IntoIterator<Item = AlertPacket>,
    {
        Self {
            by_source: alerts
                .into_iter()
                .map(|a| (a.dia_source.dia_source_id, a))
                .collect(),
        }
    }

    /// Read a JSON-lines alert dump, one [`AlertPacket`] per line. Blank
    /// lines are ignored; any other unreadable line fails the load.
    pub fn from_json_lines(path: &Path) -> Result<Self, ReconcileError> {
        let io_err = |source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);

        let mut alerts = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let alert: AlertPacket =
                serde_json::from_str(&line).map_err(|source| ReconcileError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })?;
            alerts.push(alert);
        }

        info!(path = %path.display(), alerts = alerts.len(), "Loaded alert feed");
        Ok(Self::from_alerts(alerts))
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

impl AlertFeed for AlertIndex {
    fn alert_for(&self, dia_source_id: DiaSourceId) -> Option<&AlertPacket> {
        self.by_source.get(&dia_source_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pending_before: usize,
    pub promoted: usize,
    pub new_objects: usize,
    pub new_sources: usize,
    pub forced_sources: usize,
    /// Pending ids with no alert in the feed; still pending.
    pub missing: Vec<DiaSourceId>,
    pub elapsed: Duration,
}

impl ReconcileReport {
    /// True when the pending set was drained.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Promote every pending source the feed can resolve.
pub fn reconcile<F: AlertFeed + ?Sized>(
    store: &ClassificationStore,
    tables: &SourceTables,
    feed: &F,
) -> Result<ReconcileReport, ReconcileError> {
    let started = Instant::now();
    let pending = store.pending_sources()?;
    let mut report = ReconcileReport {
        pending_before: pending.len(),
        ..ReconcileReport::default()
    };

    for dia_source_id in pending {
        let Some(alert) = feed.alert_for(dia_source_id) else {
            report.missing.push(dia_source_id);
            continue;
        };
        let promotion = tables.promote(alert)?;
        report.promoted += 1;
        report.new_objects += usize::from(promotion.new_object);
        report.new_sources += usize::from(promotion.new_source);
        report.forced_sources += promotion.forced_sources;
    }
    report.elapsed = started.elapsed();

    if report.is_complete() {
        info!(
            promoted = report.promoted,
            new_objects = report.new_objects,
            new_sources = report.new_sources,
            forced_sources = report.forced_sources,
            "Reconciliation complete"
        );
    } else {
        warn!(
            promoted = report.promoted,
            missing = report.missing.len(),
            "Reconciliation left sources pending"
        );
    }
    Ok(report)
}
