//! Previous-source counts.
//!
//! For each detection `s0` of an object:
//! - `ndetections`: detections of the object with `midPointTai <= s0`
//!   (always counts `s0` itself)
//! - `mint`: earliest of those times
//! - `nforced`: forced sources of the object strictly before `s0`, counted
//!   only when `s0` is more than the lag after `mint`, else 0
//!
//! The projection is a self-join with an inequality plus aggregation, so it
//! is always recomputed in full.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::storage::{SourceTables, StorageError};
use crate::types::{DiaForcedSource, DiaObjectId, DiaSource, DiaSourceId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrevSourceCount {
    pub dia_source_id: DiaSourceId,
    pub dia_object_id: DiaObjectId,
    pub mid_point_tai: f64,
    pub ndetections: u64,
    pub mint: f64,
    pub nforced: u64,
}

/// One complete, immutable version of the view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrevSourceSnapshot {
    /// Source-table generation the rows were computed from.
    pub generation: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Sorted by `dia_source_id`.
    pub rows: Vec<PrevSourceCount>,
    #[serde(skip)]
    by_source: HashMap<DiaSourceId, usize>,
    #[serde(skip)]
    by_object: BTreeMap<DiaObjectId, Vec<usize>>,
}

impl PrevSourceSnapshot {
    pub fn new(generation: u64, refreshed_at: DateTime<Utc>, rows: Vec<PrevSourceCount>) -> Self {
        let mut snapshot = Self {
            generation,
            refreshed_at: Some(refreshed_at),
            rows,
            by_source: HashMap::new(),
            by_object: BTreeMap::new(),
        };
        snapshot.reindex();
        snapshot
    }

    /// Rebuild the lookup indexes (after deserializing).
    pub(crate) fn reindex(&mut self) {
        self.by_source.clear();
        self.by_object.clear();
        for (i, row) in self.rows.iter().enumerate() {
            self.by_source.insert(row.dia_source_id, i);
            self.by_object.entry(row.dia_object_id).or_default().push(i);
        }
    }

    pub fn by_source(&self, id: DiaSourceId) -> Option<&PrevSourceCount> {
        self.by_source.get(&id).map(|&i| &self.rows[i])
    }

    pub fn by_object(&self, id: DiaObjectId) -> Vec<&PrevSourceCount> {
        self.by_object
            .get(&id)
            .map(|idx| idx.iter().map(|&i| &self.rows[i]).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Compute every row from the current source tables.
///
/// Reads happen up front; the per-object aggregation runs on the rayon pool.
pub fn compute(tables: &SourceTables, lag_days: f64) -> Result<Vec<PrevSourceCount>, StorageError> {
    let objects = tables
        .object_ids_with_sources()?
        .into_iter()
        .map(|id| Ok((tables.sources_of(id)?, tables.forced_of(id)?)))
        .collect::<Result<Vec<_>, StorageError>>()?;

    let mut rows: Vec<PrevSourceCount> = objects
        .par_iter()
        .flat_map_iter(|(sources, forced)| counts_for_object(sources, forced, lag_days))
        .collect();
    rows.sort_by_key(|r| r.dia_source_id);
    Ok(rows)
}

fn counts_for_object(
    sources: &[DiaSource],
    forced: &[DiaForcedSource],
    lag_days: f64,
) -> Vec<PrevSourceCount> {
    let mut times: Vec<f64> = sources.iter().map(|s| s.mid_point_tai).collect();
    times.sort_by(f64::total_cmp);
    let mut forced_times: Vec<f64> = forced.iter().map(|f| f.mid_point_tai).collect();
    forced_times.sort_by(f64::total_cmp);

    sources
        .iter()
        .map(|s0| {
            let t0 = s0.mid_point_tai;
            let ndetections = times.partition_point(|&t| t <= t0);
            // s0 is among the detections at or before t0, so the earliest
            // of them is the object's first detection.
            let mint = times.first().copied().unwrap_or(t0);
            let nforced = if t0 > mint + lag_days {
                forced_times.partition_point(|&t| t < t0)
            } else {
                0
            };
            PrevSourceCount {
                dia_source_id: s0.dia_source_id,
                dia_object_id: s0.dia_object_id,
                mid_point_tai: t0,
                ndetections: ndetections as u64,
                mint,
                nforced: nforced as u64,
            }
        })
        .collect()
}
