//! Astronomical source tables.
//!
//! These rows are owned by the reconciliation job; ingestion only records
//! which `diaSourceId`s it has seen. Field names follow the alert schema
//! (`camelCase`) so JSON-lines alert dumps deserialize directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AlertId = i64;
pub type DiaSourceId = i64;
pub type DiaObjectId = i64;
pub type DiaForcedSourceId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaObject {
    pub dia_object_id: DiaObjectId,
    pub ra: f64,
    pub decl: f64,
    #[serde(default)]
    pub mw_ebv: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaSource {
    pub dia_source_id: DiaSourceId,
    pub dia_object_id: DiaObjectId,
    /// Observation time (MJD, TAI).
    pub mid_point_tai: f64,
    #[serde(default)]
    pub filter_name: String,
    #[serde(default)]
    pub ps_flux: f64,
    #[serde(default)]
    pub ps_flux_err: f64,
    #[serde(default)]
    pub snr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaForcedSource {
    pub dia_forced_source_id: DiaForcedSourceId,
    pub dia_object_id: DiaObjectId,
    pub mid_point_tai: f64,
    #[serde(default)]
    pub filter_name: String,
    #[serde(default)]
    pub ps_flux: f64,
    #[serde(default)]
    pub ps_flux_err: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaAlert {
    pub alert_id: AlertId,
    pub dia_source_id: DiaSourceId,
    pub dia_object_id: DiaObjectId,
    pub alert_sent_timestamp: Option<DateTime<Utc>>,
}

/// Simulation truth for an object. Host-galaxy fields are absent when the
/// object has no matched host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaObjectTruth {
    pub dia_object_id: DiaObjectId,
    pub gentype: i32,
    #[serde(default)]
    pub zcmb: f64,
    #[serde(default)]
    pub galnmatch: i32,
    #[serde(default)]
    pub galid: Option<i64>,
    #[serde(default)]
    pub galzphot: Option<f64>,
    #[serde(default)]
    pub galzphoterr: Option<f64>,
    #[serde(default)]
    pub galsnsep: Option<f64>,
    #[serde(default)]
    pub galsnddlr: Option<f64>,
}

/// Maps a simulation gentype to the taxonomy class id brokers report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GentypeOfClassId {
    pub gentype: i32,
    pub class_id: i32,
    #[serde(default)]
    pub description: String,
}

/// One alert as served by the raw alert feed: the triggering source, its
/// object, and the forced photometry that preceded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPacket {
    pub alert_id: AlertId,
    #[serde(default)]
    pub alert_sent_timestamp: Option<DateTime<Utc>>,
    pub dia_source: DiaSource,
    pub dia_object: DiaObject,
    #[serde(default)]
    pub prv_dia_forced_sources: Vec<DiaForcedSource>,
}

impl AlertPacket {
    pub fn alert_row(&self) -> DiaAlert {
        DiaAlert {
            alert_id: self.alert_id,
            dia_source_id: self.dia_source.dia_source_id,
            dia_object_id: self.dia_object.dia_object_id,
            alert_sent_timestamp: self.alert_sent_timestamp,
        }
    }
}
