//! Reconciliation and Derived View Tests
//!
//! Ingest a small night of classifications, promote the pending sources from
//! an alert feed, then check both views: exact previous-source counts, the
//! inner-join semantics of source classifications, and refresh determinism.

use brokerpoll::reconcile::reconcile;
use brokerpoll::types::{
    AlertPacket, DiaForcedSource, DiaObject, DiaObjectTruth, DiaSource, GentypeOfClassId,
};
use brokerpoll::views::{ViewName, ViewRow};
use brokerpoll::{
    AlertIndex, ClassProbability, ClassificationDecoder, ClassificationRecord, ClassificationStore,
    ClassifierKey, ClassifierRegistry, Ingestor, RawMessage, SourceTables, ViewMaintainer,
};
use brokerpoll::decode::{encode_record, Compression};
use chrono::{TimeZone, Utc};
use std::sync::Arc;

struct Env {
    _dir: tempfile::TempDir,
    db: sled::Db,
    store: ClassificationStore,
    registry: Arc<ClassifierRegistry>,
    tables: SourceTables,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let db = brokerpoll::open_database(dir.path()).unwrap();
    Env {
        store: ClassificationStore::open(&db, &[]).unwrap(),
        registry: Arc::new(ClassifierRegistry::open(&db).unwrap()),
        tables: SourceTables::open(&db).unwrap(),
        db,
        _dir: dir,
    }
}

fn source(id: i64, object: i64, t: f64) -> DiaSource {
    DiaSource {
        dia_source_id: id,
        dia_object_id: object,
        mid_point_tai: t,
        filter_name: "i".into(),
        ps_flux: 120.0,
        ps_flux_err: 8.0,
        snr: 15.0,
    }
}

fn forced(id: i64, object: i64, t: f64) -> DiaForcedSource {
    DiaForcedSource {
        dia_forced_source_id: id,
        dia_object_id: object,
        mid_point_tai: t,
        filter_name: "i".into(),
        ps_flux: 40.0,
        ps_flux_err: 9.0,
    }
}

fn alert(alert_id: i64, src: DiaSource, prv_forced: Vec<DiaForcedSource>) -> AlertPacket {
    AlertPacket {
        alert_id,
        alert_sent_timestamp: Some(Utc.with_ymd_and_hms(2023, 11, 14, 4, 0, 0).unwrap()),
        dia_object: DiaObject {
            dia_object_id: src.dia_object_id,
            ra: 150.1,
            decl: 2.2,
            mw_ebv: Some(0.02),
        },
        dia_source: src,
        prv_dia_forced_sources: prv_forced,
    }
}

/// Three detections of object 1 and one of object 2.
fn night() -> Vec<AlertPacket> {
    vec![
        alert(1001, source(11, 1, 60_100.0), vec![forced(901, 1, 60_099.0)]),
        alert(1002, source(12, 1, 60_100.3), vec![forced(901, 1, 60_099.0), forced(902, 1, 60_100.2)]),
        alert(
            1003,
            source(13, 1, 60_101.0),
            vec![forced(901, 1, 60_099.0), forced(902, 1, 60_100.2), forced(903, 1, 60_100.9)],
        ),
        alert(2001, source(21, 2, 60_100.5), vec![]),
    ]
}

fn classification(packet: &AlertPacket, classifier: ClassifierKey, offset: u64) -> RawMessage {
    let now = Utc::now();
    let record = ClassificationRecord {
        alert_id: packet.alert_id,
        dia_source_id: packet.dia_source.dia_source_id,
        elasticc_publish_timestamp: now,
        broker_ingest_timestamp: now,
        classifier,
        classifications: vec![
            ClassProbability {
                class_id: 2222,
                probability: 0.6,
            },
            ClassProbability {
                class_id: 2223,
                probability: 0.4,
            },
        ],
    };
    RawMessage {
        topic: "classifications".into(),
        offset,
        timestamp: Some(now),
        payload: encode_record(&record, Compression::None).unwrap(),
    }
}

fn nugent() -> ClassifierKey {
    ClassifierKey::new("FakeBroker", "v1.0", "Nugent", "k=5")
}

fn ingest_night(env: &Env) {
    let ingestor = Ingestor::new(ClassificationDecoder::default(), env.registry.clone(), env.store.clone());
    for (offset, packet) in (0u64..).zip(night().iter()) {
        let raw = classification(packet, nugent(), offset);
        assert!(ingestor.ingest(&raw).unwrap().is_stored());
    }
}

fn maintainer(env: &Env) -> ViewMaintainer {
    ViewMaintainer::open(&env.db, env.store.clone(), env.registry.clone(), env.tables.clone()).unwrap()
}

#[test]
fn reconciliation_empties_pending_set() {
    let env = env();
    ingest_night(&env);
    assert_eq!(env.store.pending_count(), 4);

    let report = reconcile(&env.store, &env.tables, &AlertIndex::from_alerts(night())).unwrap();

    assert!(report.is_complete());
    assert_eq!(env.store.pending_count(), 0);
    assert_eq!(report.new_objects, 2);
    assert_eq!(env.tables.object_count(), 2);
    assert_eq!(env.tables.source_count(), 4);
    assert_eq!(env.tables.forced_count(), 3);
    assert_eq!(env.tables.alert_count(), 4);

    // A classification for an already promoted source does not re-enter the
    // pending set.
    let ingestor = Ingestor::new(ClassificationDecoder::default(), env.registry.clone(), env.store.clone());
    let raw = classification(&night()[0], ClassifierKey::new("OtherBroker", "2", "Forest", ""), 99);
    assert!(ingestor.ingest(&raw).unwrap().is_stored());
    assert_eq!(env.store.pending_count(), 0);
}

#[test]
fn prev_source_counts_follow_detection_history() {
    let env = env();
    ingest_night(&env);
    reconcile(&env.store, &env.tables, &AlertIndex::from_alerts(night())).unwrap();

    let views = maintainer(&env);
    let report = views.refresh(ViewName::PrevSourceCounts).unwrap();
    assert_eq!(report.rows, 4);
    assert_eq!(report.generation, env.tables.generation().unwrap());

    let snapshot = views.prev_source_counts();
    let row = |id| snapshot.by_source(id).unwrap().clone();

    assert_eq!((row(11).ndetections, row(11).nforced), (1, 0));
    // 0.3 days after the first detection: inside the lag, no forced count.
    assert_eq!((row(12).ndetections, row(12).nforced), (2, 0));
    assert_eq!((row(13).ndetections, row(13).nforced), (3, 3));
    assert!((row(13).mint - 60_100.0).abs() < 1e-9);
    assert_eq!((row(21).ndetections, row(21).nforced), (1, 0));
    assert_eq!(snapshot.by_object(1).len(), 3);
}

#[test]
fn view_refresh_is_deterministic() {
    let env = env();
    ingest_night(&env);
    reconcile(&env.store, &env.tables, &AlertIndex::from_alerts(night())).unwrap();

    let views = maintainer(&env);
    views.refresh(ViewName::PrevSourceCounts).unwrap();
    let first = serde_json::to_vec(&views.prev_source_counts().rows).unwrap();
    views.refresh(ViewName::PrevSourceCounts).unwrap();
    let second = serde_json::to_vec(&views.prev_source_counts().rows).unwrap();
    assert_eq!(first, second);

    let a = serde_json::to_vec(&views.source_classifications().unwrap()).unwrap();
    let b = serde_json::to_vec(&views.source_classifications().unwrap()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn snapshot_survives_reopen() {
    let env = env();
    ingest_night(&env);
    reconcile(&env.store, &env.tables, &AlertIndex::from_alerts(night())).unwrap();
    maintainer(&env).refresh_all().unwrap();
    tokio_test::block_on(env.store.flush()).unwrap();

    let reopened = maintainer(&env);
    let snapshot = reopened.prev_source_counts();
    assert_eq!(snapshot.len(), 4);
    assert_eq!(snapshot.by_source(13).unwrap().nforced, 3);
}

#[test]
fn source_classifications_is_an_inner_join() {
    let env = env();
    ingest_night(&env);
    let views = maintainer(&env);

    // Nothing promoted yet: no source rows, so nothing joins.
    assert!(views.source_classifications().unwrap().is_empty());

    reconcile(&env.store, &env.tables, &AlertIndex::from_alerts(night())).unwrap();
    // Still no truth rows.
    assert!(views.source_classifications().unwrap().is_empty());

    env.tables
        .load_truth(
            &[DiaObjectTruth {
                dia_object_id: 1,
                gentype: 10,
                zcmb: 0.12,
                galnmatch: 1,
                galid: Some(77),
                galzphot: Some(0.11),
                galzphoterr: Some(0.01),
                galsnsep: Some(0.4),
                galsnddlr: Some(1.3),
            }],
            &[GentypeOfClassId {
                gentype: 10,
                class_id: 2222,
                description: "SNIa-SALT3".into(),
            }],
        )
        .unwrap();

    let rows = views.source_classifications().unwrap();
    // Object 1 has three classified sources with two classes each; object 2
    // has no truth row and drops out.
    assert_eq!(rows.len(), 6);
    for row in &rows {
        assert_eq!(row.dia_object_id, 1);
        assert_eq!(row.gentype, 10);
        assert_eq!(row.true_class_id, 2222);
        assert_eq!(row.broker_name, "FakeBroker");
        assert!(row.alert_sent_timestamp.is_some());
    }

    let only_2223 = views
        .query(ViewName::SourceClassifications, |row| {
            matches!(row, ViewRow::SourceClassification(r) if r.class_id == 2223)
        })
        .unwrap();
    assert_eq!(only_2223.len(), 3);
}

#[test]
fn live_view_cannot_be_refreshed() {
    let env = env();
    let views = maintainer(&env);
    assert!(views.refresh(ViewName::SourceClassifications).is_err());
    assert!(views.query(ViewName::PrevSourceCounts, |_| true).unwrap().is_empty());
}
