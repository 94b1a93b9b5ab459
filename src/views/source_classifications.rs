//! Live source-classification join.
//!
//! One row per classification row whose message, classifier, source, alert,
//! truth and gentype mapping all exist (inner join). Computed on every read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::registry::ClassifierRegistry;
use crate::storage::{ClassificationStore, SourceTables, StorageError};
use crate::types::{
    AlertId, BrokerMessageId, ClassifierId, ClassifierIdentity, DiaObjectId, DiaSourceId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceClassification {
    pub classifier_id: ClassifierId,
    pub broker_name: String,
    pub broker_version: String,
    pub classifier_name: String,
    pub classifier_params: String,
    pub class_id: i32,
    pub probability: f64,
    pub dia_source_id: DiaSourceId,
    pub dia_object_id: DiaObjectId,
    pub gentype: i32,
    pub true_class_id: i32,
    pub alert_id: AlertId,
    pub broker_message_id: BrokerMessageId,
    pub alert_sent_timestamp: Option<DateTime<Utc>>,
    pub elasticc_publish_timestamp: DateTime<Utc>,
    pub broker_ingest_timestamp: DateTime<Utc>,
    pub msg_hdr_timestamp: Option<DateTime<Utc>>,
    pub desc_ingest_timestamp: DateTime<Utc>,
}

pub fn compute(
    store: &ClassificationStore,
    registry: &ClassifierRegistry,
    tables: &SourceTables,
) -> Result<Vec<SourceClassification>, StorageError> {
    let mut classifiers: HashMap<ClassifierId, Option<ClassifierIdentity>> = HashMap::new();
    let mut out = Vec::new();

    for message in store.messages()? {
        let Some(source) = tables.source(message.dia_source_id)? else {
            continue;
        };
        let Some(alert) = tables.alert(message.alert_id)? else {
            continue;
        };
        let Some(truth) = tables.truth(source.dia_object_id)? else {
            continue;
        };
        let Some(mapping) = tables.gentype(truth.gentype)? else {
            continue;
        };

        for row in store.classifications_for(message.broker_message_id)? {
            let classifier_id = row.key.classifier_id;
            let identity = match classifiers.get(&classifier_id) {
                Some(cached) => cached.clone(),
                None => {
                    let identity = registry.identity(classifier_id)?;
                    classifiers.insert(classifier_id, identity.clone());
                    identity
                }
            };
            let Some(identity) = identity else {
                continue;
            };

            out.push(SourceClassification {
                classifier_id,
                broker_name: identity.key.broker_name,
                broker_version: identity.key.broker_version,
                classifier_name: identity.key.classifier_name,
                classifier_params: identity.key.classifier_params,
                class_id: row.class_id,
                probability: row.probability,
                dia_source_id: source.dia_source_id,
                dia_object_id: source.dia_object_id,
                gentype: truth.gentype,
                true_class_id: mapping.class_id,
                alert_id: alert.alert_id,
                broker_message_id: message.broker_message_id,
                alert_sent_timestamp: alert.alert_sent_timestamp,
                elasticc_publish_timestamp: message.elasticc_publish_timestamp,
                broker_ingest_timestamp: message.broker_ingest_timestamp,
                msg_hdr_timestamp: message.msg_hdr_timestamp,
                desc_ingest_timestamp: message.desc_ingest_timestamp,
            });
        }
    }

    Ok(out)
}
