//! Durable topic log on sled.
//!
//! Layout (all in the shared database):
//! - `topic_log`: key `topic \0 offset(be u64)`, value `timestamp_ms(be i64) ++ payload`
//! - `topic_heads`: key `topic`, value next offset to assign (be u64)
//! - `consumer_offsets`: key `group \0 topic`, value next offset to deliver (be u64)
//!
//! Appends assign the offset and write the entry in one transaction, so a
//! topic never has gaps and readers may stop at the first missing offset.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{is_valid_topic_name, MessageSource, RawMessage, SourceError, TopicOffset};

const LOG_TREE: &str = "topic_log";
const HEADS_TREE: &str = "topic_heads";
const OFFSETS_TREE: &str = "consumer_offsets";

/// Upper bound on one blocking wait; the cursor re-reads after each slice.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Append-only, multi-topic message log.
#[derive(Clone)]
pub struct TopicLog {
    log: Tree,
    heads: Tree,
    offsets: Tree,
}

impl TopicLog {
    /// Open (or create) the log trees inside `db`.
    pub fn open(db: &Db) -> Result<Self, SourceError> {
        Ok(Self {
            log: db.open_tree(LOG_TREE)?,
            heads: db.open_tree(HEADS_TREE)?,
            offsets: db.open_tree(OFFSETS_TREE)?,
        })
    }

    /// Append a message stamped with the current time. Returns its offset.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<u64, SourceError> {
        self.publish_at(topic, payload, Utc::now())
    }

    /// Append a message with an explicit header timestamp.
    pub fn publish_at(
        &self,
        topic: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<u64, SourceError> {
        check_topic(topic)?;

        let mut value = Vec::with_capacity(8 + payload.len());
        value.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
        value.extend_from_slice(payload);

        let result: TransactionResult<u64, SourceError> =
            (&self.heads, &self.log).transaction(|(heads, log)| {
                let next = match heads.get(topic.as_bytes())? {
                    Some(raw) => decode_u64(&raw).ok_or_else(|| {
                        ConflictableTransactionError::Abort(SourceError::Corrupt {
                            topic: topic.to_string(),
                            offset: 0,
                        })
                    })?,
                    None => 0,
                };
                heads.insert(topic.as_bytes(), (next + 1).to_be_bytes().to_vec())?;
                log.insert(entry_key(topic, next), value.clone())?;
                Ok(next)
            });
        let offset = flatten(result)?;

        debug!(topic, offset, bytes = payload.len(), "Published message");
        Ok(offset)
    }

    /// Number of messages ever appended to `topic`.
    pub fn len(&self, topic: &str) -> Result<u64, SourceError> {
        Ok(self
            .heads
            .get(topic.as_bytes())?
            .and_then(|raw| decode_u64(&raw))
            .unwrap_or(0))
    }

    pub fn is_empty(&self, topic: &str) -> Result<bool, SourceError> {
        Ok(self.len(topic)? == 0)
    }

    /// Committed next-offset of `group` on `topic`, if the group ever committed.
    pub fn committed(&self, group: &str, topic: &str) -> Result<Option<u64>, SourceError> {
        Ok(self
            .offsets
            .get(group_key(group, topic))?
            .and_then(|raw| decode_u64(&raw)))
    }

    /// Open a cursor for `group` over `topics`, resuming at the group's
    /// committed offsets (start of topic when never committed).
    pub fn subscribe(&self, topics: &[String], group: &str) -> Result<TopicConsumer, SourceError> {
        let mut positions = BTreeMap::new();
        for topic in topics {
            check_topic(topic)?;
            let start = self.committed(group, topic)?.unwrap_or(0);
            positions.insert(topic.clone(), start);
        }

        info!(group, topics = ?topics, "Consumer subscribed");

        Ok(TopicConsumer {
            log: self.clone(),
            group: group.to_string(),
            name: format!("topic-log[{group}]"),
            positions,
            rotation: 0,
        })
    }

    fn read_from(
        &self,
        topic: &str,
        start: u64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let mut out = Vec::new();
        let mut expected = start;
        let prefix = topic_prefix(topic);

        for item in self.log.range(entry_key(topic, start)..) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let offset = decode_u64(&key[prefix.len()..]).ok_or_else(|| SourceError::Corrupt {
                topic: topic.to_string(),
                offset: expected,
            })?;
            if offset != expected || value.len() < 8 {
                return Err(SourceError::Corrupt {
                    topic: topic.to_string(),
                    offset: expected,
                });
            }
            let mut millis = [0u8; 8];
            millis.copy_from_slice(&value[..8]);
            out.push(RawMessage {
                topic: topic.to_string(),
                offset,
                timestamp: DateTime::from_timestamp_millis(i64::from_be_bytes(millis)),
                payload: value[8..].to_vec(),
            });
            expected += 1;
        }

        Ok(out)
    }
}

/// A consumer-group cursor over a [`TopicLog`].
pub struct TopicConsumer {
    log: TopicLog,
    group: String,
    name: String,
    /// Next offset to deliver, per subscribed topic.
    positions: BTreeMap<String, u64>,
    /// Topic index to start the next read from, for fairness across topics.
    rotation: usize,
}

impl TopicConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    /// Next offset this cursor will deliver on `topic`.
    pub fn position(&self, topic: &str) -> Option<u64> {
        self.positions.get(topic).copied()
    }

    /// Messages available without waiting, spread over topics round-robin.
    fn read_available(&mut self, max_batch: usize) -> Result<Vec<RawMessage>, SourceError> {
        let topics: Vec<String> = self.positions.keys().cloned().collect();
        if topics.is_empty() || max_batch == 0 {
            return Ok(Vec::new());
        }

        let mut batch = Vec::new();
        for i in 0..topics.len() {
            let remaining = max_batch - batch.len();
            if remaining == 0 {
                break;
            }
            let topic = &topics[(self.rotation + i) % topics.len()];
            let start = self.positions.get(topic).copied().unwrap_or(0);
            let messages = self.log.read_from(topic, start, remaining)?;
            if let Some(last) = messages.last() {
                self.positions.insert(topic.clone(), last.offset + 1);
            }
            batch.extend(messages);
        }
        self.rotation = (self.rotation + 1) % topics.len();

        Ok(batch)
    }
}

#[async_trait]
impl MessageSource for TopicConsumer {
    async fn poll(
        &mut self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Subscribe before reading so an append between the read and the
            // wait still wakes us.
            let mut subscriber = self.log.log.watch_prefix(Vec::<u8>::new());

            let batch = self.read_available(max_batch)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(batch);
            }

            let wait = remaining.min(WAIT_SLICE);
            tokio::task::spawn_blocking(move || {
                // Timing out is the normal empty-poll outcome.
                let _ = subscriber.next_timeout(wait);
            })
            .await
            .map_err(|e| SourceError::Wait(e.to_string()))?;
        }
    }

    fn commit(&mut self, offset: &TopicOffset) -> Result<(), SourceError> {
        if !self.positions.contains_key(&offset.topic) {
            return Err(SourceError::NotSubscribed(offset.topic.clone()));
        }
        self.log.offsets.insert(
            group_key(&self.group, &offset.topic),
            (offset.offset + 1).to_be_bytes().to_vec(),
        )?;
        debug!(group = %self.group, topic = %offset.topic, offset = offset.offset, "Committed offset");
        Ok(())
    }

    fn reset_to_start(&mut self, topic: &str) -> Result<(), SourceError> {
        let Some(position) = self.positions.get_mut(topic) else {
            return Err(SourceError::NotSubscribed(topic.to_string()));
        };
        *position = 0;
        self.log.offsets.remove(group_key(&self.group, topic))?;
        info!(group = %self.group, topic, "Consumer rewound to start of topic");
        Ok(())
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Key encoding
// ============================================================================

fn check_topic(topic: &str) -> Result<(), SourceError> {
    if is_valid_topic_name(topic) {
        Ok(())
    } else {
        Err(SourceError::InvalidTopic(topic.to_string()))
    }
}

fn topic_prefix(topic: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + 1);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key
}

fn entry_key(topic: &str, offset: u64) -> Vec<u8> {
    let mut key = topic_prefix(topic);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

fn group_key(group: &str, topic: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.len() + topic.len() + 1);
    key.extend_from_slice(group.as_bytes());
    key.push(0);
    key.extend_from_slice(topic.as_bytes());
    key
}

fn decode_u64(raw: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn flatten<T>(result: TransactionResult<T, SourceError>) -> Result<T, SourceError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => SourceError::Backend(e),
    })
}
