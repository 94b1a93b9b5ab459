//! Poll loop supervisor.
//!
//! Drives a [`MessageSource`] through the [`Ingestor`] until a stop
//! condition fires. Offsets are committed only after the messages before
//! them were fully processed, so anything not committed is redelivered to
//! the next run of the same consumer group.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ingest::{Ingestor, MessageOutcome};
use super::state::{IngestProgress, LoopState, RunReport, StopConditions, StopReason};
use super::PipelineError;
use crate::acquisition::{MessageSource, RawMessage, SourceError, TopicOffset};
use crate::config::{defaults, PollConfig};

// ============================================================================
// Message Hooks
// ============================================================================

/// Observer called once per processed message, after its outcome is known.
/// Pass `()` when nothing needs to watch.
pub trait MessageHook: Send + 'static {
    fn on_message(&mut self, raw: &RawMessage, outcome: &MessageOutcome);
}

impl MessageHook for () {
    fn on_message(&mut self, _raw: &RawMessage, _outcome: &MessageOutcome) {}
}

/// Adapts a closure into a [`MessageHook`].
pub struct FnHook<F>(pub F);

impl<F> MessageHook for FnHook<F>
where
    F: FnMut(&RawMessage, &MessageOutcome) + Send + 'static,
{
    fn on_message(&mut self, raw: &RawMessage, outcome: &MessageOutcome) {
        (self.0)(raw, outcome);
    }
}

// ============================================================================
// Poll Loop
// ============================================================================

pub struct PollLoop<H: MessageHook> {
    ingestor: Arc<Ingestor>,
    hooks: H,
    cancel_token: CancellationToken,
    limits: StopConditions,
    batch_size: usize,
    poll_timeout: Duration,
    progress: watch::Sender<IngestProgress>,
}

impl<H: MessageHook> PollLoop<H> {
    pub fn new(
        ingestor: Ingestor,
        config: &PollConfig,
        hooks: H,
        cancel_token: CancellationToken,
    ) -> Self {
        let (progress, _) = watch::channel(IngestProgress::default());
        Self {
            ingestor: Arc::new(ingestor),
            hooks,
            cancel_token,
            limits: StopConditions {
                max_messages: config.max_messages,
                stop_after: config.stop_after(),
                max_empty_polls: config.max_empty_polls,
            },
            batch_size: config.batch_size.max(1),
            poll_timeout: config.poll_timeout(),
            progress,
        }
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: StopConditions) -> Self {
        self.limits = limits;
        self
    }

    /// Receiver for progress updates; may be taken before or during a run.
    pub fn subscribe(&self) -> watch::Receiver<IngestProgress> {
        self.progress.subscribe()
    }

    /// Run until a stop condition fires.
    ///
    /// Undecodable messages are skipped and constraint violations are
    /// dead-lettered; both count as processed. A backend failure ends the
    /// run with an error after committing everything processed before it.
    pub async fn run<S: MessageSource>(mut self, source: &mut S) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let deadline = self.limits.stop_after.map(|d| started + d);
        let mut poll_failures = 0;

        info!(
            source = source.source_name(),
            batch_size = self.batch_size,
            max_messages = ?self.limits.max_messages,
            stop_after = ?self.limits.stop_after,
            max_empty_polls = ?self.limits.max_empty_polls,
            "Poll loop starting"
        );

        let reason = loop {
            if self.cancel_token.is_cancelled() {
                break StopReason::Cancelled;
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                break StopReason::Deadline;
            }

            self.set_state(LoopState::Polling);
            let timeout = deadline.map_or(self.poll_timeout, |d| {
                self.poll_timeout.min(d.saturating_duration_since(now))
            });

            // Cancelling during a poll is safe; no write is in flight.
            let polled = tokio::select! {
                () = self.cancel_token.cancelled() => break StopReason::Cancelled,
                result = source.poll(self.batch_size, timeout) => result,
            };

            let batch = match polled {
                Ok(batch) => {
                    poll_failures = 0;
                    batch
                }
                Err(e) if e.is_retryable() && poll_failures < defaults::POLL_RETRY_LIMIT => {
                    poll_failures += 1;
                    warn!(error = %e, attempt = poll_failures, "Transient poll failure, polling again");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    self.finish(StopReason::Failed);
                    return Err(e.into());
                }
            };

            if batch.is_empty() {
                let empty = self.bump_empty_polls();
                debug!(empty_polls = empty, "Empty poll");
                if self.limits.max_empty_polls.is_some_and(|max| empty > max) {
                    break StopReason::Quiescent;
                }
                continue;
            }

            self.set_state(LoopState::Processing);
            self.progress.send_modify(|p| p.empty_polls = 0);

            match self.process_batch(source, batch).await {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Fatal storage failure; stopping before the failed offset");
                    self.finish(StopReason::Failed);
                    return Err(e);
                }
            }
        };

        self.finish(reason);
        let progress = *self.progress.borrow();
        let report = RunReport {
            progress,
            reason,
            elapsed: started.elapsed(),
        };

        info!(
            reason = %reason,
            consumed = progress.consumed,
            stored = progress.stored,
            skipped = progress.skipped,
            dead_lettered = progress.dead_lettered,
            classifications = progress.classifications,
            elapsed_ms = report.elapsed.as_millis(),
            "Poll loop stopped"
        );
        Ok(report)
    }

    /// Process one batch in delivery order. Returns a stop reason when the
    /// quota is reached inside the batch; only messages up to that point are
    /// committed.
    async fn process_batch<S: MessageSource>(
        &mut self,
        source: &mut S,
        batch: Vec<RawMessage>,
    ) -> Result<Option<StopReason>, PipelineError> {
        let size = batch.len();
        let budget = self
            .limits
            .max_messages
            .map(|max| max.saturating_sub(self.progress.borrow().consumed));

        // Store writes are synchronous sled transactions.
        let ingestor = Arc::clone(&self.ingestor);
        let (results, failure) =
            tokio::task::spawn_blocking(move || ingest_batch(&ingestor, batch, budget)).await?;

        let mut done: BTreeMap<String, u64> = BTreeMap::new();
        let mut stop = None;
        for (raw, outcome) in &results {
            self.hooks.on_message(raw, outcome);
            done.insert(raw.topic.clone(), raw.offset);

            let consumed = self.record(outcome);
            if self.limits.max_messages.is_some_and(|max| consumed >= max) {
                stop = Some(StopReason::Quota);
            }
        }

        if let Some(e) = failure {
            if let Err(commit_err) = commit(source, &done) {
                warn!(error = %commit_err, "Could not commit offsets before failing");
            }
            return Err(e);
        }

        commit(source, &done)?;
        self.progress.send_modify(|p| p.batches += 1);
        debug!(size, processed = results.len(), committed_topics = done.len(), "Batch processed");
        Ok(stop)
    }

    fn record(&self, outcome: &MessageOutcome) -> u64 {
        let mut consumed = 0;
        self.progress.send_modify(|p| {
            p.consumed += 1;
            match outcome {
                MessageOutcome::Stored { rows, .. } => {
                    p.stored += 1;
                    p.classifications += *rows as u64;
                }
                MessageOutcome::Skipped(_) => p.skipped += 1,
                MessageOutcome::DeadLettered { .. } => p.dead_lettered += 1,
            }
            consumed = p.consumed;
        });
        consumed
    }

    fn bump_empty_polls(&self) -> u32 {
        let mut empty = 0;
        self.progress.send_modify(|p| {
            p.empty_polls += 1;
            empty = p.empty_polls;
        });
        empty
    }

    fn set_state(&self, state: LoopState) {
        self.progress.send_if_modified(|p| {
            let changed = p.state != state;
            p.state = state;
            changed
        });
    }

    fn finish(&self, reason: StopReason) {
        self.progress.send_modify(|p| {
            p.state = LoopState::Stopped;
            p.stop = Some(reason);
        });
    }
}

/// Ingest messages in order until `budget` are processed or one fails.
/// Returns the processed messages with their outcomes and the failure, if
/// any; nothing after the failed message is attempted.
fn ingest_batch(
    ingestor: &Ingestor,
    batch: Vec<RawMessage>,
    budget: Option<u64>,
) -> (Vec<(RawMessage, MessageOutcome)>, Option<PipelineError>) {
    let limit = budget.map_or(usize::MAX, |b| usize::try_from(b).unwrap_or(usize::MAX));
    let mut results = Vec::with_capacity(batch.len().min(limit));
    for raw in batch.into_iter().take(limit) {
        match ingestor.ingest(&raw) {
            Ok(outcome) => results.push((raw, outcome)),
            Err(e) => return (results, Some(e)),
        }
    }
    (results, None)
}

fn commit<S: MessageSource>(
    source: &mut S,
    done: &BTreeMap<String, u64>,
) -> Result<(), SourceError> {
    for (topic, &offset) in done {
        source.commit(&TopicOffset {
            topic: topic.clone(),
            offset,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::TopicLog;
    use crate::pipeline::wait_for_stop;
    use crate::decode::{encode_record, ClassificationDecoder, Compression};
    use crate::registry::ClassifierRegistry;
    use crate::storage::StorageError;
    use crate::storage::ClassificationStore;
    use crate::types::{ClassProbability, ClassificationRecord, ClassifierKey};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TOPIC: &str = "classifications";

    struct Harness {
        _dir: tempfile::TempDir,
        db: sled::Db,
        log: TopicLog,
        ingestor: Ingestor,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let log = TopicLog::open(&db).unwrap();
        let store = ClassificationStore::open(&db, &[]).unwrap();
        let registry = Arc::new(ClassifierRegistry::open(&db).unwrap());
        let ingestor = Ingestor::new(ClassificationDecoder::default(), registry, store);
        Harness {
            _dir: dir,
            db,
            log,
            ingestor,
        }
    }

    fn classifier() -> ClassifierKey {
        ClassifierKey::new("FakeBroker", "v1.0", "RandomSnType", "Perfect")
    }

    fn publish(log: &TopicLog, alert_id: i64) {
        publish_from(log, alert_id, classifier());
    }

    fn publish_from(log: &TopicLog, alert_id: i64, classifier: ClassifierKey) {
        let now = Utc::now();
        let record = ClassificationRecord {
            alert_id,
            dia_source_id: alert_id,
            elasticc_publish_timestamp: now,
            broker_ingest_timestamp: now,
            classifier,
            classifications: vec![
                ClassProbability {
                    class_id: 2222,
                    probability: 0.75,
                },
                ClassProbability {
                    class_id: 2223,
                    probability: 0.25,
                },
            ],
        };
        log.publish(TOPIC, &encode_record(&record, Compression::None).unwrap())
            .unwrap();
    }

    fn config(max_messages: Option<u64>, max_empty_polls: Option<u32>) -> PollConfig {
        PollConfig {
            batch_size: 10,
            poll_timeout_ms: 20,
            stop_after_secs: None,
            max_messages,
            max_empty_polls,
        }
    }

    #[tokio::test]
    async fn test_quota_inside_batch_commits_only_processed() {
        let h = harness();
        for i in 0..10 {
            publish(&h.log, i);
        }
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        let store = h.ingestor.store().clone();

        let poll = PollLoop::new(h.ingestor, &config(Some(4), None), (), CancellationToken::new());
        let report = poll.run(&mut consumer).await.unwrap();

        assert_eq!(report.reason, StopReason::Quota);
        assert_eq!(report.progress.stored, 4);
        assert_eq!(report.progress.classifications, 8);
        assert_eq!(store.message_count(), 4);
        assert_eq!(h.log.committed("g", TOPIC).unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_quiescent_stream_stops_and_skips_bad_payloads() {
        let h = harness();
        publish(&h.log, 1);
        h.log.publish(TOPIC, b"not json at all").unwrap();
        publish(&h.log, 2);
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let hook = FnHook(move |_: &RawMessage, _: &MessageOutcome| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let poll = PollLoop::new(h.ingestor, &config(None, Some(1)), hook, CancellationToken::new());
        let mut rx = poll.subscribe();
        let report = poll.run(&mut consumer).await.unwrap();

        assert_eq!(report.reason, StopReason::Quiescent);
        assert_eq!(report.progress.consumed, 3);
        assert_eq!(report.progress.stored, 2);
        assert_eq!(report.progress.skipped, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(h.log.committed("g", TOPIC).unwrap(), Some(3));

        let last = wait_for_stop(&mut rx).await.unwrap();
        assert_eq!(last.stop, Some(StopReason::Quiescent));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness();
        publish(&h.log, 1);
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let report = PollLoop::new(h.ingestor, &config(None, None), (), token)
            .run(&mut consumer)
            .await
            .unwrap();

        assert_eq!(report.reason, StopReason::Cancelled);
        assert_eq!(report.progress.consumed, 0);
        assert_eq!(h.log.committed("g", TOPIC).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_during_idle_poll() {
        let h = harness();
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();

        let token = CancellationToken::new();
        let poll = PollLoop::new(h.ingestor, &config(None, None), (), token.clone());
        let handle = tokio::spawn(async move { poll.run(&mut consumer).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_stops_an_idle_loop() {
        let h = harness();
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();

        let poll = PollLoop::new(h.ingestor, &config(None, None), (), CancellationToken::new())
            .with_limits(StopConditions {
                max_messages: None,
                stop_after: Some(Duration::from_millis(60)),
                max_empty_polls: None,
            });
        let report = poll.run(&mut consumer).await.unwrap();

        assert_eq!(report.reason, StopReason::Deadline);
        assert!(report.elapsed >= Duration::from_millis(60));
        assert!(report.progress.is_stopped());
    }

    #[tokio::test]
    async fn test_restart_resumes_after_committed_offset() {
        let h = harness();
        for i in 0..6 {
            publish(&h.log, i);
        }
        let store = h.ingestor.store().clone();
        let registry = h.ingestor.registry().clone();

        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        PollLoop::new(h.ingestor, &config(Some(3), None), (), CancellationToken::new())
            .run(&mut consumer)
            .await
            .unwrap();
        drop(consumer);

        let ingestor = Ingestor::new(ClassificationDecoder::default(), registry, store.clone());
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        let report = PollLoop::new(ingestor, &config(None, Some(0)), (), CancellationToken::new())
            .run(&mut consumer)
            .await
            .unwrap();

        assert_eq!(report.progress.stored, 3);
        assert_eq!(store.message_count(), 6);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_dead_lettered_and_committed() {
        let h = harness();
        publish(&h.log, 1);
        publish(&h.log, 2);
        let store = h.ingestor.store().clone();

        // Resolve up front so ingestion draws no ids other than its own, then
        // occupy the id the first message will be given.
        h.ingestor.registry().resolve(&classifier()).unwrap();
        let peeked = store.ids().next_message_id().unwrap();
        h.db.open_tree(crate::storage::MESSAGES_TREE)
            .unwrap()
            .insert((peeked.0 + 1).to_be_bytes(), b"{}".to_vec())
            .unwrap();

        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        let report = PollLoop::new(h.ingestor, &config(None, Some(0)), (), CancellationToken::new())
            .run(&mut consumer)
            .await
            .unwrap();

        assert_eq!(report.reason, StopReason::Quiescent);
        assert_eq!(report.progress.dead_lettered, 1);
        assert_eq!(report.progress.stored, 1);
        assert_eq!(h.log.committed("g", TOPIC).unwrap(), Some(2));

        let letters = store.dead_letters().entries().unwrap();
        assert_eq!(letters.len(), 1);
        let (_, letter) = &letters[0];
        assert_eq!((letter.topic.as_str(), letter.offset), (TOPIC, 0));
        assert!(letter.error.contains("brokermessage"));
        // Nothing of the rejected message was written.
        assert_eq!(store.classification_count(), 2);
    }

    #[tokio::test]
    async fn test_storage_failure_stops_before_failed_offset() {
        let h = harness();
        let broken = ClassifierKey::new("OtherBroker", "2.0", "Forest", "");
        publish(&h.log, 1);
        publish_from(&h.log, 2, broken.clone());
        publish(&h.log, 3);

        let by_key = h.db.open_tree(crate::registry::BY_KEY_TREE).unwrap();
        by_key.insert(broken.storage_key(), b"bad".to_vec()).unwrap();
        let store = h.ingestor.store().clone();
        let registry = h.ingestor.registry().clone();

        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        let poll = PollLoop::new(h.ingestor, &config(None, Some(0)), (), CancellationToken::new());
        let mut rx = poll.subscribe();
        let err = poll.run(&mut consumer).await.unwrap_err();

        assert!(matches!(err, PipelineError::Storage(StorageError::Corrupt { .. })));
        let last = wait_for_stop(&mut rx).await.unwrap();
        assert_eq!(last.stop, Some(StopReason::Failed));
        assert_eq!(last.stored, 1);
        // Only the message before the failure is committed.
        assert_eq!(h.log.committed("g", TOPIC).unwrap(), Some(1));
        assert_eq!(store.message_count(), 1);
        drop(consumer);

        // Once the entry is repaired the failed message is redelivered.
        by_key.remove(broken.storage_key()).unwrap();
        let ingestor = Ingestor::new(ClassificationDecoder::default(), registry, store.clone());
        let mut consumer = h.log.subscribe(&[TOPIC.to_string()], "g").unwrap();
        let report = PollLoop::new(ingestor, &config(None, Some(0)), (), CancellationToken::new())
            .run(&mut consumer)
            .await
            .unwrap();
        assert_eq!(report.progress.stored, 2);
        assert_eq!(store.message_count(), 3);
    }
}
