//! Retrying document fetch.
//!
//! Wraps a record source as a restartable producer of indexable documents.
//! Transient unavailability throttles the caller: the fetcher waits out the
//! current backoff interval *before* surfacing the retryable failure, so a
//! naive retry loop is automatically paced.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionSettings, QueryRule, Schema};
use crate::connection::ConnectionManager;
use crate::error::HarvestResult;
use crate::keys::encode_key;
use crate::search::{PagedSearchExecutor, Record, ResultSet};

/// One indexable document: an order-preserving identifier derived from the
/// record key, a lock flag (always set), and the record's attributes.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Document {
    /// Hex-encoded record key, safe as a URL path segment.
    pub id: String,
    /// Always true: harvested documents are locked for the indexer.
    pub lock: bool,
    /// Lower-cased attribute names to ordered string values.
    pub attributes: Record,
}

/// Supplies a full result set on demand. Each call re-runs the whole query;
/// calls may return different results.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn query(&self) -> HarvestResult<ResultSet>;
}

/// A [`RecordSource`] that opens a fresh directory session per query and
/// runs a fixed rule/schema/cap through the paged executor.
#[derive(Debug, Clone)]
pub struct LdapRecordSource {
    settings: ConnectionSettings,
    rule: QueryRule,
    schema: Schema,
    max_results: usize,
    connect_timeout: Duration,
}

impl LdapRecordSource {
    /// Create a source with no result cap and a 30 second connect timeout.
    pub fn new(settings: ConnectionSettings, rule: QueryRule, schema: Schema) -> Self {
        Self {
            settings,
            rule,
            schema,
            max_results: 0,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Cap the number of retained records (0 means unbounded).
    #[must_use]
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl RecordSource for LdapRecordSource {
    async fn query(&self) -> HarvestResult<ResultSet> {
        let mut manager = ConnectionManager::new();
        match manager.open(&self.settings, self.connect_timeout).await {
            Some(session) => {
                PagedSearchExecutor::search(session, &self.rule, &self.schema, self.max_results)
                    .await
            }
            None => {
                let errors = manager.errors()?;
                let summary: Vec<String> = errors
                    .iter()
                    .map(|(kind, message)| format!("{kind}: {message}"))
                    .collect();
                // A server that cannot be reached right now is retryable;
                // the caller's backoff paces the retries.
                Err(crate::error::HarvestError::transient(format!(
                    "connection failed [{}]",
                    summary.join("; ")
                )))
            }
        }
    }
}

/// Default wait times: 1, 2, 4, 8 and 15 minutes.
const DEFAULT_WAIT_TIMES: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(4 * 60),
    Duration::from_secs(8 * 60),
    Duration::from_secs(15 * 60),
];

/// An ordered, non-empty sequence of wait durations with an escalation
/// cursor. The cursor advances on each consecutive transient failure, clamps
/// to the last entry, and resets on success.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    waits: Vec<Duration>,
    cursor: usize,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            waits: DEFAULT_WAIT_TIMES.to_vec(),
            cursor: 0,
        }
    }
}

impl BackoffSchedule {
    /// Create a schedule from the given waits. An empty sequence is
    /// replaced by the default schedule.
    #[must_use]
    pub fn new(waits: Vec<Duration>) -> Self {
        if waits.is_empty() {
            warn!("empty backoff schedule supplied, using default wait times");
            return Self::default();
        }
        Self { waits, cursor: 0 }
    }

    /// The wait at the current cursor position (clamped to the last entry);
    /// advances the cursor.
    pub fn next_wait(&mut self) -> Duration {
        let index = self.cursor.min(self.waits.len() - 1);
        self.cursor = self.cursor.saturating_add(1);
        self.waits[index]
    }

    /// Rewind the cursor to the start of the schedule.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Fetches documents from a record source, throttling transient failures
/// through an instance-scoped backoff schedule.
///
/// Restartable: every `fetch` call re-runs the full query through the
/// source. Distinct fetchers never share an escalation cursor, so unrelated
/// queries cannot perturb each other's retry timing.
#[derive(Debug)]
pub struct DocumentFetcher<S> {
    source: S,
    schedule: BackoffSchedule,
}

impl<S: RecordSource> DocumentFetcher<S> {
    /// Create a fetcher with the default backoff schedule.
    pub fn new(source: S) -> Self {
        Self {
            source,
            schedule: BackoffSchedule::default(),
        }
    }

    /// Create a fetcher with an explicit backoff schedule.
    pub fn with_schedule(source: S, schedule: BackoffSchedule) -> Self {
        Self { source, schedule }
    }

    /// Run the query and produce one document per result entry, in
    /// ascending key order.
    ///
    /// On transient unavailability this waits out the current backoff
    /// interval, advances the escalation cursor, and then returns the
    /// error. Protocol failures propagate immediately with no wait and no
    /// cursor change. Success resets the cursor.
    #[instrument(skip_all)]
    pub async fn fetch(&mut self) -> HarvestResult<Vec<Document>> {
        match self.source.query().await {
            Ok(results) => {
                self.schedule.reset();
                let documents: Vec<Document> = results
                    .into_iter()
                    .map(|(key, attributes)| Document {
                        id: encode_key(&key),
                        lock: true,
                        attributes,
                    })
                    .collect();
                debug!(count = documents.len(), "fetched documents");
                Ok(documents)
            }
            Err(err) if err.is_transient() => {
                let wait = self.schedule.next_wait();
                info!(
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "directory unavailable, waiting before surfacing retryable failure"
                );
                tokio::time::sleep(wait).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarvestError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct ScriptedSource {
        outcomes: Mutex<VecDeque<HarvestResult<ResultSet>>>,
    }

    impl ScriptedSource {
        fn new(outcomes: Vec<HarvestResult<ResultSet>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn query(&self) -> HarvestResult<ResultSet> {
            self.outcomes
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Err(HarvestError::protocol("script exhausted")))
        }
    }

    fn result_set(keys: &[&str]) -> ResultSet {
        keys.iter()
            .map(|key| {
                let mut record = Record::new();
                record.insert("cn".to_string(), vec![(*key).to_string()]);
                ((*key).to_string(), record)
            })
            .collect()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_backoff_escalates_and_clamps() {
        let mut schedule = BackoffSchedule::new(vec![ms(1000), ms(2000), ms(4000)]);
        assert_eq!(schedule.next_wait(), ms(1000));
        assert_eq!(schedule.next_wait(), ms(2000));
        assert_eq!(schedule.next_wait(), ms(4000));
        // Past the end of the schedule the last wait is reused.
        assert_eq!(schedule.next_wait(), ms(4000));
        assert_eq!(schedule.next_wait(), ms(4000));
    }

    #[test]
    fn test_backoff_reset_rewinds_cursor() {
        let mut schedule = BackoffSchedule::new(vec![ms(1000), ms(2000)]);
        schedule.next_wait();
        schedule.next_wait();
        schedule.reset();
        assert_eq!(schedule.next_wait(), ms(1000));
    }

    #[test]
    fn test_backoff_empty_input_uses_default() {
        let mut schedule = BackoffSchedule::new(Vec::new());
        assert_eq!(schedule.next_wait(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_fetch_converts_entries_in_key_order() {
        let source = ScriptedSource::new(vec![Ok(result_set(&["beta", "alpha"]))]);
        let mut fetcher = DocumentFetcher::new(source);

        let documents = fetcher.fetch().await.unwrap();

        assert_eq!(documents.len(), 2);
        // Ascending key order, hex-encoded ids.
        assert_eq!(documents[0].id, encode_key("alpha"));
        assert_eq!(documents[1].id, encode_key("beta"));
        assert!(documents.iter().all(|d| d.lock));
        assert_eq!(documents[0].attributes["cn"], vec!["alpha"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_protocol_failure_propagates_without_wait() {
        let source = ScriptedSource::new(vec![Err(HarvestError::protocol("bad filter"))]);
        let mut fetcher = DocumentFetcher::with_schedule(
            source,
            BackoffSchedule::new(vec![Duration::from_secs(3600)]),
        );

        let start = Instant::now();
        let err = fetcher.fetch().await.unwrap_err();

        assert!(matches!(err, HarvestError::ProtocolFailure { .. }));
        assert_eq!(start.elapsed(), ms(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_waits_escalate_clamp_and_reset() {
        let source = ScriptedSource::new(vec![
            Err(HarvestError::transient("down")),
            Err(HarvestError::transient("down")),
            Err(HarvestError::transient("down")),
            Err(HarvestError::transient("down")),
            Ok(result_set(&["back"])),
            Err(HarvestError::transient("down again")),
        ]);
        let mut fetcher = DocumentFetcher::with_schedule(
            source,
            BackoffSchedule::new(vec![ms(1000), ms(2000), ms(4000)]),
        );

        for expected in [1000u64, 2000, 4000, 4000] {
            let before = Instant::now();
            let err = fetcher.fetch().await.unwrap_err();
            assert!(err.is_transient());
            assert_eq!(before.elapsed(), ms(expected));
        }

        // Success resets the cursor without waiting.
        let before = Instant::now();
        let documents = fetcher.fetch().await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(before.elapsed(), ms(0));

        // The next failure starts the schedule over.
        let before = Instant::now();
        let err = fetcher.fetch().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(before.elapsed(), ms(1000));
    }

    #[tokio::test]
    async fn test_document_serializes_to_json() {
        let source = ScriptedSource::new(vec![Ok(result_set(&["abc"]))]);
        let mut fetcher = DocumentFetcher::new(source);

        let documents = fetcher.fetch().await.unwrap();
        let json = serde_json::to_value(&documents[0]).unwrap();

        assert_eq!(json["id"], "616263");
        assert_eq!(json["lock"], true);
        assert_eq!(json["attributes"]["cn"][0], "abc");
    }
}
