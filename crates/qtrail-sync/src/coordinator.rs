use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use qtrail_core::{
    AmbiguousExecution, ErrorKind, OutcomeStatus, ProcessingWindow, QueryExecutionRecord, RawEvent,
    RecordProvenance, RejectReason, Rejected, WindowCounts, WindowFailure, WindowLifecycle,
    WindowOutcome, WindowStage, START_QUERY_EXECUTION,
};
use qtrail_sources::{enrich_records, normalize, EventSourceClient, ExecutionDetails};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::dedup;
use crate::writer::PartitionWriter;

/// Normalized records of one window plus everything that did not make it.
#[derive(Debug, Clone, Default)]
pub struct NormalizedWindow {
    pub records: Vec<QueryExecutionRecord>,
    pub rejected: Vec<Rejected>,
}

/// Normalizes `events`, rejecting records whose start time falls outside `window`.
pub fn normalize_window(window: &ProcessingWindow, events: &[RawEvent]) -> NormalizedWindow {
    let range = window.time_range();
    let mut out = NormalizedWindow::default();
    for raw in events {
        match normalize(raw) {
            Ok(record) if range.contains(record.start_time) => out.records.push(record),
            Ok(record) => out.rejected.push(Rejected::new(
                Some(record.source_event_id),
                RejectReason::OutsideWindow,
                format!(
                    "execution {} started {} outside {}",
                    record.execution_id, record.start_time, window.key
                ),
            )),
            Err(rejected) => out.rejected.push(rejected),
        }
    }
    out
}

/// Drives one window through fetch, normalize, dedup and write.
pub struct RunCoordinator {
    events: EventSourceClient,
    details: Option<Arc<dyn ExecutionDetails>>,
    writer: PartitionWriter,
}

struct WindowRun {
    lifecycle: WindowLifecycle,
    counts: WindowCounts,
    rejections: BTreeMap<RejectReason, usize>,
    rejected: Vec<Rejected>,
    ambiguous: Vec<AmbiguousExecution>,
}

impl WindowRun {
    fn enter(&mut self, stage: WindowStage) {
        if let Err(err) = self.lifecycle.advance(stage) {
            warn!(error = %err, "ignoring illegal stage transition");
        }
    }
}

impl RunCoordinator {
    pub fn new(events: EventSourceClient, writer: PartitionWriter) -> Self {
        Self {
            events,
            details: None,
            writer,
        }
    }

    pub fn with_execution_details(mut self, details: Arc<dyn ExecutionDetails>) -> Self {
        self.details = Some(details);
        self
    }

    pub fn writer(&self) -> &PartitionWriter {
        &self.writer
    }

    pub async fn run_window(&self, window: ProcessingWindow) -> WindowOutcome {
        self.run_window_at(window, Utc::now()).await
    }

    /// Processes `window` as if the wall clock read `now`. Never returns an error: failures
    /// are carried in the outcome.
    pub async fn run_window_at(&self, window: ProcessingWindow, now: DateTime<Utc>) -> WindowOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("window", key = %window.key, format = %window.format, %run_id);
        self.process(run_id, window, now).instrument(span).await
    }

    async fn process(&self, run_id: Uuid, window: ProcessingWindow, now: DateTime<Utc>) -> WindowOutcome {
        let started_at = Utc::now();
        let mut run = WindowRun {
            lifecycle: WindowLifecycle::default(),
            counts: WindowCounts::default(),
            rejections: BTreeMap::new(),
            rejected: Vec::new(),
            ambiguous: Vec::new(),
        };

        run.enter(WindowStage::Fetching);
        let fetched: Result<Vec<RawEvent>, _> = self
            .events
            .fetch_events_at(window.time_range(), START_QUERY_EXECUTION, now)
            .try_collect()
            .await;
        let events = match fetched {
            Ok(events) => events,
            Err(err) => {
                return finish_failed(run_id, window, run, err.kind(), err.to_string(), started_at);
            }
        };
        run.counts.events_seen = events.len();
        debug!(events = events.len(), "events fetched");

        run.enter(WindowStage::Normalizing);
        let normalized = normalize_window(&window, &events);
        for rejected in &normalized.rejected {
            debug!(
                event_id = rejected.event_id.as_deref().unwrap_or("-"),
                reason = %rejected.reason,
                detail = %rejected.detail,
                "event rejected"
            );
            *run.rejections.entry(rejected.reason).or_default() += 1;
        }
        run.counts.rejected_count = normalized.rejected.len();
        run.rejected = normalized.rejected;

        let mut deduped = dedup(normalized.records);
        run.counts.duplicate_count = deduped.duplicate_count;
        run.counts.ambiguous_count = deduped.ambiguous_count;
        for record in deduped.records.iter().filter(|r| r.ambiguous) {
            warn!(
                execution_id = %record.execution_id,
                candidates = ?record.candidate_usernames,
                "ambiguous identity"
            );
            run.ambiguous.push(AmbiguousExecution {
                execution_id: record.execution_id.clone(),
                candidate_usernames: record.candidate_usernames.clone(),
            });
        }

        if let Some(details) = &self.details {
            let failures = enrich_records(details.as_ref(), &mut deduped.records).await;
            if failures > 0 {
                warn!(failures, "execution detail lookups failed");
            }
            run.counts.enrichment_failures = failures;
        }

        run.enter(WindowStage::Writing);
        let artifact = match self.writer.write(&window, &deduped.records).await {
            Ok(artifact) => artifact,
            Err(err) => {
                return finish_failed(
                    run_id,
                    window,
                    run,
                    ErrorKind::WriteFailure,
                    err.to_string(),
                    started_at,
                );
            }
        };
        run.counts.records_written = deduped.records.len();

        run.enter(WindowStage::Done);
        let status = if run.counts.rejected_count > 0
            || run.counts.ambiguous_count > 0
            || run.counts.enrichment_failures > 0
        {
            OutcomeStatus::Partial
        } else {
            OutcomeStatus::Success
        };
        info!(
            ?status,
            events_seen = run.counts.events_seen,
            records_written = run.counts.records_written,
            rejected = run.counts.rejected_count,
            duplicates = run.counts.duplicate_count,
            ambiguous = run.counts.ambiguous_count,
            enrichment_failures = run.counts.enrichment_failures,
            key = %artifact.key,
            "window complete"
        );

        WindowOutcome {
            run_id,
            window,
            status,
            stages: run.lifecycle.into_history(),
            counts: run.counts,
            rejections: run.rejections,
            rejected: run.rejected,
            ambiguous: run.ambiguous,
            provenance: deduped.records.iter().map(RecordProvenance::from).collect(),
            artifact: Some(artifact),
            failure: None,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn finish_failed(
    run_id: Uuid,
    window: ProcessingWindow,
    mut run: WindowRun,
    kind: ErrorKind,
    message: String,
    started_at: DateTime<Utc>,
) -> WindowOutcome {
    run.enter(WindowStage::Failed);
    warn!(?kind, error = %message, "window failed");
    WindowOutcome {
        run_id,
        window,
        status: OutcomeStatus::Failure,
        stages: run.lifecycle.into_history(),
        counts: run.counts,
        rejections: run.rejections,
        rejected: run.rejected,
        ambiguous: run.ambiguous,
        provenance: Vec::new(),
        artifact: None,
        failure: Some(WindowFailure { kind, message }),
        started_at,
        finished_at: Utc::now(),
    }
}

/// Runs `windows` with at most `max_concurrent` in flight; outcomes come back in input order.
pub async fn run_windows(
    coordinator: Arc<RunCoordinator>,
    windows: Vec<ProcessingWindow>,
    max_concurrent: usize,
) -> Result<Vec<WindowOutcome>> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut join_set = JoinSet::new();

    for (index, window) in windows.into_iter().enumerate() {
        let coordinator = Arc::clone(&coordinator);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| anyhow!("window semaphore closed: {e}"))?;
            Ok::<_, anyhow::Error>((index, coordinator.run_window(window).await))
        });
    }

    let mut outcomes = Vec::with_capacity(join_set.len());
    while let Some(joined) = join_set.join_next().await {
        let (index, outcome) = joined.map_err(|e| anyhow!("window task failed: {e}"))??;
        outcomes.push((index, outcome));
    }
    outcomes.sort_by_key(|(index, _)| *index);
    Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use qtrail_core::{OutputFormat, PartitionKey};
    use qtrail_sources::{
        EventSource, ExecutionDetail, LookupPage, LookupRequest, SourceError, StaticEventSource,
        StaticExecutionDetails,
    };
    use qtrail_storage::{ArtifactStore, BackoffPolicy};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    struct DeniedDetails;

    #[async_trait]
    impl ExecutionDetails for DeniedDetails {
        async fn describe(&self, _execution_id: &str) -> Result<Option<ExecutionDetail>, SourceError> {
            Err(SourceError::Rejected("AccessDeniedException".into()))
        }
    }

    struct ThrottledSource;

    #[async_trait]
    impl EventSource for ThrottledSource {
        fn name(&self) -> &str {
            "throttled"
        }

        fn retention(&self) -> Option<chrono::Duration> {
            None
        }

        async fn lookup_page(&self, _request: &LookupRequest) -> Result<LookupPage, SourceError> {
            Err(SourceError::Throttled("Rate exceeded".into()))
        }
    }

    fn window() -> ProcessingWindow {
        ProcessingWindow::new(PartitionKey::new(2025, 8, 28, 13).unwrap(), OutputFormat::Csv)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 29, 6, 0, 0).single().unwrap()
    }

    fn raw(event_id: &str, execution_id: &str, user: &str, time: &str) -> RawEvent {
        let payload = json!({
            "eventName": "StartQueryExecution",
            "eventID": event_id,
            "eventTime": time,
            "userIdentity": {"type": "IAMUser", "userName": user},
            "requestParameters": {"workGroup": "primary", "queryString": "SELECT 1"},
            "responseElements": {"queryExecutionId": execution_id}
        });
        RawEvent {
            event_id: Some(event_id.to_string()),
            event_name: Some(START_QUERY_EXECUTION.to_string()),
            event_time: DateTime::parse_from_rfc3339(time).ok().map(|t| t.with_timezone(&Utc)),
            username: None,
            cloud_trail_event: Some(payload.to_string()),
        }
    }

    fn coordinator(root: &std::path::Path, events: Vec<RawEvent>) -> RunCoordinator {
        let source = StaticEventSource::new(events);
        let client = EventSourceClient::new(Arc::new(source), BackoffPolicy::default());
        RunCoordinator::new(client, PartitionWriter::new(ArtifactStore::new(root), "reports"))
    }

    #[tokio::test]
    async fn clean_window_succeeds_with_full_history() {
        let dir = tempdir().unwrap();
        let coord = coordinator(
            dir.path(),
            vec![
                raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z"),
                raw("e2", "qe-2", "bob", "2025-08-28T13:10:00Z"),
            ],
        );
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(
            outcome.stages,
            vec![
                WindowStage::Pending,
                WindowStage::Fetching,
                WindowStage::Normalizing,
                WindowStage::Writing,
                WindowStage::Done
            ]
        );
        assert_eq!(outcome.counts.events_seen, 2);
        assert_eq!(outcome.counts.records_written, 2);
        assert!(outcome.counts.accounts_for_every_event());
        assert!(outcome.artifact.is_some());
    }

    #[test]
    fn out_of_window_records_are_rejected_not_moved() {
        let events = vec![
            raw("e1", "qe-1", "alice", "2025-08-28T13:59:59Z"),
            raw("e2", "qe-2", "alice", "2025-08-28T14:00:00Z"),
        ];
        let out = normalize_window(&window(), &events);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].reason, RejectReason::OutsideWindow);
        assert_eq!(out.rejected[0].event_id.as_deref(), Some("e2"));
    }

    #[tokio::test]
    async fn rejections_and_ambiguity_make_the_outcome_partial() {
        let dir = tempdir().unwrap();
        let mut broken = raw("e3", "qe-3", "carol", "2025-08-28T13:20:00Z");
        broken.cloud_trail_event = Some("{truncated".to_string());
        let coord = coordinator(
            dir.path(),
            vec![
                raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z"),
                raw("e2", "qe-1", "mallory", "2025-08-28T13:05:00Z"),
                broken,
            ],
        );
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.final_stage(), WindowStage::Done);
        assert_eq!(outcome.counts.events_seen, 3);
        assert_eq!(outcome.counts.records_written, 1);
        assert_eq!(outcome.counts.duplicate_count, 1);
        assert_eq!(outcome.counts.rejected_count, 1);
        assert_eq!(outcome.counts.ambiguous_count, 1);
        assert_eq!(outcome.rejections.get(&RejectReason::UnparseablePayload), Some(&1));
        assert!(outcome.counts.accounts_for_every_event());
    }

    #[tokio::test]
    async fn retention_violation_fails_before_fetching_anything() {
        let dir = tempdir().unwrap();
        let coord = coordinator(dir.path(), Vec::new());
        let source = StaticEventSource::new(Vec::new()).with_retention(chrono::Duration::days(90));
        let coord = RunCoordinator::new(
            EventSourceClient::new(Arc::new(source), BackoffPolicy::default()),
            coord.writer().clone(),
        );
        let late = now() + chrono::Duration::days(200);
        let outcome = coord.run_window_at(window(), late).await;
        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(
            outcome.stages,
            vec![WindowStage::Pending, WindowStage::Fetching, WindowStage::Failed]
        );
        assert_eq!(
            outcome.failure.map(|f| f.kind),
            Some(ErrorKind::RetentionExceeded)
        );
        assert!(outcome.artifact.is_none());
        assert!(!coord.writer().store().exists(&coord.writer().key_for(&window())).await.unwrap());
    }

    #[tokio::test]
    async fn enrichment_fills_end_time_and_missing_text() {
        let dir = tempdir().unwrap();
        let completed = Utc.with_ymd_and_hms(2025, 8, 28, 13, 6, 30).single().unwrap();
        let details = StaticExecutionDetails::new().with(
            "qe-1",
            ExecutionDetail {
                workgroup: Some("ignored".to_string()),
                query_text: None,
                completed_at: Some(completed),
            },
        );
        let coord = coordinator(
            dir.path(),
            vec![raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z")],
        )
        .with_execution_details(Arc::new(details));
        let outcome = coord.run_window_at(window(), now()).await;
        let key = outcome.artifact.unwrap().key;
        let text = String::from_utf8(coord.writer().store().read(&key).await.unwrap().unwrap()).unwrap();
        assert!(text.contains("qe-1,alice,primary,SELECT 1,2025-08-28T13:05:00Z,2025-08-28T13:06:30Z,false"));
    }

    #[tokio::test]
    async fn failed_enrichment_makes_the_outcome_partial() {
        let dir = tempdir().unwrap();
        let coord = coordinator(
            dir.path(),
            vec![raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z")],
        )
        .with_execution_details(Arc::new(DeniedDetails));
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.status, OutcomeStatus::Partial);
        assert_eq!(outcome.final_stage(), WindowStage::Done);
        assert_eq!(outcome.counts.enrichment_failures, 1);
        assert_eq!(outcome.counts.records_written, 1);
        assert!(outcome.counts.accounts_for_every_event());
        assert!(outcome.artifact.is_some());
    }

    #[tokio::test]
    async fn csv_outcome_keeps_every_candidate_username() {
        let dir = tempdir().unwrap();
        let coord = coordinator(
            dir.path(),
            vec![
                raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z"),
                raw("e2", "qe-1", "mallory", "2025-08-28T13:05:00Z"),
            ],
        );
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.window.format, OutputFormat::Csv);
        assert_eq!(outcome.ambiguous.len(), 1);
        assert_eq!(outcome.ambiguous[0].execution_id, "qe-1");
        assert_eq!(outcome.ambiguous[0].candidate_usernames, vec!["alice", "mallory"]);
    }

    #[tokio::test]
    async fn every_fetched_event_id_is_traceable_from_the_outcome() {
        let dir = tempdir().unwrap();
        let mut broken = raw("e4", "qe-3", "carol", "2025-08-28T13:20:00Z");
        broken.cloud_trail_event = Some("{truncated".to_string());
        let mut late = raw("e3", "qe-2", "bob", "2025-08-28T14:00:00Z");
        late.event_time = None;
        let events = vec![
            raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z"),
            raw("e2", "qe-1", "alice", "2025-08-28T13:05:00Z"),
            raw("e2", "qe-1", "alice", "2025-08-28T13:05:00Z"),
            late,
            broken,
        ];
        let mut expected: Vec<_> = events.iter().map(|e| e.event_id.clone()).collect();
        expected.sort();

        let coord = coordinator(dir.path(), events);
        let outcome = coord.run_window_at(window(), now()).await;
        let mut accounted: Vec<_> = outcome
            .accounted_event_ids()
            .into_iter()
            .map(|id| id.map(str::to_string))
            .collect();
        accounted.sort();

        assert_eq!(accounted.len(), outcome.counts.events_seen);
        assert_eq!(accounted, expected);
        assert_eq!(outcome.provenance.len(), 1);
        assert_eq!(outcome.provenance[0].source_event_id, "e1");
        assert_eq!(outcome.provenance[0].duplicate_event_ids, vec!["e2", "e2"]);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.rejections.get(&RejectReason::OutsideWindow), Some(&1));
    }

    #[tokio::test]
    async fn unwritable_storage_fails_at_the_write_stage() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, b"occupied").unwrap();
        let coord = coordinator(
            &blocker,
            vec![
                raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z"),
                raw("e2", "qe-1", "mallory", "2025-08-28T13:05:00Z"),
            ],
        );
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(
            outcome.stages,
            vec![
                WindowStage::Pending,
                WindowStage::Fetching,
                WindowStage::Normalizing,
                WindowStage::Writing,
                WindowStage::Failed
            ]
        );
        assert_eq!(
            outcome.failure.as_ref().map(|f| f.kind),
            Some(ErrorKind::WriteFailure)
        );
        assert!(outcome.artifact.is_none());
        assert_eq!(outcome.counts.records_written, 0);
        assert_eq!(outcome.ambiguous.len(), 1);
        assert!(outcome.provenance.is_empty());
    }

    #[tokio::test]
    async fn exhausted_source_fails_the_window_not_partially() {
        let dir = tempdir().unwrap();
        let instant = BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let coord = RunCoordinator::new(
            EventSourceClient::new(Arc::new(ThrottledSource), instant),
            PartitionWriter::new(ArtifactStore::new(dir.path()), "reports"),
        );
        let outcome = coord.run_window_at(window(), now()).await;
        assert_eq!(outcome.status, OutcomeStatus::Failure);
        assert_eq!(
            outcome.stages,
            vec![WindowStage::Pending, WindowStage::Fetching, WindowStage::Failed]
        );
        assert_eq!(
            outcome.failure.as_ref().map(|f| f.kind),
            Some(ErrorKind::SourceUnavailable)
        );
        assert_eq!(outcome.counts.events_seen, 0);
        assert!(outcome.artifact.is_none());
        assert!(!coord.writer().store().exists(&coord.writer().key_for(&window())).await.unwrap());
    }

    #[tokio::test]
    async fn local_fan_out_preserves_plan_order() {
        let dir = tempdir().unwrap();
        let coord = Arc::new(coordinator(
            dir.path(),
            vec![raw("e1", "qe-1", "alice", "2025-08-28T13:05:00Z")],
        ));
        let windows: Vec<_> = (0..6)
            .map(|h| ProcessingWindow::new(PartitionKey::new(2025, 8, 28, 10 + h).unwrap(), OutputFormat::Json))
            .collect();
        let outcomes = run_windows(coord, windows.clone(), 2).await.unwrap();
        assert_eq!(
            outcomes.iter().map(|o| o.window).collect::<Vec<_>>(),
            windows
        );
        let written: usize = outcomes.iter().map(|o| o.counts.records_written).sum();
        assert_eq!(written, 1);
    }
}
