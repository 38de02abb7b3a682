//! Core domain model for the hourly Athena query-execution audit.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "qtrail-core";

/// CloudTrail event name emitted by Athena when a query is submitted.
pub const START_QUERY_EXECUTION: &str = "StartQueryExecution";

/// Closed-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The one-hour range whose start is `ts` truncated to the hour.
    pub fn hour_containing(ts: DateTime<Utc>) -> Self {
        PartitionKey::containing(ts).time_range()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionKeyError {
    #[error("invalid calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[error("hour {0} is outside 0..=23")]
    InvalidHour(u32),
    #[error("malformed partition key {0:?}, expected YYYY-MM-DDTHH")]
    Malformed(String),
}

/// `(year, month, day, hour)` in UTC. Always a valid calendar hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PartitionKey {
    date: NaiveDate,
    hour: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32, day: u32, hour: u32) -> Result<Self, PartitionKeyError> {
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or(PartitionKeyError::InvalidDate { year, month, day })?;
        Self::for_date_hour(date, hour)
    }

    pub fn for_date_hour(date: NaiveDate, hour: u32) -> Result<Self, PartitionKeyError> {
        if hour > 23 {
            return Err(PartitionKeyError::InvalidHour(hour));
        }
        Ok(Self { date, hour })
    }

    /// Partition that owns `ts`: `floor(ts, 1 hour)`.
    pub fn containing(ts: DateTime<Utc>) -> Self {
        Self {
            date: ts.date_naive(),
            hour: ts.hour(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn year(&self) -> i32 {
        chrono::Datelike::year(&self.date)
    }

    pub fn month(&self) -> u32 {
        chrono::Datelike::month(&self.date)
    }

    pub fn day(&self) -> u32 {
        chrono::Datelike::day(&self.date)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn start(&self) -> DateTime<Utc> {
        (self.date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(self.hour))).and_utc()
    }

    pub fn time_range(&self) -> TimeRange {
        let start = self.start();
        TimeRange::new(start, start + Duration::hours(1))
    }

    /// `year=YYYY/month=MM/day=DD/hour=HH`
    pub fn path_segment(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}/hour={:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour
        )
    }

    /// `report_YYYY_MM_DD_hHH`
    pub fn file_stem(&self) -> String {
        format!(
            "report_{:04}_{:02}_{:02}_h{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour
        )
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{:02}", self.date.format("%Y-%m-%d"), self.hour)
    }
}

impl FromStr for PartitionKey {
    type Err = PartitionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PartitionKeyError::Malformed(s.to_string());
        let (date, hour) = s.split_once('T').ok_or_else(malformed)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| malformed())?;
        if hour.len() != 2 {
            return Err(malformed());
        }
        let hour = hour.parse::<u32>().map_err(|_| malformed())?;
        Self::for_date_hour(date, hour)
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = PartitionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported output type {0:?}, expected csv or json")]
pub struct UnknownOutputFormat(pub String);

impl FromStr for OutputFormat {
    type Err = UnknownOutputFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(UnknownOutputFormat(s.to_string())),
        }
    }
}

/// One unit of work: a single hour partition rendered in one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessingWindow {
    pub key: PartitionKey,
    pub format: OutputFormat,
}

impl ProcessingWindow {
    pub fn new(key: PartitionKey, format: OutputFormat) -> Self {
        Self { key, format }
    }

    pub fn time_range(&self) -> TimeRange {
        self.key.time_range()
    }

    /// Storage key of the artifact, e.g.
    /// `reports/year=2025/month=08/day=28/hour=13/report_2025_08_28_h13.csv`.
    pub fn artifact_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let tail = format!(
            "{}/{}.{}",
            self.key.path_segment(),
            self.key.file_stem(),
            self.format.extension()
        );
        if prefix.is_empty() {
            tail
        } else {
            format!("{prefix}/{tail}")
        }
    }
}

/// An audit event as returned by the event source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub username: Option<String>,
    /// Embedded CloudTrail record, itself a JSON document.
    pub cloud_trail_event: Option<String>,
}

/// Canonical row: one Athena query execution observed in an hour window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExecutionRecord {
    pub execution_id: String,
    pub username: String,
    pub workgroup: Option<String>,
    pub query_text: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub source_event_id: String,
    #[serde(default)]
    pub ambiguous: bool,
    /// Every distinct username seen for this execution, populated when `ambiguous`.
    #[serde(default)]
    pub candidate_usernames: Vec<String>,
    /// Event ids of deliveries merged into this record.
    #[serde(default)]
    pub duplicate_event_ids: Vec<String>,
}

impl QueryExecutionRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::containing(self.start_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingPayload,
    UnparseablePayload,
    UnrecognizedEvent,
    MissingExecutionId,
    MissingUsername,
    MissingEventTime,
    OutsideWindow,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPayload => "missing_payload",
            Self::UnparseablePayload => "unparseable_payload",
            Self::UnrecognizedEvent => "unrecognized_event",
            Self::MissingExecutionId => "missing_execution_id",
            Self::MissingUsername => "missing_username",
            Self::MissingEventTime => "missing_event_time",
            Self::OutsideWindow => "outside_window",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw event the normalizer could not turn into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub event_id: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejected {
    pub fn new(event_id: Option<String>, reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            event_id,
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnavailable,
    RetentionExceeded,
    MalformedEvent,
    AmbiguousIdentity,
    InvalidRange,
    WriteFailure,
}

impl ErrorKind {
    /// Window-level kinds end the window in `FAILED`; the rest are per-record.
    pub fn is_window_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::RetentionExceeded | Self::InvalidRange | Self::WriteFailure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStage {
    Pending,
    Fetching,
    Normalizing,
    Writing,
    Done,
    Failed,
}

impl WindowStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_advance_to(&self, next: WindowStage) -> bool {
        use WindowStage::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Normalizing)
                | (Normalizing, Writing)
                | (Writing, Done)
                | (Fetching, Failed)
                | (Normalizing, Failed)
                | (Writing, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal window transition {from:?} -> {to:?}")]
pub struct StageTransitionError {
    pub from: WindowStage,
    pub to: WindowStage,
}

/// Sequential stage history of one window run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLifecycle {
    history: Vec<WindowStage>,
}

impl Default for WindowLifecycle {
    fn default() -> Self {
        Self {
            history: vec![WindowStage::Pending],
        }
    }
}

impl WindowLifecycle {
    pub fn current(&self) -> WindowStage {
        self.history
            .last()
            .copied()
            .unwrap_or(WindowStage::Pending)
    }

    pub fn advance(&mut self, next: WindowStage) -> Result<(), StageTransitionError> {
        let from = self.current();
        if !from.can_advance_to(next) {
            return Err(StageTransitionError { from, to: next });
        }
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[WindowStage] {
        &self.history
    }

    pub fn into_history(self) -> Vec<WindowStage> {
        self.history
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowCounts {
    pub events_seen: usize,
    pub records_written: usize,
    pub rejected_count: usize,
    pub ambiguous_count: usize,
    pub duplicate_count: usize,
    /// Execution-detail lookups that errored. Not part of the event accounting.
    #[serde(default)]
    pub enrichment_failures: usize,
}

impl WindowCounts {
    /// Every raw event is written, rejected, or merged into another record.
    pub fn accounts_for_every_event(&self) -> bool {
        self.records_written + self.rejected_count + self.duplicate_count == self.events_seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub key: String,
    pub bytes: u64,
    pub sha256: String,
    pub replaced_existing: bool,
}

/// Which raw events ended up in a written record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordProvenance {
    pub execution_id: String,
    pub source_event_id: String,
    /// One entry per extra delivery merged into the record, repeats included.
    #[serde(default)]
    pub duplicate_event_ids: Vec<String>,
}

impl From<&QueryExecutionRecord> for RecordProvenance {
    fn from(record: &QueryExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            source_event_id: record.source_event_id.clone(),
            duplicate_event_ids: record.duplicate_event_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousExecution {
    pub execution_id: String,
    pub candidate_usernames: Vec<String>,
}

/// Structured result of one window run; the only error-reporting channel upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub run_id: Uuid,
    pub window: ProcessingWindow,
    pub status: OutcomeStatus,
    pub stages: Vec<WindowStage>,
    pub counts: WindowCounts,
    pub rejections: BTreeMap<RejectReason, usize>,
    /// Every rejected event with its reason.
    #[serde(default)]
    pub rejected: Vec<Rejected>,
    #[serde(default)]
    pub ambiguous: Vec<AmbiguousExecution>,
    #[serde(default)]
    pub provenance: Vec<RecordProvenance>,
    pub artifact: Option<ArtifactSummary>,
    pub failure: Option<WindowFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WindowOutcome {
    pub fn final_stage(&self) -> WindowStage {
        self.stages.last().copied().unwrap_or(WindowStage::Pending)
    }

    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failure
    }

    /// Event ids the outcome accounts for: written, merged and rejected.
    pub fn accounted_event_ids(&self) -> Vec<Option<&str>> {
        let written = self.provenance.iter().flat_map(|p| {
            std::iter::once(Some(p.source_event_id.as_str()))
                .chain(p.duplicate_event_ids.iter().map(|id| Some(id.as_str())))
        });
        let rejected = self.rejected.iter().map(|r| r.event_id.as_deref());
        written.chain(rejected).collect()
    }
}
