use chrono::{DateTime, SecondsFormat, Utc};
use qtrail_core::{ArtifactSummary, OutputFormat, ProcessingWindow, QueryExecutionRecord};
use qtrail_storage::{ArtifactStore, StoredArtifact};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::debug;

pub const CSV_HEADER: [&str; 7] = [
    "execution_id",
    "username",
    "workgroup",
    "query_text",
    "start_time",
    "end_time",
    "ambiguous",
];

pub type WriteResult = ArtifactSummary;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("encoding csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("encoding json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("flushing csv buffer: {0}")]
    Buffer(String),
    #[error("storing {key}: {source:#}")]
    Store {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

fn render_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
struct JsonRow<'a> {
    execution_id: &'a str,
    username: &'a str,
    workgroup: Option<&'a str>,
    query_text: Option<&'a str>,
    start_time: String,
    end_time: Option<String>,
    ambiguous: bool,
    candidate_usernames: &'a [String],
}

impl<'a> From<&'a QueryExecutionRecord> for JsonRow<'a> {
    fn from(record: &'a QueryExecutionRecord) -> Self {
        Self {
            execution_id: &record.execution_id,
            username: &record.username,
            workgroup: record.workgroup.as_deref(),
            query_text: record.query_text.as_deref(),
            start_time: render_ts(record.start_time),
            end_time: record.end_time.map(render_ts),
            ambiguous: record.ambiguous,
            candidate_usernames: &record.candidate_usernames,
        }
    }
}

/// Header row plus one row per record; absent values are empty cells.
pub fn encode_csv(records: &[QueryExecutionRecord]) -> Result<Vec<u8>, WriteError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        let start = render_ts(record.start_time);
        let end = record.end_time.map(render_ts).unwrap_or_default();
        writer.write_record([
            record.execution_id.as_str(),
            record.username.as_str(),
            record.workgroup.as_deref().unwrap_or_default(),
            record.query_text.as_deref().unwrap_or_default(),
            start.as_str(),
            end.as_str(),
            if record.ambiguous { "true" } else { "false" },
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| WriteError::Buffer(e.to_string()))
}

/// Pretty-printed array; absent values are `null`.
pub fn encode_json(records: &[QueryExecutionRecord]) -> Result<Vec<u8>, WriteError> {
    let rows: Vec<JsonRow<'_>> = records.iter().map(JsonRow::from).collect();
    Ok(serde_json::to_vec_pretty(&rows)?)
}

pub fn encode(format: OutputFormat, records: &[QueryExecutionRecord]) -> Result<Vec<u8>, WriteError> {
    match format {
        OutputFormat::Csv => encode_csv(records),
        OutputFormat::Json => encode_json(records),
    }
}

fn summary(stored: StoredArtifact) -> WriteResult {
    ArtifactSummary {
        key: stored.key,
        bytes: stored.byte_size,
        sha256: stored.content_hash,
        replaced_existing: stored.replaced_existing,
    }
}

/// Writes one partition artifact per window, replacing whatever was there.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    store: ArtifactStore,
    prefix: String,
}

impl PartitionWriter {
    pub fn new(store: ArtifactStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn key_for(&self, window: &ProcessingWindow) -> String {
        window.artifact_key(&self.prefix)
    }

    pub async fn write(
        &self,
        window: &ProcessingWindow,
        records: &[QueryExecutionRecord],
    ) -> Result<WriteResult, WriteError> {
        let body = encode(window.format, records)?;
        self.write_stream(window, body.as_slice()).await
    }

    /// Streams an already-encoded body into the window's key.
    pub async fn write_stream<R>(&self, window: &ProcessingWindow, body: R) -> Result<WriteResult, WriteError>
    where
        R: AsyncRead + Unpin,
    {
        let key = self.key_for(window);
        let stored = self
            .store
            .replace_from_reader(&key, body)
            .await
            .map_err(|source| WriteError::Store {
                key: key.clone(),
                source,
            })?;
        debug!(
            key = %stored.key,
            bytes = stored.byte_size,
            replaced = stored.replaced_existing,
            "partition written"
        );
        Ok(summary(stored))
    }
}
