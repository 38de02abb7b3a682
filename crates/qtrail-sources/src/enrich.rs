//! Optional Athena `GetQueryExecution` lookups that fill fields CloudTrail left blank.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qtrail_core::QueryExecutionRecord;
use qtrail_storage::{retry_with_backoff, AwsJsonClient, BackoffPolicy, CallError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cloudtrail::WireTimestamp;
use crate::SourceError;

pub const GET_QUERY_EXECUTION_TARGET: &str = "AmazonAthena.GetQueryExecution";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionDetail {
    pub workgroup: Option<String>,
    pub query_text: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Looks up an execution by id. `Ok(None)` means the service no longer knows it.
#[async_trait]
pub trait ExecutionDetails: Send + Sync {
    async fn describe(&self, execution_id: &str) -> Result<Option<ExecutionDetail>, SourceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoExecutionDetails;

#[async_trait]
impl ExecutionDetails for NoExecutionDetails {
    async fn describe(&self, _execution_id: &str) -> Result<Option<ExecutionDetail>, SourceError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticExecutionDetails {
    details: HashMap<String, ExecutionDetail>,
}

impl StaticExecutionDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, execution_id: impl Into<String>, detail: ExecutionDetail) -> Self {
        self.details.insert(execution_id.into(), detail);
        self
    }
}

#[async_trait]
impl ExecutionDetails for StaticExecutionDetails {
    async fn describe(&self, execution_id: &str) -> Result<Option<ExecutionDetail>, SourceError> {
        Ok(self.details.get(execution_id).cloned())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryExecutionResponse {
    query_execution: Option<WireQueryExecution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireQueryExecution {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    work_group: Option<String>,
    #[serde(default)]
    status: Option<WireStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireStatus {
    #[serde(default)]
    completion_date_time: Option<WireTimestamp>,
}

fn parse_execution(value: serde_json::Value) -> Result<Option<ExecutionDetail>, SourceError> {
    let response: GetQueryExecutionResponse = serde_json::from_value(value)
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;
    Ok(response.query_execution.map(|qe| ExecutionDetail {
        workgroup: qe.work_group,
        query_text: qe.query,
        completed_at: qe
            .status
            .and_then(|s| s.completion_date_time)
            .and_then(|t| t.to_utc()),
    }))
}

#[derive(Debug, Clone)]
pub struct AthenaExecutionDetails {
    client: Arc<AwsJsonClient>,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl AthenaExecutionDetails {
    pub fn new(client: Arc<AwsJsonClient>, endpoint: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            backoff,
        }
    }

    pub fn regional_endpoint(region: &str) -> String {
        format!("https://athena.{region}.amazonaws.com/")
    }
}

#[async_trait]
impl ExecutionDetails for AthenaExecutionDetails {
    async fn describe(&self, execution_id: &str) -> Result<Option<ExecutionDetail>, SourceError> {
        let body = json!({ "QueryExecutionId": execution_id });
        let result = retry_with_backoff(
            &self.backoff,
            |err: &CallError| err.disposition(),
            |_| self.client.call(&self.endpoint, GET_QUERY_EXECUTION_TARGET, &body),
        )
        .await;

        match result {
            Ok(value) => parse_execution(value),
            Err(err) => {
                let err = err.into_inner();
                if is_aged_out(&err) {
                    Ok(None)
                } else {
                    Err(SourceError::Call(err))
                }
            }
        }
    }
}

/// Executions drop out of Athena's history after 45 days and are then reported as
/// `InvalidRequestException` "... was not found". Other invalid requests are real failures.
fn is_aged_out(err: &CallError) -> bool {
    match err {
        CallError::Service { code, message, .. } => {
            code == "InvalidRequestException" && message.to_ascii_lowercase().contains("not found")
        }
        _ => false,
    }
}

/// Fills only the fields the record does not already carry.
pub fn apply_detail(record: &mut QueryExecutionRecord, detail: ExecutionDetail) {
    if record.workgroup.is_none() {
        record.workgroup = detail.workgroup;
    }
    if record.query_text.is_none() {
        record.query_text = detail.query_text;
    }
    if record.end_time.is_none() {
        record.end_time = detail.completed_at;
    }
}

/// Enriches every record in place. Lookup failures are logged and skipped; the return
/// value is how many lookups failed.
pub async fn enrich_records(details: &dyn ExecutionDetails, records: &mut [QueryExecutionRecord]) -> usize {
    let mut failures = 0;
    for record in records.iter_mut() {
        match details.describe(&record.execution_id).await {
            Ok(Some(detail)) => apply_detail(record, detail),
            Ok(None) => debug!(execution_id = %record.execution_id, "no execution detail"),
            Err(err) => {
                failures += 1;
                warn!(execution_id = %record.execution_id, error = %err, "execution lookup failed");
            }
        }
    }
    failures
}
