//! Hand-off of planned windows to an external parallel runner, and the per-hour payload it
//! sends back to us.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use qtrail_core::{OutputFormat, PartitionKey, ProcessingWindow, UnknownOutputFormat};
use qtrail_storage::{retry_with_backoff, AwsJsonClient, BackoffPolicy, CallError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub const START_EXECUTION_TARGET: &str = "AWSStepFunctions.StartExecution";

const REPORT_DATE_FORMAT: &str = "%Y/%m/%d";

/// One hour of work as it travels through the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourInvocation {
    pub hour: u32,
    /// `YYYY/MM/DD`.
    pub report_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayInvocation {
    pub hours: Vec<HourInvocation>,
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("invocation payload is neither an hour nor a list of hours: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("report_date {0:?} is not YYYY/MM/DD")]
    ReportDate(String),
    #[error(transparent)]
    Partition(#[from] qtrail_core::PartitionKeyError),
    #[error(transparent)]
    OutputType(#[from] UnknownOutputFormat),
}

impl HourInvocation {
    pub fn for_window(window: &ProcessingWindow) -> Self {
        Self {
            hour: window.key.hour(),
            report_date: window.key.date().format(REPORT_DATE_FORMAT).to_string(),
            output_type: Some(window.format.to_string()),
        }
    }

    pub fn into_window(self, default_format: OutputFormat) -> Result<ProcessingWindow, InvocationError> {
        let date = NaiveDate::parse_from_str(self.report_date.trim(), REPORT_DATE_FORMAT)
            .map_err(|_| InvocationError::ReportDate(self.report_date.clone()))?;
        let key = PartitionKey::for_date_hour(date, self.hour)?;
        let format = match self.output_type.as_deref() {
            Some(raw) => raw.parse()?,
            None => default_format,
        };
        Ok(ProcessingWindow::new(key, format))
    }
}

impl DayInvocation {
    pub fn for_windows(windows: &[ProcessingWindow]) -> Self {
        Self {
            hours: windows.iter().map(HourInvocation::for_window).collect(),
        }
    }
}

/// Accepts a single `{"hour", "report_date", ...}` object or a `{"hours": [...]}` batch.
pub fn parse_invocation(
    payload: &JsonValue,
    default_format: OutputFormat,
) -> Result<Vec<ProcessingWindow>, InvocationError> {
    let hours = if payload.get("hours").is_some() {
        serde_json::from_value::<DayInvocation>(payload.clone())?.hours
    } else {
        vec![serde_json::from_value::<HourInvocation>(payload.clone())?]
    };
    hours
        .into_iter()
        .map(|hour| hour.into_window(default_format))
        .collect()
}

/// Starts an external run covering one day of windows and returns its handle.
#[async_trait]
pub trait FanOutTarget: Send + Sync {
    async fn dispatch_day(&self, day: NaiveDate, windows: &[ProcessingWindow]) -> Result<String, CallError>;
}

#[derive(Debug, Clone)]
pub struct StepFunctionsFanOut {
    client: Arc<AwsJsonClient>,
    endpoint: String,
    state_machine_arn: String,
    backoff: BackoffPolicy,
}

impl StepFunctionsFanOut {
    pub fn new(
        client: Arc<AwsJsonClient>,
        endpoint: impl Into<String>,
        state_machine_arn: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            state_machine_arn: state_machine_arn.into(),
            backoff,
        }
    }
}

pub fn start_execution_body(state_machine_arn: &str, windows: &[ProcessingWindow]) -> Result<JsonValue, serde_json::Error> {
    let input = serde_json::to_string(&DayInvocation::for_windows(windows))?;
    Ok(json!({
        "stateMachineArn": state_machine_arn,
        "input": input,
    }))
}

#[async_trait]
impl FanOutTarget for StepFunctionsFanOut {
    async fn dispatch_day(&self, day: NaiveDate, windows: &[ProcessingWindow]) -> Result<String, CallError> {
        let body = start_execution_body(&self.state_machine_arn, windows)?;
        let response = retry_with_backoff(&self.backoff, CallError::disposition, |_| {
            self.client.call(&self.endpoint, START_EXECUTION_TARGET, &body)
        })
        .await
        .map_err(|err| err.into_inner())?;

        let arn = response
            .get("executionArn")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{}:{day}", self.state_machine_arn));
        Ok(arn)
    }
}
