//! Hourly audit orchestration: config, planning, dedup, partition writing and fan-out.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use qtrail_core::{OutcomeStatus, ProcessingWindow, WindowOutcome};
use qtrail_sources::{AthenaExecutionDetails, CloudTrailSource, EventSourceClient};
use qtrail_storage::{ArtifactStore, AwsJsonClient, BackoffPolicy};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod fanout;
pub mod planner;
pub mod writer;

pub use config::{AuditConfig, ConfigOverlay};
pub use coordinator::{normalize_window, run_windows, RunCoordinator};
pub use dedup::{dedup, DedupOutput};
pub use fanout::{parse_invocation, FanOutTarget, HourInvocation, StepFunctionsFanOut};
pub use planner::{PlanError, PlanMode, WindowPlanner};
pub use writer::{PartitionWriter, WriteError, WriteResult};

pub const CRATE_NAME: &str = "qtrail-sync";

#[derive(Debug, Clone, Serialize)]
pub struct DispatchedDay {
    pub day: NaiveDate,
    pub windows: usize,
    pub execution_arn: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub days: Vec<NaiveDate>,
    pub planned_windows: usize,
    /// Days handed to the external fan-out; empty when windows ran locally.
    pub dispatched: Vec<DispatchedDay>,
    pub outcomes: Vec<WindowOutcome>,
}

impl TriggerSummary {
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

pub struct AuditPipeline {
    config: AuditConfig,
    coordinator: Arc<RunCoordinator>,
    fanout: Option<Arc<dyn FanOutTarget>>,
}

impl AuditPipeline {
    /// Wires the live CloudTrail, Athena and Step Functions clients from `config`. Each
    /// service gets its own client so one quota never throttles another.
    pub fn new(config: AuditConfig) -> Result<Self> {
        let lookup_client = Arc::new(
            AwsJsonClient::new(config.lookup_client_config()).context("building CloudTrail client")?,
        );
        let backoff = BackoffPolicy::default();

        let source = CloudTrailSource::new(lookup_client, config.cloudtrail_endpoint());
        let writer = PartitionWriter::new(
            ArtifactStore::new(config.storage_root.clone()),
            config.report_prefix.clone(),
        );
        let mut coordinator = RunCoordinator::new(EventSourceClient::new(Arc::new(source), backoff), writer);
        if config.enrichment_enabled() {
            let athena_client = Arc::new(
                AwsJsonClient::new(config.athena_client_config()).context("building Athena client")?,
            );
            coordinator = coordinator.with_execution_details(Arc::new(AthenaExecutionDetails::new(
                athena_client,
                config.athena_endpoint(),
                backoff,
            )));
        }

        let fanout = match &config.state_machine_arn {
            Some(arn) => {
                let client = Arc::new(
                    AwsJsonClient::new(config.stepfunctions_client_config())
                        .context("building Step Functions client")?,
                );
                Some(Arc::new(StepFunctionsFanOut::new(
                    client,
                    config.stepfunctions_endpoint(),
                    arn.clone(),
                    backoff,
                )) as Arc<dyn FanOutTarget>)
            }
            None => None,
        };

        Ok(Self::with_parts(config, coordinator, fanout))
    }

    pub fn with_parts(
        config: AuditConfig,
        coordinator: RunCoordinator,
        fanout: Option<Arc<dyn FanOutTarget>>,
    ) -> Self {
        Self {
            config,
            coordinator: Arc::new(coordinator),
            fanout,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn planner(&self) -> WindowPlanner {
        WindowPlanner::new(self.config.output_format)
    }

    pub fn plan(&self, today: NaiveDate) -> Result<Vec<ProcessingWindow>, PlanError> {
        let mode = PlanMode::from_config(&self.config, today)?;
        self.planner().plan(mode)
    }

    pub async fn run_window(&self, window: ProcessingWindow) -> WindowOutcome {
        self.coordinator.run_window(window).await
    }

    /// Runs every window named by a fan-out payload.
    pub async fn invoke(&self, payload: &JsonValue) -> Result<Vec<WindowOutcome>> {
        let windows = parse_invocation(payload, self.config.output_format)
            .context("parsing invocation payload")?;
        run_windows(
            Arc::clone(&self.coordinator),
            windows,
            self.config.max_concurrent_windows,
        )
        .await
    }

    /// Plans the configured days and either dispatches one external run per day or
    /// processes the windows locally.
    pub async fn run_trigger(&self, today: NaiveDate) -> Result<TriggerSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let planner = self.planner();
        let mode = PlanMode::from_config(&self.config, today)?;
        let days = planner.days(mode)?;
        info!(%run_id, ?mode, days = days.len(), "trigger planned");

        let mut planned_windows = 0;
        let mut dispatched = Vec::new();
        let mut outcomes = Vec::new();

        for day in &days {
            let windows = planner.windows_for_day(*day);
            planned_windows += windows.len();
            match &self.fanout {
                Some(fanout) => {
                    let execution_arn = fanout
                        .dispatch_day(*day, &windows)
                        .await
                        .with_context(|| format!("starting fan-out for {day}"))?;
                    info!(%day, execution_arn = %execution_arn, "fan-out started");
                    dispatched.push(DispatchedDay {
                        day: *day,
                        windows: windows.len(),
                        execution_arn,
                    });
                }
                None => {
                    let day_outcomes = run_windows(
                        Arc::clone(&self.coordinator),
                        windows,
                        self.config.max_concurrent_windows,
                    )
                    .await?;
                    outcomes.extend(day_outcomes);
                }
            }
        }

        let summary = TriggerSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            days,
            planned_windows,
            dispatched,
            outcomes,
        };
        info!(
            %run_id,
            windows = summary.planned_windows,
            dispatched = summary.dispatched.len(),
            success = summary.count(OutcomeStatus::Success),
            partial = summary.count(OutcomeStatus::Partial),
            failure = summary.count(OutcomeStatus::Failure),
            "trigger complete"
        );
        Ok(summary)
    }
}

pub async fn run_trigger_from_env() -> Result<TriggerSummary> {
    let config = AuditConfig::resolve_from_env().await?;
    let pipeline = AuditPipeline::new(config)?;
    pipeline.run_trigger(Utc::now().date_naive()).await
}
