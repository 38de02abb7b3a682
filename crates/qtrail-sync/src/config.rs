use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use qtrail_core::OutputFormat;
use qtrail_sources::cloudtrail::CloudTrailSource;
use qtrail_sources::AthenaExecutionDetails;
use qtrail_storage::{ArtifactStore, HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;
use tracing::info;

/// Object key of the YAML overlay inside the store.
pub const CONFIG_OBJECT_KEY: &str = "config/qtrail.yaml";

pub const DEFAULT_REPORT_PREFIX: &str = "reports";

/// Ceiling for any configured request rate.
pub const MAX_REQUESTS_PER_SECOND: u32 = 1000;

fn clamp_rate(rate: u32) -> u32 {
    rate.clamp(1, MAX_REQUESTS_PER_SECOND)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Local directory standing in for the report bucket.
    pub storage_root: PathBuf,
    pub report_prefix: String,
    pub output_format: OutputFormat,
    pub test_start_date: Option<NaiveDate>,
    pub test_end_date: Option<NaiveDate>,
    pub state_machine_arn: Option<String>,
    pub region: String,
    pub cloudtrail_endpoint: Option<String>,
    pub athena_endpoint: Option<String>,
    pub stepfunctions_endpoint: Option<String>,
    pub enrich_executions: Option<bool>,
    pub max_concurrent_windows: usize,
    pub http_timeout_secs: u64,
    /// LookupEvents allows roughly two calls per second per account.
    pub lookup_requests_per_second: u32,
    /// GetQueryExecution has its own, much larger quota.
    pub athena_requests_per_second: u32,
    pub user_agent: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./qtrail-bucket"),
            report_prefix: DEFAULT_REPORT_PREFIX.to_string(),
            output_format: OutputFormat::Csv,
            test_start_date: None,
            test_end_date: None,
            state_machine_arn: None,
            region: "us-east-1".to_string(),
            cloudtrail_endpoint: None,
            athena_endpoint: None,
            stepfunctions_endpoint: None,
            enrich_executions: None,
            max_concurrent_windows: 4,
            http_timeout_secs: 20,
            lookup_requests_per_second: 2,
            athena_requests_per_second: 20,
            user_agent: "qtrail/0.1".to_string(),
        }
    }
}

fn parse_date(name: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("{name} must be YYYY-MM-DD, got {value:?}"))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl AuditConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).and_then(non_blank);
        let defaults = Self::default();

        let output_format = match var("OUTPUT_TYPE") {
            Some(raw) => raw.parse().context("parsing OUTPUT_TYPE")?,
            None => defaults.output_format,
        };

        Ok(Self {
            storage_root: var("S3_BUCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            report_prefix: defaults.report_prefix,
            output_format,
            test_start_date: var("TEST_START_DATE")
                .map(|v| parse_date("TEST_START_DATE", &v))
                .transpose()?,
            test_end_date: var("TEST_END_DATE")
                .map(|v| parse_date("TEST_END_DATE", &v))
                .transpose()?,
            state_machine_arn: var("STATE_MACHINE_ARN"),
            region: var("AWS_REGION")
                .or_else(|| var("AWS_DEFAULT_REGION"))
                .unwrap_or(defaults.region),
            cloudtrail_endpoint: var("QTRAIL_CLOUDTRAIL_ENDPOINT"),
            athena_endpoint: var("QTRAIL_ATHENA_ENDPOINT"),
            stepfunctions_endpoint: var("QTRAIL_STEPFUNCTIONS_ENDPOINT"),
            enrich_executions: var("QTRAIL_ENRICH_EXECUTIONS").map(|v| parse_flag(&v)),
            max_concurrent_windows: var("QTRAIL_MAX_CONCURRENT_WINDOWS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_windows),
            http_timeout_secs: var("QTRAIL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            lookup_requests_per_second: var("QTRAIL_LOOKUP_REQUESTS_PER_SECOND")
                .and_then(|v| v.parse().ok())
                .map(clamp_rate)
                .unwrap_or(defaults.lookup_requests_per_second),
            athena_requests_per_second: var("QTRAIL_ATHENA_REQUESTS_PER_SECOND")
                .and_then(|v| v.parse().ok())
                .map(clamp_rate)
                .unwrap_or(defaults.athena_requests_per_second),
            user_agent: var("QTRAIL_USER_AGENT").unwrap_or(defaults.user_agent),
        })
    }

    /// Environment, then the store's YAML overlay on top.
    pub async fn resolve_from_env() -> Result<Self> {
        let mut config = Self::from_env()?;
        let store = ArtifactStore::new(config.storage_root.clone());
        if let Some(overlay) = ConfigOverlay::load(&store).await? {
            info!(key = CONFIG_OBJECT_KEY, "applying config overlay");
            overlay.apply(&mut config);
        }
        Ok(config)
    }

    pub fn cloudtrail_endpoint(&self) -> String {
        self.cloudtrail_endpoint
            .clone()
            .unwrap_or_else(|| CloudTrailSource::regional_endpoint(&self.region))
    }

    pub fn athena_endpoint(&self) -> String {
        self.athena_endpoint
            .clone()
            .unwrap_or_else(|| AthenaExecutionDetails::regional_endpoint(&self.region))
    }

    pub fn stepfunctions_endpoint(&self) -> String {
        self.stepfunctions_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://states.{}.amazonaws.com/", self.region))
    }

    /// Enrichment defaults to on only when an Athena endpoint is configured.
    pub fn enrichment_enabled(&self) -> bool {
        self.enrich_executions
            .unwrap_or(self.athena_endpoint.is_some())
    }

    fn client_config(&self, token_bucket: Option<TokenBucketConfig>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket,
            ..Default::default()
        }
    }

    /// CloudTrail `LookupEvents`, paced to the account-wide lookup quota.
    pub fn lookup_client_config(&self) -> HttpClientConfig {
        self.client_config(Some(TokenBucketConfig::per_second(clamp_rate(
            self.lookup_requests_per_second,
        ))))
    }

    /// Athena `GetQueryExecution`, paced separately so enrichment never queues behind lookups.
    pub fn athena_client_config(&self) -> HttpClientConfig {
        self.client_config(Some(TokenBucketConfig::per_second(clamp_rate(
            self.athena_requests_per_second,
        ))))
    }

    /// Step Functions `StartExecution`; bounded only by the client's concurrency.
    pub fn stepfunctions_client_config(&self) -> HttpClientConfig {
        self.client_config(None)
    }
}

/// Field-by-field overrides read from [`CONFIG_OBJECT_KEY`]. Absent keys leave the
/// environment value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    #[serde(default)]
    pub output_type: Option<String>,
    #[serde(default)]
    pub report_prefix: Option<String>,
    #[serde(default)]
    pub test_start_date: Option<NaiveDate>,
    #[serde(default)]
    pub test_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub state_machine_arn: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub cloudtrail_endpoint: Option<String>,
    #[serde(default)]
    pub athena_endpoint: Option<String>,
    #[serde(default)]
    pub stepfunctions_endpoint: Option<String>,
    #[serde(default)]
    pub enrich_executions: Option<bool>,
    #[serde(default)]
    pub max_concurrent_windows: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub lookup_requests_per_second: Option<u32>,
    #[serde(default)]
    pub athena_requests_per_second: Option<u32>,
}

impl ConfigOverlay {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).with_context(|| format!("parsing {CONFIG_OBJECT_KEY}"))
    }

    pub async fn load(store: &ArtifactStore) -> Result<Option<Self>> {
        let Some(bytes) = store.read(CONFIG_OBJECT_KEY).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).with_context(|| format!("{CONFIG_OBJECT_KEY} is not UTF-8"))?;
        Self::from_yaml(&text).map(Some)
    }

    pub fn apply(self, config: &mut AuditConfig) {
        if let Some(format) = self.output_type.and_then(|v| v.parse().ok()) {
            config.output_format = format;
        }
        if let Some(prefix) = self.report_prefix {
            config.report_prefix = prefix;
        }
        if self.test_start_date.is_some() {
            config.test_start_date = self.test_start_date;
        }
        if self.test_end_date.is_some() {
            config.test_end_date = self.test_end_date;
        }
        if self.state_machine_arn.is_some() {
            config.state_machine_arn = self.state_machine_arn;
        }
        if let Some(region) = self.region {
            config.region = region;
        }
        if self.cloudtrail_endpoint.is_some() {
            config.cloudtrail_endpoint = self.cloudtrail_endpoint;
        }
        if self.athena_endpoint.is_some() {
            config.athena_endpoint = self.athena_endpoint;
        }
        if self.stepfunctions_endpoint.is_some() {
            config.stepfunctions_endpoint = self.stepfunctions_endpoint;
        }
        if self.enrich_executions.is_some() {
            config.enrich_executions = self.enrich_executions;
        }
        if let Some(n) = self.max_concurrent_windows.filter(|n| *n > 0) {
            config.max_concurrent_windows = n;
        }
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(rate) = self.lookup_requests_per_second {
            config.lookup_requests_per_second = clamp_rate(rate);
        }
        if let Some(rate) = self.athena_requests_per_second {
            config.athena_requests_per_second = clamp_rate(rate);
        }
    }
}
