//! CloudTrail `LookupEvents` wire format, the live source, and a replayable static source.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use qtrail_core::{RawEvent, TimeRange};
use qtrail_storage::AwsJsonClient;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{EventSource, LookupPage, LookupRequest, SourceError};

pub const LOOKUP_EVENTS_TARGET: &str =
    "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101.LookupEvents";

/// LookupEvents only serves the last 90 days of management events.
pub const CLOUDTRAIL_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LookupEventsRequest<'a> {
    lookup_attributes: Vec<LookupAttribute<'a>>,
    start_time: i64,
    end_time: i64,
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LookupAttribute<'a> {
    attribute_key: &'a str,
    attribute_value: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LookupEventsResponse {
    #[serde(default)]
    pub events: Vec<WireEvent>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub event_time: Option<WireTimestamp>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub cloud_trail_event: Option<String>,
}

/// AWS JSON timestamps arrive as epoch seconds; recorded fixtures may use RFC 3339.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Epoch(f64),
    Text(String),
}

impl WireTimestamp {
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Epoch(secs) => DateTime::from_timestamp_millis((secs * 1000.0).round() as i64),
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl From<WireEvent> for RawEvent {
    fn from(wire: WireEvent) -> Self {
        RawEvent {
            event_id: wire.event_id,
            event_name: wire.event_name,
            event_time: wire.event_time.as_ref().and_then(WireTimestamp::to_utc),
            username: wire.username,
            cloud_trail_event: wire.cloud_trail_event,
        }
    }
}

pub fn parse_lookup_page(value: JsonValue) -> Result<LookupPage, SourceError> {
    let response: LookupEventsResponse = serde_json::from_value(value)
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;
    Ok(LookupPage {
        events: response.events.into_iter().map(RawEvent::from).collect(),
        next_token: response.next_token.filter(|t| !t.is_empty()),
    })
}

/// LookupEvents treats `EndTime` as inclusive; events stamped exactly at the window end
/// belong to the next hour and are dropped here.
fn retain_window(page: &mut LookupPage, window: &TimeRange) {
    page.events
        .retain(|e| e.event_time.map_or(true, |ts| window.contains(ts)));
}

/// Live CloudTrail source speaking the AWS JSON 1.1 protocol.
#[derive(Debug, Clone)]
pub struct CloudTrailSource {
    client: Arc<AwsJsonClient>,
    endpoint: String,
    retention: Duration,
}

impl CloudTrailSource {
    pub fn new(client: Arc<AwsJsonClient>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            retention: Duration::days(CLOUDTRAIL_RETENTION_DAYS),
        }
    }

    /// Default regional endpoint, e.g. `https://cloudtrail.us-east-1.amazonaws.com/`.
    pub fn regional_endpoint(region: &str) -> String {
        format!("https://cloudtrail.{region}.amazonaws.com/")
    }
}

#[async_trait]
impl EventSource for CloudTrailSource {
    fn name(&self) -> &str {
        "cloudtrail"
    }

    fn retention(&self) -> Option<Duration> {
        Some(self.retention)
    }

    async fn lookup_page(&self, request: &LookupRequest) -> Result<LookupPage, SourceError> {
        let body = LookupEventsRequest {
            lookup_attributes: vec![LookupAttribute {
                attribute_key: "EventName",
                attribute_value: &request.event_name,
            }],
            start_time: request.window.start.timestamp(),
            end_time: request.window.end.timestamp(),
            max_results: request.max_results,
            next_token: request.next_token.as_deref(),
        };
        let body = serde_json::to_value(&body)
            .map_err(|e| SourceError::InvalidResponse(format!("encoding request: {e}")))?;
        let response = self
            .client
            .call(&self.endpoint, LOOKUP_EVENTS_TARGET, &body)
            .await?;
        let mut page = parse_lookup_page(response)?;
        retain_window(&mut page, &request.window);
        Ok(page)
    }
}

/// In-memory source that serves a fixed event set with offset-token pagination.
///
/// Backs replays of recorded `LookupEvents` responses and tests.
#[derive(Debug, Clone)]
pub struct StaticEventSource {
    name: String,
    events: Vec<RawEvent>,
    page_size: usize,
    retention: Option<Duration>,
}

impl StaticEventSource {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            name: "static".to_string(),
            events,
            page_size: 50,
            retention: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    /// Load every `*.json` LookupEvents response in `dir`, in file-name order.
    pub fn from_recorded_pages(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut events = Vec::new();
        for path in paths {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let response: LookupEventsResponse = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            events.extend(response.events.into_iter().map(RawEvent::from));
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "recorded".to_string());
        Ok(Self::new(events).with_name(name))
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention(&self) -> Option<Duration> {
        self.retention
    }

    async fn lookup_page(&self, request: &LookupRequest) -> Result<LookupPage, SourceError> {
        let offset = match request.next_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::InvalidResponse(format!("unknown pagination token {token:?}")))?,
        };

        // Events with no name or timestamp still flow through so the normalizer can reject them.
        let matching = self
            .events
            .iter()
            .filter(|e| {
                e.event_name
                    .as_deref()
                    .map_or(true, |name| name == request.event_name)
            })
            .filter(|e| e.event_time.map_or(true, |ts| request.window.contains(ts)))
            .collect::<Vec<_>>();

        let page_size = self.page_size.min(request.max_results.max(1) as usize);
        let end = (offset + page_size).min(matching.len());
        let events = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| (*e).clone())
            .collect();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(LookupPage { events, next_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use qtrail_core::{PartitionKey, START_QUERY_EXECUTION};
    use serde_json::json;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 28, hour, minute, 0).single().unwrap()
    }

    fn raw(id: &str, name: &str, ts: DateTime<Utc>) -> RawEvent {
        RawEvent {
            event_id: Some(id.to_string()),
            event_name: Some(name.to_string()),
            event_time: Some(ts),
            username: None,
            cloud_trail_event: None,
        }
    }

    fn request(window: TimeRange, token: Option<&str>) -> LookupRequest {
        LookupRequest {
            window,
            event_name: START_QUERY_EXECUTION.to_string(),
            next_token: token.map(ToString::to_string),
            max_results: 50,
        }
    }

    #[test]
    fn wire_page_parses_epoch_and_text_timestamps() {
        let page = parse_lookup_page(json!({
            "Events": [
                {"EventId": "a", "EventName": "StartQueryExecution", "EventTime": 1756386300.0,
                 "Username": "alice", "CloudTrailEvent": "{}"},
                {"EventId": "b", "EventTime": "2025-08-28T13:06:00Z"}
            ],
            "NextToken": "tok"
        }))
        .unwrap();

        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].event_time, Some(at(13, 5)));
        assert_eq!(page.events[0].username.as_deref(), Some("alice"));
        assert_eq!(page.events[1].event_time, Some(at(13, 6)));
        assert_eq!(page.events[1].event_name, None);
        assert_eq!(page.next_token.as_deref(), Some("tok"));
    }

    #[test]
    fn empty_next_token_ends_pagination() {
        let page = parse_lookup_page(json!({"Events": [], "NextToken": ""})).unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn non_object_response_is_invalid() {
        assert!(matches!(
            parse_lookup_page(json!([1, 2, 3])),
            Err(SourceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn inclusive_end_time_is_trimmed_to_closed_open_window() {
        let window = PartitionKey::new(2025, 8, 28, 13).unwrap().time_range();
        let mut page = LookupPage {
            events: vec![
                raw("start", START_QUERY_EXECUTION, at(13, 0)),
                raw("end", START_QUERY_EXECUTION, at(14, 0)),
            ],
            next_token: None,
        };
        retain_window(&mut page, &window);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event_id.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn static_source_paginates_filtered_events() {
        let window = PartitionKey::new(2025, 8, 28, 13).unwrap().time_range();
        let source = StaticEventSource::new(vec![
            raw("1", START_QUERY_EXECUTION, at(13, 1)),
            raw("2", "GetQueryExecution", at(13, 2)),
            raw("3", START_QUERY_EXECUTION, at(13, 3)),
            raw("4", START_QUERY_EXECUTION, at(12, 59)),
            raw("5", START_QUERY_EXECUTION, at(13, 59)),
        ])
        .with_page_size(2);

        let first = source.lookup_page(&request(window, None)).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = source.lookup_page(&request(window, Some("2"))).await.unwrap();
        let ids = second
            .events
            .iter()
            .map(|e| e.event_id.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["5"]);
        assert_eq!(second.next_token, None);

        assert!(source
            .lookup_page(&request(window, Some("bogus")))
            .await
            .is_err());
    }

    #[test]
    fn recorded_pages_load_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page-002.json"),
            r#"{"Events":[{"EventId":"second","EventTime":1756386360}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("page-001.json"),
            r#"{"Events":[{"EventId":"first","EventTime":1756386300}],"NextToken":"x"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = StaticEventSource::from_recorded_pages(dir.path()).unwrap();
        let ids = source
            .events()
            .iter()
            .map(|e| e.event_id.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["first", "second"]);
    }
}
