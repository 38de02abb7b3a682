//! Raw CloudTrail event -> [`QueryExecutionRecord`].

use chrono::{DateTime, Utc};
use qtrail_core::{QueryExecutionRecord, RawEvent, RejectReason, Rejected, START_QUERY_EXECUTION};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Placeholder CloudTrail writes when a request field is withheld from the log.
pub const REDACTED_MARKERS: &[&str] = &["HIDDEN_DUE_TO_SECURITY_REASONS", "REDACTED"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudTrailRecord {
    #[serde(default)]
    event_name: Option<String>,
    #[serde(default, rename = "eventID")]
    event_id: Option<String>,
    #[serde(default)]
    event_time: Option<String>,
    #[serde(default)]
    user_identity: Option<UserIdentity>,
    #[serde(default)]
    request_parameters: Option<JsonValue>,
    #[serde(default)]
    response_elements: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdentity {
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    arn: Option<String>,
    #[serde(default)]
    session_context: Option<SessionContext>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionContext {
    #[serde(default)]
    session_issuer: Option<SessionIssuer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIssuer {
    #[serde(default)]
    user_name: Option<String>,
}

/// The embedded CloudTrail payload, split into the one shape we understand and everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    StartQueryExecution(StartQueryExecutionDetail),
    Unrecognized { event_name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartQueryExecutionDetail {
    pub execution_id: Option<String>,
    pub event_id: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub principal: Option<String>,
    pub workgroup: Option<String>,
    pub query_text: Option<String>,
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// `arn:aws:iam::1234:user/alice` -> `alice`,
/// `arn:aws:sts::1234:assumed-role/Analyst/alice` -> `Analyst/alice`.
pub fn principal_from_arn(arn: &str) -> Option<String> {
    let resource = arn.splitn(6, ':').nth(5)?;
    let principal = ["assumed-role/", "user/", "role/", "federated-user/"]
        .iter()
        .find_map(|prefix| resource.strip_prefix(prefix))
        .unwrap_or(resource);
    non_empty(Some(principal))
}

impl UserIdentity {
    fn principal(&self) -> Option<String> {
        non_empty(self.user_name.as_deref())
            .or_else(|| self.arn.as_deref().and_then(principal_from_arn))
            .or_else(|| {
                self.session_context
                    .as_ref()
                    .and_then(|c| c.session_issuer.as_ref())
                    .and_then(|i| non_empty(i.user_name.as_deref()))
            })
    }
}

pub fn classify_payload(text: &str) -> Result<EventPayload, serde_json::Error> {
    let record: CloudTrailRecord = serde_json::from_str(text)?;
    if record.event_name.as_deref() != Some(START_QUERY_EXECUTION) {
        return Ok(EventPayload::Unrecognized {
            event_name: record.event_name,
        });
    }

    let null = JsonValue::Null;
    let request = record.request_parameters.as_ref().unwrap_or(&null);
    let response = record.response_elements.as_ref().unwrap_or(&null);

    let execution_id = non_empty(json_str(response, &["queryExecutionId"]))
        .or_else(|| non_empty(json_str(request, &["queryExecutionId"])));
    let query_text = json_str(request, &["queryString"])
        .filter(|text| !REDACTED_MARKERS.contains(&text.trim()))
        .map(ToString::to_string);

    Ok(EventPayload::StartQueryExecution(StartQueryExecutionDetail {
        execution_id,
        event_id: non_empty(record.event_id.as_deref()),
        event_time: record
            .event_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
        principal: record.user_identity.as_ref().and_then(UserIdentity::principal),
        workgroup: json_str(request, &["workGroup"]).map(ToString::to_string),
        query_text,
    }))
}

pub fn normalize(raw: &RawEvent) -> Result<QueryExecutionRecord, Rejected> {
    let reject = |reason: RejectReason, detail: String| Rejected::new(raw.event_id.clone(), reason, detail);

    let Some(payload) = raw.cloud_trail_event.as_deref() else {
        return Err(reject(
            RejectReason::MissingPayload,
            "event carries no CloudTrailEvent document".to_string(),
        ));
    };

    let detail = match classify_payload(payload) {
        Ok(EventPayload::StartQueryExecution(detail)) => detail,
        Ok(EventPayload::Unrecognized { event_name }) => {
            return Err(reject(
                RejectReason::UnrecognizedEvent,
                format!(
                    "unexpected event name {}",
                    event_name.as_deref().unwrap_or("<none>")
                ),
            ))
        }
        Err(err) => return Err(reject(RejectReason::UnparseablePayload, err.to_string())),
    };

    let Some(execution_id) = detail.execution_id else {
        return Err(reject(
            RejectReason::MissingExecutionId,
            "neither responseElements nor requestParameters carry queryExecutionId".to_string(),
        ));
    };

    let Some(username) = non_empty(raw.username.as_deref()).or(detail.principal) else {
        return Err(reject(
            RejectReason::MissingUsername,
            format!("no principal for execution {execution_id}"),
        ));
    };

    let Some(start_time) = detail.event_time.or(raw.event_time) else {
        return Err(reject(
            RejectReason::MissingEventTime,
            format!("no event time for execution {execution_id}"),
        ));
    };

    let source_event_id = non_empty(raw.event_id.as_deref())
        .or(detail.event_id)
        .unwrap_or_else(|| format!("{execution_id}@{}", start_time.timestamp()));

    Ok(QueryExecutionRecord {
        execution_id,
        username,
        workgroup: detail.workgroup,
        query_text: detail.query_text,
        start_time,
        end_time: None,
        source_event_id,
        ambiguous: false,
        candidate_usernames: Vec::new(),
        duplicate_event_ids: Vec::new(),
    })
}
