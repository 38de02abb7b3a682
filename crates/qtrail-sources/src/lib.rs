//! Audit event sources, the paginating event client, and record normalization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use qtrail_core::{ErrorKind, RawEvent, TimeRange};
use qtrail_storage::{retry_with_backoff, BackoffPolicy, CallError, RetryDisposition};
use thiserror::Error;
use tracing::debug;

pub mod cloudtrail;
pub mod enrich;
pub mod normalize;

pub use cloudtrail::{CloudTrailSource, StaticEventSource};
pub use enrich::{
    apply_detail, enrich_records, AthenaExecutionDetails, ExecutionDetail, ExecutionDetails,
    NoExecutionDetails, StaticExecutionDetails,
};
pub use normalize::{classify_payload, normalize, EventPayload, StartQueryExecutionDetail};

pub const CRATE_NAME: &str = "qtrail-sources";

/// LookupEvents caps a page at 50 events.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub window: TimeRange,
    pub event_name: String,
    pub next_token: Option<String>,
    pub max_results: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupPage {
    pub events: Vec<RawEvent>,
    pub next_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("invalid lookup response: {0}")]
    InvalidResponse(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("{0}")]
    Rejected(String),
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Call(err) => err.disposition(),
            Self::Throttled(_) => RetryDisposition::Retryable,
            Self::InvalidResponse(_) | Self::Rejected(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// One page of audit events per call; pagination and retries live in [`EventSourceClient`].
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    /// How far back the source keeps events. `None` means no ceiling.
    fn retention(&self) -> Option<Duration>;

    async fn lookup_page(&self, request: &LookupRequest) -> Result<LookupPage, SourceError>;
}

#[derive(Debug, Error)]
pub enum FetchEventsError {
    #[error(
        "window starting {requested_start} is older than the source retention (oldest available {oldest_available})"
    )]
    RetentionExceeded {
        requested_start: DateTime<Utc>,
        oldest_available: DateTime<Utc>,
    },
    #[error("event source unavailable after {attempts} attempt(s): {source}")]
    SourceUnavailable {
        attempts: usize,
        #[source]
        source: SourceError,
    },
    #[error("window {start} -> {end} is not a single hour")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl FetchEventsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RetentionExceeded { .. } => ErrorKind::RetentionExceeded,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::InvalidWindow { .. } => ErrorKind::InvalidRange,
        }
    }
}

#[derive(Clone)]
pub struct EventSourceClient {
    source: Arc<dyn EventSource>,
    backoff: BackoffPolicy,
    page_size: u32,
}

impl EventSourceClient {
    pub fn new(source: Arc<dyn EventSource>, backoff: BackoffPolicy) -> Self {
        Self {
            source,
            backoff,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn fetch_events(
        &self,
        window: TimeRange,
        event_name: &str,
    ) -> BoxStream<'static, Result<RawEvent, FetchEventsError>> {
        self.fetch_events_at(window, event_name, Utc::now())
    }

    /// Lazily walks every page of events matching `event_name` in `window`.
    ///
    /// The stream ends when the source stops returning a continuation token. A retention
    /// violation is reported before any call is made.
    pub fn fetch_events_at(
        &self,
        window: TimeRange,
        event_name: &str,
        now: DateTime<Utc>,
    ) -> BoxStream<'static, Result<RawEvent, FetchEventsError>> {
        if let Err(err) = self.check_window(window, now) {
            return stream::once(async move { Err(err) }).boxed();
        }

        enum Cursor {
            Start,
            Next(String),
            Done,
        }

        let client = self.clone();
        let event_name = event_name.to_string();
        let pages = stream::try_unfold(Cursor::Start, move |cursor| {
            let client = client.clone();
            let event_name = event_name.clone();
            async move {
                let next_token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };
                let request = LookupRequest {
                    window,
                    event_name,
                    next_token,
                    max_results: client.page_size,
                };
                let page = client.lookup_with_retry(&request).await?;
                debug!(
                    source = client.source.name(),
                    events = page.events.len(),
                    more = page.next_token.is_some(),
                    "fetched lookup page"
                );
                let next = match page.next_token.filter(|t| !t.is_empty()) {
                    Some(token) => Cursor::Next(token),
                    None => Cursor::Done,
                };
                Ok::<_, FetchEventsError>(Some((page.events, next)))
            }
        });

        pages
            .map_ok(|events| stream::iter(events.into_iter().map(Ok::<RawEvent, FetchEventsError>)))
            .try_flatten()
            .boxed()
    }

    /// Drains [`Self::fetch_events_at`] into memory.
    pub async fn collect_events_at(
        &self,
        window: TimeRange,
        event_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, FetchEventsError> {
        self.fetch_events_at(window, event_name, now)
            .try_collect()
            .await
    }

    fn check_window(&self, window: TimeRange, now: DateTime<Utc>) -> Result<(), FetchEventsError> {
        if window.duration() != Duration::hours(1) {
            return Err(FetchEventsError::InvalidWindow {
                start: window.start,
                end: window.end,
            });
        }
        if let Some(retention) = self.source.retention() {
            let oldest_available = now - retention;
            if window.start < oldest_available {
                return Err(FetchEventsError::RetentionExceeded {
                    requested_start: window.start,
                    oldest_available,
                });
            }
        }
        Ok(())
    }

    async fn lookup_with_retry(&self, request: &LookupRequest) -> Result<LookupPage, FetchEventsError> {
        retry_with_backoff(&self.backoff, SourceError::disposition, |_| {
            self.source.lookup_page(request)
        })
        .await
        .map_err(|err| FetchEventsError::SourceUnavailable {
            attempts: err.attempts(),
            source: err.into_inner(),
        })
    }
}
