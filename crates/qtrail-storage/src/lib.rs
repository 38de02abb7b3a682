//! Durable artifact store, retry policy and AWS JSON transport for qtrail.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qtrail-storage";

pub const AWS_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub key: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: u64,
    pub replaced_existing: bool,
}

/// Key-addressed object store rooted at a local directory (the bucket).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Maps a `/`-separated object key onto a path below the root.
    pub fn path_for_key(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.trim().is_empty() {
            bail!("object key must not be empty");
        }
        for component in Path::new(key).components() {
            if !matches!(component, Component::Normal(_)) {
                bail!("object key {key:?} must be relative and must not contain '..'");
            }
        }
        Ok(self.root.join(key))
    }

    pub async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for_key(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading object {}", path.display())),
        }
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for_key(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking object path {}", path.display()))
    }

    pub async fn replace_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        self.replace_from_reader(key, bytes).await
    }

    /// Replace the object at `key` with the full contents of `reader`.
    ///
    /// Bytes stream into a hidden temp file in the target directory which is then renamed
    /// over the target, so a concurrent reader sees either the previous object or the
    /// complete new one. If the reader or the write fails, the temp file is removed and the
    /// previous object is left untouched.
    pub async fn replace_from_reader<R>(
        &self,
        key: &str,
        mut reader: R,
    ) -> anyhow::Result<StoredArtifact>
    where
        R: AsyncRead + Unpin,
    {
        let absolute_path = self.path_for_key(key)?;
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating object directory {}", parent.display()))?;

        let replaced_existing = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking object path {}", absolute_path.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let (content_hash, byte_size) = match write_temp_file(&temp_path, &mut reader).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            key: key.to_string(),
            absolute_path,
            content_hash,
            byte_size,
            replaced_existing,
        })
    }
}

async fn write_temp_file<R>(temp_path: &Path, reader: &mut R) -> anyhow::Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp object file {}", temp_path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .with_context(|| format!("reading object body for {}", temp_path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        total += n as u64;
    }

    file.flush()
        .await
        .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp object file {}", temp_path.display()))?;

    Ok((hex::encode(hasher.finalize()), total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Transport failures, including a response body cut off mid-read, are worth another attempt.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("{error}")]
    Permanent { attempts: usize, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
/// `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::NonRetryable {
                    return Err(RetryError::Permanent {
                        attempts: attempt + 1,
                        error: err,
                    });
                }
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            token_bucket: None,
        }
    }
}

/// `capacity` requests may burst; afterwards one request is admitted per `refill_every`.
/// A zero `refill_every` disables pacing.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Steady `per_second` requests with a burst of the same size. Zero disables pacing.
    pub fn per_second(per_second: u32) -> Self {
        Self {
            capacity: per_second.max(1),
            refill_every: Duration::from_secs(1)
                .checked_div(per_second)
                .unwrap_or(Duration::ZERO),
        }
    }
}

#[derive(Debug)]
pub struct RequestBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    refilled_at: Instant,
}

impl RequestBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes a token as of `now`, or returns how long until the next one is earned.
    fn try_take(&self, state: &mut BucketState, now: Instant) -> Result<(), Duration> {
        if self.refill_every.is_zero() {
            return Ok(());
        }

        let elapsed = now.saturating_duration_since(state.refilled_at);
        let earned = elapsed.as_nanos() / self.refill_every.as_nanos();
        let missing = self.capacity - state.tokens;
        if earned >= u128::from(missing) {
            state.tokens = self.capacity;
            state.refilled_at = now;
        } else if earned > 0 {
            // earned < missing, so it fits in a u32.
            let earned = earned as u32;
            state.tokens += earned;
            state.refilled_at += self.refill_every * earned;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            return Ok(());
        }
        let since_refill = now.saturating_duration_since(state.refilled_at);
        Err(self.refill_every.saturating_sub(since_refill))
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                match self.try_take(&mut state, Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

const RETRYABLE_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalServerError",
];

#[derive(Debug, Error)]
pub enum CallError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{code} (http {status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("http client is shut down")]
    Closed,
}

impl CallError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::Service { status, code, .. } => {
                if RETRYABLE_ERROR_CODES.contains(&code.as_str()) {
                    RetryDisposition::Retryable
                } else {
                    StatusCode::from_u16(*status)
                        .map(classify_status)
                        .unwrap_or(RetryDisposition::NonRetryable)
                }
            }
            Self::Decode(_) | Self::Closed => RetryDisposition::NonRetryable,
        }
    }
}

/// Strip the namespace and trailing URI from an AWS `__type` value, e.g.
/// `com.amazonaws.cloudtrail#ThrottlingException:http://...` -> `ThrottlingException`.
pub fn normalize_error_code(raw: &str, status: StatusCode) -> String {
    let code = raw.rsplit('#').next().unwrap_or(raw);
    let code = code.split(':').next().unwrap_or(code).trim();
    if code.is_empty() {
        format!("Http{}", status.as_u16())
    } else {
        code.to_string()
    }
}

fn service_error(status: StatusCode, body: &[u8]) -> CallError {
    let parsed: Option<JsonValue> = serde_json::from_slice(body).ok();
    let raw_code = parsed
        .as_ref()
        .and_then(|v| v.get("__type").or_else(|| v.get("code")))
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    CallError::Service {
        status: status.as_u16(),
        code: normalize_error_code(raw_code, status),
        message,
    }
}

/// Single-attempt client for AWS JSON 1.1 services (CloudTrail, Athena, Step Functions).
///
/// Requests are sent unsigned; the endpoint is expected to be a signing proxy or a local
/// emulator. Retries are left to the caller's [`BackoffPolicy`].
#[derive(Debug)]
pub struct AwsJsonClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<RequestBucket>>,
}

impl AwsJsonClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(RequestBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
        })
    }

    pub async fn call(
        &self,
        endpoint: &str,
        target: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, CallError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| CallError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let payload = serde_json::to_vec(body)?;
        let span = info_span!("aws_call", target, endpoint);
        async move {
            let resp = self
                .client
                .post(endpoint)
                .header(CONTENT_TYPE, AWS_JSON_CONTENT_TYPE)
                .header("X-Amz-Target", target)
                .body(payload)
                .send()
                .await?;

            let status = resp.status();
            let bytes = resp.bytes().await?;
            if !status.is_success() {
                return Err(service_error(status, &bytes));
            }
            if bytes.is_empty() {
                return Ok(JsonValue::Object(Default::default()));
            }
            Ok(serde_json::from_slice(&bytes)?)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context as TaskContext, Poll};
    use tempfile::tempdir;
    use tokio::io::ReadBuf;

    const KEY: &str = "reports/year=2025/month=08/day=28/hour=13/report_2025_08_28_h13.csv";

    struct FailingReader {
        head: Vec<u8>,
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.served {
                self.served = true;
                let n = self.head.len().min(buf.remaining());
                buf.put_slice(&self.head[..n]);
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected failure",
            )))
        }
    }

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names = std::fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn object_keys_cannot_escape_the_root() {
        let store = ArtifactStore::new("/tmp/qtrail-root");
        assert!(store.path_for_key("../etc/passwd").is_err());
        assert!(store.path_for_key("/absolute").is_err());
        assert!(store.path_for_key("").is_err());
        assert_eq!(
            store.path_for_key("a/b.csv").unwrap(),
            PathBuf::from("/tmp/qtrail-root/a/b.csv")
        );
    }

    #[tokio::test]
    async fn replace_overwrites_whole_object() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store.replace_bytes(KEY, b"first,version\n").await.expect("first");
        let second = store.replace_bytes(KEY, b"second\n").await.expect("second");

        assert!(!first.replaced_existing);
        assert!(second.replaced_existing);
        assert_eq!(second.byte_size, 7);
        assert_eq!(second.content_hash, ArtifactStore::sha256_hex(b"second\n"));
        assert_eq!(store.read(KEY).await.unwrap().unwrap(), b"second\n");
    }

    #[tokio::test]
    async fn failed_stream_leaves_previous_object_visible() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        store.replace_bytes(KEY, b"complete artifact\n").await.expect("seed");

        let reader = FailingReader {
            head: b"truncated".to_vec(),
            served: false,
        };
        let err = store.replace_from_reader(KEY, reader).await.unwrap_err();
        assert!(format!("{err:#}").contains("injected failure"));

        assert_eq!(store.read(KEY).await.unwrap().unwrap(), b"complete artifact\n");
        let parent = store.path_for_key(KEY).unwrap();
        let entries = visible_entries(parent.parent().unwrap());
        assert_eq!(entries, vec!["report_2025_08_28_h13.csv".to_string()]);
    }

    #[tokio::test]
    async fn failed_first_write_leaves_nothing_behind() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let reader = FailingReader {
            head: b"partial".to_vec(),
            served: false,
        };
        assert!(store.replace_from_reader(KEY, reader).await.is_err());
        assert!(!store.exists(KEY).await.unwrap());
        assert_eq!(store.read(KEY).await.unwrap(), None);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 6);
    }

    fn instant_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retry_stops_after_bounded_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &instant_policy(3),
            |_: &String| RetryDisposition::Retryable,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("throttled".to_string()) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let result = retry_with_backoff(
            &instant_policy(3),
            |_: &String| RetryDisposition::Retryable,
            |attempt| async move {
                if attempt < 2 {
                    Err("throttled".to_string())
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_immediately_on_permanent_errors() {
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &instant_policy(3),
            |_: &String| RetryDisposition::NonRetryable,
            |_| async { Err("access denied".to_string()) },
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), "access denied");
    }

    #[test]
    fn aws_error_codes_are_normalized_and_classified() {
        assert_eq!(
            normalize_error_code(
                "com.amazonaws.cloudtrail.v20131101#ThrottlingException:http://internal.amazon.com/",
                StatusCode::BAD_REQUEST
            ),
            "ThrottlingException"
        );
        assert_eq!(normalize_error_code("", StatusCode::BAD_GATEWAY), "Http502");

        let throttled = service_error(
            StatusCode::BAD_REQUEST,
            br#"{"__type":"ThrottlingException","message":"Rate exceeded"}"#,
        );
        assert_eq!(throttled.code(), Some("ThrottlingException"));
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);

        let invalid = service_error(
            StatusCode::BAD_REQUEST,
            br#"{"__type":"InvalidTimeRangeException","Message":"bad range"}"#,
        );
        assert_eq!(invalid.disposition(), RetryDisposition::NonRetryable);
        assert!(invalid.to_string().contains("bad range"));

        let unavailable = service_error(StatusCode::SERVICE_UNAVAILABLE, b"upstream down");
        assert_eq!(unavailable.disposition(), RetryDisposition::Retryable);

        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn transport_errors_retry_but_malformed_requests_do_not() {
        let client = reqwest::Client::new();
        let refused = client.get("http://127.0.0.1:1/").send().await.unwrap_err();
        assert_eq!(classify_reqwest_error(&refused), RetryDisposition::Retryable);

        let malformed = client.get("not a url").send().await.unwrap_err();
        assert_eq!(classify_reqwest_error(&malformed), RetryDisposition::NonRetryable);
    }

    fn bucket_state(bucket: &RequestBucket, tokens: u32, refilled_at: Instant) -> BucketState {
        assert!(tokens <= bucket.capacity);
        BucketState { tokens, refilled_at }
    }

    #[test]
    fn bucket_bursts_then_waits_only_for_the_next_token() {
        let bucket = RequestBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(500),
        });
        let start = Instant::now();
        let mut state = bucket_state(&bucket, 2, start);

        assert_eq!(bucket.try_take(&mut state, start), Ok(()));
        assert_eq!(bucket.try_take(&mut state, start), Ok(()));
        let at = start + Duration::from_millis(200);
        assert_eq!(bucket.try_take(&mut state, at), Err(Duration::from_millis(300)));

        // Partial progress toward the next token survives a refill.
        let at = start + Duration::from_millis(700);
        assert_eq!(bucket.try_take(&mut state, at), Ok(()));
        assert_eq!(bucket.try_take(&mut state, at), Err(Duration::from_millis(300)));

        let idle = start + Duration::from_secs(60);
        assert_eq!(bucket.try_take(&mut state, idle), Ok(()));
        assert_eq!(bucket.try_take(&mut state, idle), Ok(()));
        assert!(bucket.try_take(&mut state, idle).is_err());
    }

    #[test]
    fn zero_interval_bucket_never_blocks() {
        let bucket = RequestBucket::new(TokenBucketConfig::per_second(0));
        let now = Instant::now();
        let mut state = bucket_state(&bucket, 0, now);
        for _ in 0..10_000 {
            assert_eq!(bucket.try_take(&mut state, now), Ok(()));
        }
    }

    #[test]
    fn per_second_rates_keep_a_nonzero_interval() {
        assert_eq!(
            TokenBucketConfig::per_second(2).refill_every,
            Duration::from_millis(500)
        );
        let fast = TokenBucketConfig::per_second(5_000);
        assert_eq!(fast.capacity, 5_000);
        assert_eq!(fast.refill_every, Duration::from_micros(200));
        assert!(!fast.refill_every.is_zero());
    }

    #[tokio::test]
    async fn unpaced_bucket_take_returns_immediately() {
        let bucket = RequestBucket::new(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::ZERO,
        });
        for _ in 0..100 {
            tokio::time::timeout(Duration::from_secs(1), bucket.take())
                .await
                .unwrap();
        }
    }
}
