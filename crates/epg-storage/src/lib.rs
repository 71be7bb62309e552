//! Store/metadata persistence, raw payload archive, and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use epg_core::{buckets_from_entries, CoverageMetadata, DayBucket};
use reqwest::StatusCode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "epg-storage";

pub const STORE_FILE_NAME: &str = "raw_epg.json";
pub const METADATA_FILE_NAME: &str = "epg_metadata.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{}: expected a JSON list, found {found}", path.display())]
    Shape { path: PathBuf, found: &'static str },
    #[error("serializing {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("writing {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Write `bytes` to `path` through a temp file in the same directory and an atomic rename.
///
/// The previous file at `path` stays intact unless the rename succeeds.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(err));
    }
    Ok(())
}

/// Outcome of reading the persisted store. Never an error: a missing or
/// unreadable store is reported so the caller can fall back to a full fetch.
#[derive(Debug)]
pub enum StoreLoad {
    Loaded(Vec<DayBucket>),
    Missing,
    Unreadable(StoreError),
}

impl StoreLoad {
    pub fn into_buckets(self) -> Vec<DayBucket> {
        match self {
            StoreLoad::Loaded(buckets) => buckets,
            StoreLoad::Missing | StoreLoad::Unreadable(_) => Vec::new(),
        }
    }
}

/// The day-bucketed record store (`raw_epg.json`).
#[derive(Debug, Clone)]
pub struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STORE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> StoreLoad {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StoreLoad::Missing,
            Err(source) => {
                return StoreLoad::Unreadable(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(source) => {
                return StoreLoad::Unreadable(StoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let entries = match value {
            Value::Array(entries) => entries,
            other => {
                return StoreLoad::Unreadable(StoreError::Shape {
                    path: self.path.clone(),
                    found: json_kind(&other),
                })
            }
        };

        let parsed = buckets_from_entries(entries);
        if parsed.rejected > 0 {
            warn!(
                path = %self.path.display(),
                rejected = parsed.rejected,
                "dropped non-object entries from store"
            );
        }
        StoreLoad::Loaded(parsed.buckets)
    }

    pub async fn save(&self, buckets: &[DayBucket]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(buckets).map_err(|source| StoreError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Coverage summary written alongside the store (`epg_metadata.json`).
#[derive(Debug, Clone)]
pub struct MetadataFile {
    path: PathBuf,
}

impl MetadataFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(METADATA_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unparsable metadata reads as `None`.
    pub async fn load(&self) -> Option<CoverageMetadata> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "metadata unreadable");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "metadata corrupt; ignoring");
                None
            }
        }
    }

    pub async fn save(&self, metadata: &CoverageMetadata) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(metadata).map_err(|source| StoreError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        write_atomic(&self.path, &bytes).await
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw upstream responses.
#[derive(Debug, Clone)]
pub struct RawPayloadArchive {
    root: PathBuf,
}

impl RawPayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(source_id)
            .join(day)
            .join(format!("{content_hash}.json"))
    }

    /// Identical payloads on the same day land on the same path and are written once.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving payload for {source_id}"))?;
        }

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A GET request against an upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn build_headers(request: &HttpRequest) -> Result<reqwest::header::HeaderMap, FetchError> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if value.is_empty() {
                continue;
            }
            let invalid = || FetchError::InvalidHeader { name: name.clone() };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let headers = Self::build_headers(request)?;
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);

        async {
            let mut attempt = 0;
            loop {
                let resp_result = self
                    .client
                    .get(&request.url)
                    .query(&request.query)
                    .headers(headers.clone())
                    .send()
                    .await;
                let can_retry = attempt < self.backoff.max_retries;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable && can_retry {
                            warn!(status = status.as_u16(), attempt, "retrying upstream status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        let retryable =
                            classify_reqwest_error(&err) == RetryDisposition::Retryable;
                        if retryable && can_retry {
                            warn!(error = %err, attempt, "retrying failed request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use epg_core::{FetchRequest, PersistedRange, ProgramRecord};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one canned response per connection and records each request line.
    async fn scripted_upstream(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&raw);
                let line = text.lines().next().unwrap_or_default().to_string();
                log.lock().unwrap().push(line);
                let head = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-length: {}\r\n",
                    body.len()
                );
                let reply = format!("{head}connection: close\r\n\r\n{body}");
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/epg"), seen)
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    fn sample_buckets() -> Vec<DayBucket> {
        let date = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        vec![DayBucket::for_date(
            date,
            vec![ProgramRecord::new("Film")
                .with("timestart", 1_771_934_400)
                .with("id", 7)],
            false,
        )]
    }

    #[test]
    fn payload_hashing_is_stable() {
        let hash = RawPayloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let archive = RawPayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(fetched_at, "iptv", br#"{"epg":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, "iptv", br#"{"epg":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn store_round_trips_and_reports_missing() {
        let dir = tempdir().expect("tempdir");
        let store = StoreFile::in_dir(dir.path().join("iptv"));
        assert!(matches!(store.load().await, StoreLoad::Missing));

        let buckets = sample_buckets();
        store.save(&buckets).await.expect("save");
        match store.load().await {
            StoreLoad::Loaded(loaded) => assert_eq!(loaded, buckets),
            other => panic!("unexpected load result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_store_is_reported_not_raised() {
        let dir = tempdir().expect("tempdir");
        let store = StoreFile::in_dir(dir.path());
        tokio::fs::write(store.path(), b"[{\"date\": ").await.unwrap();
        assert!(matches!(
            store.load().await,
            StoreLoad::Unreadable(StoreError::Corrupt { .. })
        ));

        tokio::fs::write(store.path(), b"{\"epg\": []}").await.unwrap();
        let load = store.load().await;
        assert!(matches!(load, StoreLoad::Unreadable(StoreError::Shape { .. })));
        assert!(load.into_buckets().is_empty());
    }

    #[tokio::test]
    async fn failed_write_leaves_previous_store_intact() {
        let dir = tempdir().expect("tempdir");
        let store = StoreFile::in_dir(dir.path());
        store.save(&sample_buckets()).await.expect("save");

        let blocked = StoreFile::new(store.path().join("nested.json"));
        let err = blocked.save(&[]).await.expect_err("parent is a file");
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(store.load().await.into_buckets(), sample_buckets());
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let dir = tempdir().expect("tempdir");
        let file = MetadataFile::in_dir(dir.path());
        assert!(file.load().await.is_none());

        let day = NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        let range = epg_core::DateRange::around(day, 7, 14);
        let meta = CoverageMetadata {
            last_update: day.and_hms_opt(10, 0, 0).unwrap(),
            coverage: PersistedRange::from(range),
            existing_ranges: vec![PersistedRange::from(range)],
            retention_days: 30,
            total_records: 3,
            last_requests: vec![FetchRequest {
                offset_from_today_days: -7,
                span_days: 22,
                description: "full window".into(),
            }],
        };
        file.save(&meta).await.expect("save");
        assert_eq!(file.load().await, Some(meta));

        tokio::fs::write(file.path(), b"not json").await.unwrap();
        assert!(file.load().await.is_none());
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
    }

    #[test]
    fn empty_headers_are_skipped_and_bad_names_rejected() {
        let request = HttpRequest {
            url: "http://example.invalid".into(),
            query: vec![],
            headers: vec![("x-token".into(), String::new()), ("User-Agent".into(), "t".into())],
        };
        let headers = HttpFetcher::build_headers(&request).expect("headers");
        assert_eq!(headers.len(), 1);

        let bad = HttpRequest {
            headers: vec![("bad header".into(), "v".into())],
            ..request
        };
        assert!(matches!(
            HttpFetcher::build_headers(&bad),
            Err(FetchError::InvalidHeader { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_retries_server_errors_then_returns_body() {
        let (url, seen) = scripted_upstream(vec![(503, "busy"), (200, r#"{"epg":[]}"#)]).await;
        let request = HttpRequest {
            url,
            query: vec![("epg_from".into(), "1".into()), ("epg_limit".into(), "2".into())],
            headers: vec![],
        };

        let response = quick_fetcher()
            .fetch_bytes(Uuid::nil(), "iptv", &request)
            .await
            .expect("fetch");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, br#"{"epg":[]}"#.to_vec());

        let lines = seen.lock().unwrap().clone();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("GET /epg?epg_from=1&epg_limit=2 "));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, seen) = scripted_upstream(vec![(404, "{}"), (200, "{}")]).await;
        let request = HttpRequest {
            url,
            ..HttpRequest::default()
        };

        let err = quick_fetcher()
            .fetch_bytes(Uuid::nil(), "iptv", &request)
            .await
            .expect_err("404 is final");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
