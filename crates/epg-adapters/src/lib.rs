//! Fetcher contract plus the upstream API and fixture-backed implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use epg_core::{buckets_from_entries, DateRange, DayBucket, FetchRequest, TimeResolver};
use epg_storage::{FetchError, HttpFetcher, HttpRequest, RawPayloadArchive};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "epg-adapters";

/// Query parameter carrying the day offset relative to today.
pub const OFFSET_PARAM: &str = "epg_from";
/// Query parameter carrying the number of days requested.
pub const SPAN_PARAM: &str = "epg_limit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream payload is not valid JSON: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("fixture {}: {message}", path.display())]
    Fixture { path: PathBuf, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait EpgFetcher: Send + Sync {
    /// Fetch `request.span_days` days starting `request.offset_from_today_days` from today.
    async fn fetch(
        &self,
        ctx: &FetchContext,
        request: &FetchRequest,
    ) -> Result<Vec<DayBucket>, AdapterError>;
}

/// Turn an upstream response body into day buckets.
///
/// Accepted shapes, in order: a JSON list; an object with an `epg` list; a
/// single record object with `title` and `timestart`/`timestop`; any object
/// holding a list of objects. Anything else yields an empty batch.
pub fn parse_epg_payload(payload: Value) -> Vec<DayBucket> {
    let entries = match payload {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => {
            if let Some(Value::Array(entries)) = obj.remove("epg") {
                entries
            } else if obj.contains_key("title")
                && (obj.contains_key("timestart") || obj.contains_key("timestop"))
            {
                vec![Value::Object(obj)]
            } else if let Some(entries) = first_object_list(obj) {
                entries
            } else {
                warn!("upstream object has no recognizable EPG list");
                return Vec::new();
            }
        }
        other => {
            warn!(kind = ?other, "unexpected upstream payload");
            return Vec::new();
        }
    };

    let parsed = buckets_from_entries(entries);
    if parsed.rejected > 0 {
        warn!(rejected = parsed.rejected, "dropped non-object upstream entries");
    }
    parsed.buckets
}

fn first_object_list(obj: serde_json::Map<String, Value>) -> Option<Vec<Value>> {
    obj.into_iter().find_map(|(_, value)| match value {
        Value::Array(items) if items.first().is_some_and(Value::is_object) => Some(items),
        _ => None,
    })
}

/// Keep only records whose day falls inside `window`.
///
/// A record without a resolvable start is placed by its bucket label.
pub fn restrict_to_window(
    buckets: Vec<DayBucket>,
    window: &DateRange,
    resolver: &TimeResolver,
) -> Vec<DayBucket> {
    buckets
        .into_iter()
        .filter_map(|mut bucket| {
            let label_date = bucket.label_date();
            bucket.records.retain(|record| {
                resolver
                    .resolve_date(record)
                    .or(label_date)
                    .is_some_and(|day| window.contains_date(day))
            });
            (!bucket.records.is_empty()).then_some(bucket)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct IptvApiFetcher {
    source_id: String,
    base_url: String,
    params: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    http: Arc<HttpFetcher>,
    archive: Option<RawPayloadArchive>,
}

impl IptvApiFetcher {
    pub fn new(
        source_id: impl Into<String>,
        base_url: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            http,
            archive: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_archive(mut self, archive: RawPayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn http_request(&self, request: &FetchRequest) -> HttpRequest {
        let mut query: Vec<(String, String)> = self
            .params
            .iter()
            .filter(|(key, _)| key.as_str() != OFFSET_PARAM && key.as_str() != SPAN_PARAM)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.push((OFFSET_PARAM.to_string(), request.offset_from_today_days.to_string()));
        query.push((SPAN_PARAM.to_string(), request.span_days.to_string()));

        HttpRequest {
            url: self.base_url.clone(),
            query,
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl EpgFetcher for IptvApiFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        request: &FetchRequest,
    ) -> Result<Vec<DayBucket>, AdapterError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &self.source_id, &self.http_request(request))
            .await?;

        if let Some(archive) = &self.archive {
            match archive
                .archive(ctx.fetched_at, &self.source_id, &response.body)
                .await
            {
                Ok(stored) => debug!(
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived upstream payload"
                ),
                Err(err) => warn!(error = %err, "failed to archive upstream payload"),
            }
        }

        let payload: Value =
            serde_json::from_slice(&response.body).map_err(AdapterError::Payload)?;
        Ok(parse_epg_payload(payload))
    }
}

/// Serves requests from a local store-shaped JSON file.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    source_id: String,
    path: PathBuf,
    resolver: TimeResolver,
}

impl FixtureFetcher {
    pub fn new(
        source_id: impl Into<String>,
        path: impl Into<PathBuf>,
        resolver: TimeResolver,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            resolver,
        }
    }

    async fn load(&self) -> Result<Vec<DayBucket>, AdapterError> {
        let fixture_err = |message: String| AdapterError::Fixture {
            path: self.path.clone(),
            message,
        };
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| fixture_err(e.to_string()))?;
        let payload: Value = serde_json::from_str(&text).map_err(|e| fixture_err(e.to_string()))?;
        Ok(parse_epg_payload(payload))
    }
}

#[async_trait]
impl EpgFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        request: &FetchRequest,
    ) -> Result<Vec<DayBucket>, AdapterError> {
        let window = request.window(ctx.today);
        let buckets = self.load().await?;
        debug!(source_id = %self.source_id, %window, "serving fixture window");
        Ok(restrict_to_window(buckets, &window, &self.resolver))
    }
}
