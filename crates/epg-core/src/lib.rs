//! Core domain model for the EPG incremental sync engine.

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    Utc,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "epg-core";

/// Native day label format used by the upstream guide (`DD.MM.YYYY`).
pub const DATE_LABEL_FORMAT: &str = "%d.%m.%Y";

/// Weekday suffixes for regenerated bucket titles, Monday first.
pub const WEEKDAY_LABELS: [&str; 7] = ["ПН", "ВТ", "СР", "ЧТ", "ПТ", "СБ", "ВС"];

/// Candidate start-time fields, in resolution order.
pub const START_TIME_FIELDS: [&str; 6] = [
    "mskdatetimestart",
    "usrdatetimestart",
    "timestart",
    "broadcast_time",
    "start_time",
    "time_start",
];

/// Identifier-like fields used as the last component of the identity key.
pub const ID_FIELDS: [&str; 4] = ["id", "channel_id", "program_id", "epg_id"];

const NAIVE_DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
];

const NAIVE_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", DATE_LABEL_FORMAT];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty date value")]
    Empty,
    #[error("unrecognized date format: {0:?}")]
    UnrecognizedFormat(String),
    #[error("epoch value out of range: {0}")]
    EpochOutOfRange(f64),
    #[error("unsupported date value: {0}")]
    UnsupportedValue(String),
    #[error("invalid utc offset: {0} hours")]
    InvalidOffset(i32),
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Window of `past_days` before and `future_days` after `today`.
    pub fn around(today: NaiveDate, past_days: i64, future_days: i64) -> Self {
        let start = shift_days(today, -past_days.max(0));
        let end = shift_days(today, future_days.max(0));
        Self { start, end }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        self.contains_date(instant.date())
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn covers(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn days_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn start_instant(&self) -> NaiveDateTime {
        self.start.and_time(NaiveTime::MIN)
    }

    /// Last whole second of the final day.
    pub fn end_instant(&self) -> NaiveDateTime {
        self.end.and_time(NaiveTime::MIN) + Duration::seconds(86_399)
    }

    /// Intersection with `bounds`, if any.
    pub fn clip(&self, bounds: &DateRange) -> Option<DateRange> {
        DateRange::new(self.start.max(bounds.start), self.end.min(bounds.end))
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// `date` moved by `days`, saturating at the calendar bounds.
pub fn shift_days(date: NaiveDate, days: i64) -> NaiveDate {
    let magnitude = Days::new(days.unsigned_abs());
    if days >= 0 {
        date.checked_add_days(magnitude).unwrap_or(NaiveDate::MAX)
    } else {
        date.checked_sub_days(magnitude).unwrap_or(NaiveDate::MIN)
    }
}

/// Sweeps a set of calendar days into contiguous ranges.
///
/// A day within `gap_tolerance_days` of the running range end extends it;
/// anything further starts a new range. The input is sorted and deduplicated
/// before the sweep, so the output is sorted and non-overlapping.
pub fn build_ranges<I>(dates: I, gap_tolerance_days: i64) -> Vec<DateRange>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let sorted: BTreeSet<NaiveDate> = dates.into_iter().collect();
    let tolerance = gap_tolerance_days.max(1);

    let mut ranges = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut current = DateRange::day(first);
    for date in iter {
        if (date - current.end).num_days() <= tolerance {
            current.end = date;
        } else {
            ranges.push(current);
            current = DateRange::day(date);
        }
    }
    ranges.push(current);
    ranges
}

/// True when every day of `target` falls inside one of `ranges`.
pub fn ranges_cover(ranges: &[DateRange], target: &DateRange) -> bool {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut cursor = target.start;
    for range in &sorted {
        if range.start > cursor {
            return false;
        }
        if range.end >= cursor {
            if range.end >= target.end {
                return true;
            }
            cursor = range.end + Duration::days(1);
        }
    }
    false
}

/// Converts raw date values to wall-clock time in the guide's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeResolver {
    offset: FixedOffset,
}

impl Default for TimeResolver {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimeResolver {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn from_utc_offset_hours(hours: i32) -> Result<Self, ParseError> {
        hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .map(Self::new)
            .ok_or(ParseError::InvalidOffset(hours))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> NaiveDateTime {
        self.localize(Utc::now())
    }

    pub fn localize(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    pub fn from_epoch(&self, secs: f64) -> Result<NaiveDateTime, ParseError> {
        if !secs.is_finite() {
            return Err(ParseError::EpochOutOfRange(secs));
        }
        let whole = secs.trunc();
        let nanos = ((secs - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
            .map(|dt| self.localize(dt))
            .ok_or(ParseError::EpochOutOfRange(secs))
    }

    pub fn parse_value(&self, value: &Value) -> Result<NaiveDateTime, ParseError> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ParseError::UnsupportedValue(n.to_string()))
                .and_then(|secs| self.from_epoch(secs)),
            Value::String(s) => self.parse_str(s),
            Value::Null => Err(ParseError::Empty),
            other => Err(ParseError::UnsupportedValue(other.to_string())),
        }
    }

    pub fn parse_str(&self, raw: &str) -> Result<NaiveDateTime, ParseError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.contains('T') {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&self.offset).naive_local());
            }
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Ok(dt.with_timezone(&self.offset).naive_local());
            }
        }

        for fmt in NAIVE_DATETIME_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(dt);
            }
        }
        for fmt in NAIVE_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                return Ok(date.and_time(NaiveTime::MIN));
            }
        }

        match s.parse::<f64>() {
            Ok(secs) => self.from_epoch(secs),
            Err(_) => Err(ParseError::UnrecognizedFormat(s.to_string())),
        }
    }

    /// First candidate start-time field that parses wins.
    pub fn resolve_start(&self, record: &ProgramRecord) -> Option<NaiveDateTime> {
        START_TIME_FIELDS
            .iter()
            .filter_map(|field| record.get(field))
            .filter(|value| !is_empty_value(value))
            .find_map(|value| self.parse_value(value).ok())
    }

    pub fn resolve_date(&self, record: &ProgramRecord) -> Option<NaiveDate> {
        self.resolve_start(record).map(|dt| dt.date())
    }
}

/// Falsy values (`null`, `false`, `0`, `""`, `[]`, `{}`) carry no information.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn value_to_key_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A single scheduled programme: a title plus every other field passed through.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ProgramRecord {
    pub title: Option<String>,
    pub attrs: Map<String, Value>,
}

impl From<Map<String, Value>> for ProgramRecord {
    fn from(mut attrs: Map<String, Value>) -> Self {
        let title = match attrs.remove("title") {
            Some(Value::String(title)) => Some(title),
            Some(Value::Null) | None => None,
            Some(other) => {
                attrs.insert("title".to_string(), other);
                None
            }
        };
        Self { title, attrs }
    }
}

impl From<ProgramRecord> for Map<String, Value> {
    fn from(record: ProgramRecord) -> Self {
        let mut map = record.attrs;
        if let Some(title) = record.title {
            map.insert("title".to_string(), Value::String(title));
        }
        map
    }
}

impl ProgramRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            attrs: Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attrs.get(field)
    }

    /// Title with surrounding whitespace removed; blank titles count as absent.
    pub fn usable_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn best_available_id(&self) -> String {
        ID_FIELDS
            .iter()
            .filter_map(|field| self.get(field))
            .find(|value| !is_empty_value(value))
            .map(value_to_key_fragment)
            .unwrap_or_default()
    }

    /// Raw value of the first populated start-time field.
    pub fn raw_start(&self) -> Option<&Value> {
        START_TIME_FIELDS
            .iter()
            .filter_map(|field| self.get(field))
            .find(|value| !is_empty_value(value))
    }

    /// `normalize(title)|start|id`, or `None` for untitled records.
    pub fn identity_key(&self, resolver: &TimeResolver) -> Option<String> {
        let title = normalize_title(self.usable_title()?);
        let start = match resolver.resolve_start(self) {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => self.raw_start().map(value_to_key_fragment).unwrap_or_default(),
        };
        Some(format!("{title}|{start}|{}", self.best_available_id()))
    }

    /// Number of non-empty fields, title included.
    pub fn completeness(&self) -> usize {
        let title = usize::from(self.usable_title().is_some());
        title + self.attrs.values().filter(|v| !is_empty_value(v)).count()
    }
}

pub fn date_label(date: NaiveDate) -> String {
    date.format(DATE_LABEL_FORMAT).to_string()
}

pub fn day_title(date: NaiveDate) -> String {
    let weekday = WEEKDAY_LABELS[date.weekday().num_days_from_monday() as usize];
    format!("{} {weekday}", date_label(date))
}

pub fn parse_date_label(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label.trim(), DATE_LABEL_FORMAT).ok()
}

/// On-disk grouping of records under one native day label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayBucket {
    #[serde(rename = "date", default)]
    pub date_label: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "data", default)]
    pub records: Vec<ProgramRecord>,
    #[serde(rename = "current", default)]
    pub is_current: bool,
}

impl DayBucket {
    pub fn for_date(date: NaiveDate, records: Vec<ProgramRecord>, is_current: bool) -> Self {
        Self {
            date_label: date_label(date),
            title: day_title(date),
            records,
            is_current,
        }
    }

    pub fn label_date(&self) -> Option<NaiveDate> {
        parse_date_label(&self.date_label)
    }
}

pub fn record_count(buckets: &[DayBucket]) -> usize {
    buckets.iter().map(|b| b.records.len()).sum()
}

/// Result of validating a raw JSON list at the read boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntries {
    pub buckets: Vec<DayBucket>,
    pub rejected: usize,
}

/// Accepts day buckets (objects with a `data` list), bare records, or a mix.
///
/// Bare records are gathered into one label-less bucket appended at the end.
/// Non-object entries are counted in `rejected` and dropped.
pub fn buckets_from_entries(entries: Vec<Value>) -> ParsedEntries {
    let mut parsed = ParsedEntries::default();
    let mut loose = Vec::new();

    for entry in entries {
        let Value::Object(mut obj) = entry else {
            parsed.rejected += 1;
            continue;
        };

        if !matches!(obj.get("data"), Some(Value::Array(_))) {
            loose.push(ProgramRecord::from(obj));
            continue;
        }

        let items = match obj.remove("data") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(fields) => records.push(ProgramRecord::from(fields)),
                _ => parsed.rejected += 1,
            }
        }

        parsed.buckets.push(DayBucket {
            date_label: string_field(&obj, "date"),
            title: string_field(&obj, "title"),
            records,
            is_current: obj.get("current").and_then(Value::as_bool).unwrap_or(false),
        });
    }

    if !loose.is_empty() {
        parsed.buckets.push(DayBucket {
            date_label: String::new(),
            title: String::new(),
            records: loose,
            is_current: false,
        });
    }
    parsed
}

fn string_field(obj: &Map<String, Value>, field: &str) -> String {
    obj.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// One upstream call, expressed relative to the current day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub offset_from_today_days: i64,
    pub span_days: i64,
    pub description: String,
}

impl FetchRequest {
    /// Absolute window this request asks for.
    pub fn window(&self, today: NaiveDate) -> DateRange {
        let start = shift_days(today, self.offset_from_today_days);
        let end = shift_days(start, self.span_days.max(1) - 1);
        DateRange { start, end }
    }
}

/// Result of comparing a store against a target window. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EpgAnalysis {
    pub existing_ranges: Vec<DateRange>,
    pub missing_ranges: Vec<DateRange>,
    pub stale_records: Vec<ProgramRecord>,
    pub total_records: usize,
    pub coverage: DateRange,
    pub needs_update: bool,
}

impl EpgAnalysis {
    pub fn cold_start(target: DateRange) -> Self {
        Self {
            existing_ranges: Vec::new(),
            missing_ranges: vec![target],
            stale_records: Vec::new(),
            total_records: 0,
            coverage: target,
            needs_update: true,
        }
    }

    pub fn is_stale_only(&self) -> bool {
        self.missing_ranges.is_empty() && !self.stale_records.is_empty()
    }
}

/// Range as written to the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default)]
    pub days: i64,
}

impl From<DateRange> for PersistedRange {
    fn from(range: DateRange) -> Self {
        Self {
            start: range.start_instant(),
            end: range.end_instant(),
            days: range.days_count(),
        }
    }
}

impl PersistedRange {
    pub fn to_range(&self) -> Option<DateRange> {
        DateRange::new(self.start.date(), self.end.date())
    }
}

/// Summary of the last reconciliation cycle, used for the skip check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetadata {
    pub last_update: NaiveDateTime,
    #[serde(rename = "date_coverage")]
    pub coverage: PersistedRange,
    #[serde(default)]
    pub existing_ranges: Vec<PersistedRange>,
    #[serde(alias = "cleanup_threshold_days")]
    pub retention_days: i64,
    #[serde(rename = "total_items", default)]
    pub total_records: usize,
    #[serde(default)]
    pub last_requests: Vec<FetchRequest>,
}

impl CoverageMetadata {
    pub fn coverage_range(&self) -> Option<DateRange> {
        self.coverage.to_range()
    }

    pub fn existing(&self) -> Vec<DateRange> {
        self.existing_ranges
            .iter()
            .filter_map(PersistedRange::to_range)
            .collect()
    }
}
