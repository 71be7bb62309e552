use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use epg_core::{
    ranges_cover, CoverageMetadata, DateRange, EpgAnalysis, FetchRequest, PersistedRange,
};
use epg_storage::{MetadataFile, StoreError};

/// True when a recent cycle already recorded full coverage of `target`.
///
/// Metadata stamped in the future never qualifies.
pub fn should_skip_analysis(
    metadata: Option<&CoverageMetadata>,
    target: &DateRange,
    now: NaiveDateTime,
    staleness_hours: i64,
) -> bool {
    let Some(metadata) = metadata else {
        return false;
    };

    let age = now - metadata.last_update;
    if age < Duration::zero() {
        return false;
    }
    // An out-of-range threshold never expires.
    if Duration::try_hours(staleness_hours).is_some_and(|limit| age >= limit) {
        return false;
    }

    let covered = metadata
        .coverage_range()
        .is_some_and(|coverage| coverage.covers(target));
    covered && ranges_cover(&metadata.existing(), target)
}

pub fn build_metadata(
    analysis: &EpgAnalysis,
    requests_issued: &[FetchRequest],
    retention_days: i64,
    now: NaiveDateTime,
) -> CoverageMetadata {
    CoverageMetadata {
        last_update: now,
        coverage: PersistedRange::from(analysis.coverage),
        existing_ranges: analysis
            .existing_ranges
            .iter()
            .copied()
            .map(PersistedRange::from)
            .collect(),
        retention_days,
        total_records: analysis.total_records,
        last_requests: requests_issued.to_vec(),
    }
}

/// Per-source metadata file plus the retention threshold it records.
#[derive(Debug, Clone)]
pub struct CoverageMetadataStore {
    file: MetadataFile,
    retention_days: i64,
}

impl CoverageMetadataStore {
    pub fn new(file: MetadataFile, retention_days: i64) -> Self {
        Self {
            file,
            retention_days,
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>, retention_days: i64) -> Self {
        Self::new(MetadataFile::in_dir(dir), retention_days)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn load(&self) -> Option<CoverageMetadata> {
        self.file.load().await
    }

    pub async fn should_skip(
        &self,
        target: &DateRange,
        now: NaiveDateTime,
        staleness_hours: i64,
    ) -> bool {
        let metadata = self.load().await;
        should_skip_analysis(metadata.as_ref(), target, now, staleness_hours)
    }

    pub async fn save(
        &self,
        analysis: &EpgAnalysis,
        requests_issued: &[FetchRequest],
        now: NaiveDateTime,
    ) -> Result<CoverageMetadata, StoreError> {
        let metadata = build_metadata(analysis, requests_issued, self.retention_days, now);
        self.file.save(&metadata).await?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn range(a: u32, b: u32) -> DateRange {
        DateRange::new(day(a), day(b)).unwrap()
    }

    fn analysis(existing: Vec<DateRange>, coverage: DateRange) -> EpgAnalysis {
        EpgAnalysis {
            existing_ranges: existing,
            missing_ranges: Vec::new(),
            stale_records: Vec::new(),
            total_records: 12,
            coverage,
            needs_update: false,
        }
    }

    fn at(d: u32, h: u32) -> NaiveDateTime {
        day(d).and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn skip_requires_fresh_covering_metadata() {
        let target = range(5, 10);
        let full = build_metadata(&analysis(vec![range(1, 20)], range(1, 20)), &[], 30, at(8, 6));

        assert!(!should_skip_analysis(None, &target, at(8, 7), 6));
        assert!(should_skip_analysis(Some(&full), &target, at(8, 7), 6));
        assert!(!should_skip_analysis(Some(&full), &target, at(8, 12), 6));
        assert!(!should_skip_analysis(Some(&full), &target, at(8, 5), 6));
        assert!(!should_skip_analysis(Some(&full), &range(5, 25), at(8, 7), 6));
    }

    #[test]
    fn skip_rejects_coverage_with_internal_gaps() {
        let holey = build_metadata(
            &analysis(vec![range(1, 6), range(9, 20)], range(1, 20)),
            &[],
            30,
            at(8, 6),
        );
        assert!(!should_skip_analysis(Some(&holey), &range(5, 10), at(8, 7), 6));
        assert!(should_skip_analysis(Some(&holey), &range(10, 15), at(8, 7), 6));
    }

    #[test]
    fn oversized_staleness_threshold_never_expires() {
        let target = range(5, 10);
        let full = build_metadata(&analysis(vec![range(1, 20)], range(1, 20)), &[], 30, at(1, 0));

        assert!(should_skip_analysis(Some(&full), &target, at(9, 0), i64::MAX));
        assert!(!should_skip_analysis(Some(&full), &range(5, 25), at(9, 0), i64::MAX));
    }

    #[tokio::test]
    async fn save_writes_ranges_and_requests() {
        let dir = tempdir().expect("tempdir");
        let store = CoverageMetadataStore::in_dir(dir.path(), 30);
        let requests = vec![FetchRequest {
            offset_from_today_days: 2,
            span_days: 3,
            description: "gap".into(),
        }];

        let saved = store
            .save(&analysis(vec![range(1, 4)], range(1, 4)), &requests, at(3, 9))
            .await
            .expect("save");
        assert_eq!(saved.existing_ranges[0].days, 4);
        assert_eq!(saved.existing_ranges[0].end, day(4).and_hms_opt(23, 59, 59).unwrap());

        let loaded = store.load().await.expect("metadata present");
        assert_eq!(loaded, saved);
        assert_eq!(loaded.last_requests, requests);
        assert_eq!(loaded.retention_days, 30);
        assert!(store.should_skip(&range(2, 3), at(3, 10), 6).await);
    }
}
