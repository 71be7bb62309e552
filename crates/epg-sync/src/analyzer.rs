use std::collections::BTreeSet;

use chrono::{Days, NaiveDate, NaiveDateTime};
use epg_core::{build_ranges, DateRange, DayBucket, EpgAnalysis, TimeResolver};
use tracing::warn;

/// Window and retention knobs shared by the analyzer, merger, and metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoveragePolicy {
    pub past_days: i64,
    pub future_days: i64,
    pub retention_days: i64,
    pub gap_tolerance_days: i64,
    pub staleness_hours: i64,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        Self {
            past_days: 7,
            future_days: 14,
            retention_days: 30,
            gap_tolerance_days: 1,
            staleness_hours: 6,
        }
    }
}

impl CoveragePolicy {
    pub fn target_window(&self, today: NaiveDate) -> DateRange {
        DateRange::around(today, self.past_days, self.future_days)
    }

    /// Records dated strictly before this day are expired.
    pub fn retention_cutoff(&self, now: NaiveDateTime) -> NaiveDate {
        let today = now.date();
        u64::try_from(self.retention_days)
            .ok()
            .and_then(|days| today.checked_sub_days(Days::new(days)))
            .unwrap_or(today)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoverageAnalyzer {
    policy: CoveragePolicy,
    resolver: TimeResolver,
}

impl CoverageAnalyzer {
    pub fn new(policy: CoveragePolicy, resolver: TimeResolver) -> Self {
        Self { policy, resolver }
    }

    /// Compare `store` against `target`. An empty store is a cold start.
    pub fn analyze(
        &self,
        target: &DateRange,
        store: &[DayBucket],
        now: NaiveDateTime,
    ) -> EpgAnalysis {
        let mut total_records = 0usize;
        let mut unresolved = 0usize;
        let mut dates = BTreeSet::new();
        let mut stale_records = Vec::new();
        let cutoff = self.policy.retention_cutoff(now);

        for record in store.iter().flat_map(|bucket| bucket.records.iter()) {
            total_records += 1;
            match self.resolver.resolve_date(record) {
                Some(day) => {
                    dates.insert(day);
                    if day < cutoff {
                        stale_records.push(record.clone());
                    }
                }
                None => unresolved += 1,
            }
        }

        if total_records == 0 {
            return EpgAnalysis::cold_start(*target);
        }
        if unresolved > 0 {
            warn!(unresolved, "records without a resolvable start excluded from coverage");
        }

        let coverage = match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => DateRange::new(*first, *last).unwrap_or(*target),
            _ => *target,
        };
        let existing_ranges = build_ranges(dates, self.policy.gap_tolerance_days);
        let missing_ranges = missing_ranges(target, &existing_ranges);
        let needs_update = !missing_ranges.is_empty() || !stale_records.is_empty();

        EpgAnalysis {
            existing_ranges,
            missing_ranges,
            stale_records,
            total_records,
            coverage,
            needs_update,
        }
    }
}

/// Gaps of `target` not covered by `existing` (sorted, non-overlapping).
pub fn missing_ranges(target: &DateRange, existing: &[DateRange]) -> Vec<DateRange> {
    let mut missing = Vec::new();
    let mut cursor = target.start();

    for range in existing {
        if cursor < range.start() {
            let gap_end = range.start().pred_opt().unwrap_or(range.start());
            if let Some(gap) = DateRange::new(cursor, gap_end).and_then(|gap| gap.clip(target)) {
                missing.push(gap);
            }
        }
        match range.end().succ_opt() {
            Some(next) => cursor = cursor.max(next),
            None => return missing,
        }
    }

    if cursor <= target.end() {
        if let Some(tail) = DateRange::new(cursor, target.end()) {
            missing.push(tail);
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use epg_core::ProgramRecord;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn range(a: u32, b: u32) -> DateRange {
        DateRange::new(day(a), day(b)).unwrap()
    }

    fn noon(date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(12, 0, 0).unwrap()
    }

    fn record_on(title: &str, date: NaiveDate) -> ProgramRecord {
        ProgramRecord::new(title).with(
            "mskdatetimestart",
            noon(date).format("%Y-%m-%d %H:%M:%S").to_string(),
        )
    }

    fn store_for(dates: &[NaiveDate]) -> Vec<DayBucket> {
        dates
            .iter()
            .map(|d| DayBucket::for_date(*d, vec![record_on("show", *d)], false))
            .collect()
    }

    fn analyzer() -> CoverageAnalyzer {
        CoverageAnalyzer::new(CoveragePolicy::default(), TimeResolver::utc())
    }

    #[test]
    fn gap_sweep_matches_reference_example() {
        let missing = missing_ranges(&range(1, 20), &[range(5, 10)]);
        assert_eq!(missing, vec![range(1, 4), range(11, 20)]);
    }

    #[test]
    fn gap_sweep_clips_ranges_outside_target() {
        let target = range(10, 20);
        let existing = vec![range(1, 12), range(15, 16), range(25, 28)];
        assert_eq!(missing_ranges(&target, &existing), vec![range(13, 14), range(17, 20)]);
        assert!(missing_ranges(&target, &[range(1, 31)]).is_empty());
    }

    #[test]
    fn empty_store_is_cold_start() {
        let target = range(1, 20);
        let analysis = analyzer().analyze(&target, &[], noon(day(10)));
        assert_eq!(analysis.missing_ranges, vec![target]);
        assert!(analysis.needs_update);
        assert_eq!(analysis.total_records, 0);
        assert_eq!(analysis.coverage, target);
    }

    #[test]
    fn exact_coverage_needs_nothing() {
        let target = range(1, 5);
        let dates: Vec<_> = (1..=5).map(day).collect();
        let analysis = analyzer().analyze(&target, &store_for(&dates), noon(day(3)));
        assert!(analysis.missing_ranges.is_empty());
        assert_eq!(analysis.existing_ranges, vec![target]);
        assert_eq!(analysis.coverage, target);
        assert!(!analysis.needs_update);
    }

    #[test]
    fn partial_coverage_reports_gaps_and_coverage_bounds() {
        let target = range(1, 20);
        let dates: Vec<_> = (5..=10).map(day).collect();
        let analysis = analyzer().analyze(&target, &store_for(&dates), noon(day(8)));
        assert_eq!(analysis.existing_ranges, vec![range(5, 10)]);
        assert_eq!(analysis.missing_ranges, vec![range(1, 4), range(11, 20)]);
        assert_eq!(analysis.coverage, range(5, 10));
        assert_eq!(analysis.total_records, 6);
    }

    #[test]
    fn stale_records_alone_flag_an_update() {
        let policy = CoveragePolicy {
            retention_days: 3,
            ..CoveragePolicy::default()
        };
        let analyzer = CoverageAnalyzer::new(policy, TimeResolver::utc());
        let dates: Vec<_> = (1..=10).map(day).collect();
        let analysis = analyzer.analyze(&range(1, 10), &store_for(&dates), noon(day(10)));
        assert!(analysis.missing_ranges.is_empty());
        assert_eq!(analysis.stale_records.len(), 6);
        assert!(analysis.needs_update);
        assert!(analysis.is_stale_only());
    }

    #[test]
    fn undated_records_count_but_do_not_cover() {
        let target = range(1, 3);
        let store = vec![DayBucket::for_date(
            day(2),
            vec![ProgramRecord::new("tba"), ProgramRecord::new("bad").with("timestart", "soon")],
            false,
        )];
        let analysis = analyzer().analyze(&target, &store, noon(day(2)));
        assert_eq!(analysis.total_records, 2);
        assert!(analysis.existing_ranges.is_empty());
        assert_eq!(analysis.missing_ranges, vec![target]);
        assert_eq!(analysis.coverage, target);
    }

    #[test]
    fn target_window_spans_past_and_future() {
        let window = CoveragePolicy::default().target_window(day(15));
        assert_eq!(window.start(), day(8));
        assert_eq!(window.end(), day(29));
        assert_eq!(window.days_count(), 22);
    }
}
