use chrono::NaiveDate;
use epg_core::{DateRange, FetchRequest};

/// One upstream request per missing range, expressed relative to `today`.
pub fn plan_requests(missing: &[DateRange], today: NaiveDate) -> Vec<FetchRequest> {
    missing
        .iter()
        .map(|range| {
            let span_days = range.days_count();
            FetchRequest {
                offset_from_today_days: (range.start() - today).num_days(),
                span_days,
                description: format!("{} to {} ({span_days} days)", range.start(), range.end()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn range_starting_today_maps_to_offset_zero() {
        let today = day(10);
        let requests = plan_requests(&[DateRange::new(today, day(12)).unwrap()], today);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].offset_from_today_days, 0);
        assert_eq!(requests[0].span_days, 3);
        assert_eq!(requests[0].description, "2026-03-10 to 2026-03-12 (3 days)");
    }

    #[test]
    fn one_request_per_range_including_past_ones() {
        let today = day(10);
        let missing = vec![
            DateRange::new(day(3), day(4)).unwrap(),
            DateRange::new(day(5), day(5)).unwrap(),
            DateRange::new(day(20), day(24)).unwrap(),
        ];
        let requests = plan_requests(&missing, today);
        let shape: Vec<_> = requests
            .iter()
            .map(|r| (r.offset_from_today_days, r.span_days))
            .collect();
        assert_eq!(shape, vec![(-7, 2), (-5, 1), (10, 5)]);

        for (request, range) in requests.iter().zip(&missing) {
            assert_eq!(request.window(today), *range);
        }
    }

    #[test]
    fn nothing_missing_plans_nothing() {
        assert!(plan_requests(&[], day(1)).is_empty());
    }
}
