//! Dashboard chart series
//!
//! Time-range resolution for the usage charts and the gap-filling pass
//! that keeps the time axis continuous: zero points are inserted for
//! short gaps, while long gaps get a single zero bucket adjacent to each
//! side so the chart stays visually sparse. Month bucketing is never
//! gap-filled.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSpan {
    Minute,
    Hour,
    Day,
    Month,
}

impl TimeSpan {
    pub fn seconds(&self) -> Option<i64> {
        match self {
            TimeSpan::Minute => Some(60),
            TimeSpan::Hour => Some(3600),
            TimeSpan::Day => Some(86400),
            TimeSpan::Month => None,
        }
    }

    pub fn parse(s: &str) -> Option<TimeSpan> {
        match s {
            "minute" => Some(TimeSpan::Minute),
            "hour" => Some(TimeSpan::Hour),
            "day" => Some(TimeSpan::Day),
            "month" => Some(TimeSpan::Month),
            _ => None,
        }
    }
}

/// One chart bucket. A zero-valued point carries only its timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub used_amount: f64,
    #[serde(default)]
    pub exception_count: i64,
}

impl ChartPoint {
    fn zero(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }
}

/// Chart payload plus the live rolling counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardResponse {
    pub chart_data: Vec<ChartPoint>,
    pub total_count: i64,
    pub exception_count: i64,
    pub used_amount: f64,
    pub rpm: u64,
    pub tpm: u64,
}

/// Resolve the chart range from the `type`/`timespan` query params.
/// `type` presets a lookback window and bucket size; an explicit
/// `timespan` overrides the bucket size; explicit timestamps override
/// the range bounds.
pub fn resolve_time_range(
    range_type: &str,
    timespan: &str,
    start: Option<i64>,
    end: Option<i64>,
    tz: FixedOffset,
) -> (i64, i64, TimeSpan) {
    let end_at: DateTime<Utc> = end
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    let (lookback_days, mut span) = match range_type {
        "month" => (30, TimeSpan::Day),
        "two_week" => (15, TimeSpan::Day),
        "week" => (7, TimeSpan::Day),
        "day" => (1, TimeSpan::Hour),
        _ => (7, TimeSpan::Hour),
    };

    let mut start_at = end_at - Duration::days(lookback_days);
    // day-bucketed presets align the start to local midnight
    if span == TimeSpan::Day {
        let local = start_at.with_timezone(&tz);
        if let Some(midnight) = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(tz).single())
        {
            start_at = midnight.with_timezone(&Utc);
        }
    }

    if let Some(ts) = start.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)) {
        start_at = ts;
    }

    if let Some(parsed) = TimeSpan::parse(timespan) {
        span = parsed;
    }

    (start_at.timestamp(), end_at.timestamp(), span)
}

/// Insert zero points so the time axis is continuous between `start` and
/// `end`: boundary points are aligned to the bucket grid; interior gaps
/// of one bucket pass through, gaps of 2-3 buckets are fully zero-filled,
/// and longer gaps get a single zero bucket on each side.
pub fn fill_gaps(mut data: Vec<ChartPoint>, start: i64, end: i64, span: TimeSpan) -> Vec<ChartPoint> {
    let Some(span_secs) = span.seconds() else {
        return data;
    };
    if data.is_empty() {
        return data;
    }

    // align the first point back toward start
    let first = data[0].timestamp;
    let mut first_aligned = first;
    while first_aligned - span_secs >= start {
        first_aligned -= span_secs;
    }
    let mut first_is_zero = false;
    if first_aligned != first {
        data.insert(0, ChartPoint::zero(first_aligned));
        first_is_zero = true;
    }

    // align the last point forward toward end
    let last = data[data.len() - 1].timestamp;
    let mut last_aligned = last;
    while last_aligned + span_secs <= end {
        last_aligned += span_secs;
    }
    let mut last_is_zero = false;
    if last_aligned != last {
        data.push(ChartPoint::zero(last_aligned));
        last_is_zero = true;
    }

    let len = data.len();
    let mut result = Vec::with_capacity(len);
    result.push(data[0]);

    for i in 1..len {
        let curr = data[i];
        let prev = data[i - 1];
        let gap = (curr.timestamp - prev.timestamp) / span_secs;

        if gap <= 1 {
            result.push(curr);
            continue;
        }

        if gap > 3 {
            // only boundary zeros, skipping ones that duplicate the
            // aligned boundary points inserted above
            if !(i == 1 && first_is_zero) {
                result.push(ChartPoint::zero(prev.timestamp + span_secs));
            }
            if !(i == len - 1 && last_is_zero) {
                result.push(ChartPoint::zero(curr.timestamp - span_secs));
            }
            result.push(curr);
            continue;
        }

        let mut ts = prev.timestamp + span_secs;
        while ts < curr.timestamp {
            result.push(ChartPoint::zero(ts));
            ts += span_secs;
        }
        result.push(curr);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(timestamp: i64, request_count: i64) -> ChartPoint {
        ChartPoint {
            timestamp,
            request_count,
            ..Default::default()
        }
    }

    #[test]
    fn hourly_two_bucket_gap_is_zero_filled() {
        // input [{ts=0,v=1}, {ts=7200,v=1}], start=0, end=10800, hour span
        let filled = fill_gaps(vec![point(0, 1), point(7200, 1)], 0, 10800, TimeSpan::Hour);

        let timestamps: Vec<i64> = filled.iter().map(|p| p.timestamp).collect();
        let values: Vec<i64> = filled.iter().map(|p| p.request_count).collect();
        assert_eq!(timestamps, vec![0, 3600, 7200, 10800]);
        assert_eq!(values, vec![1, 0, 1, 0]);
    }

    #[test]
    fn dense_series_is_identity() {
        // property: with no gaps and aligned bounds, fill_gaps changes nothing
        let data: Vec<ChartPoint> = (0..6).map(|i| point(i * 3600, i + 1)).collect();
        let filled = fill_gaps(data.clone(), 0, 5 * 3600, TimeSpan::Hour);
        assert_eq!(filled, data);
    }

    #[test]
    fn month_span_is_never_filled() {
        let data = vec![point(0, 1), point(86400 * 90, 2)];
        let filled = fill_gaps(data.clone(), 0, 86400 * 120, TimeSpan::Month);
        assert_eq!(filled, data);
    }

    #[test]
    fn long_gap_gets_boundary_zeros_only() {
        let filled = fill_gaps(
            vec![point(0, 1), point(10 * 3600, 2)],
            0,
            10 * 3600,
            TimeSpan::Hour,
        );
        let timestamps: Vec<i64> = filled.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 3600, 9 * 3600, 10 * 3600]);
        assert_eq!(
            filled.iter().map(|p| p.request_count).collect::<Vec<_>>(),
            vec![1, 0, 0, 2]
        );
    }

    #[test]
    fn unaligned_boundaries_get_aligned_zero_points() {
        // first point one bucket after start, last point one before end
        let filled = fill_gaps(vec![point(3600, 5)], 0, 7200, TimeSpan::Hour);
        let timestamps: Vec<i64> = filled.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 3600, 7200]);
        assert_eq!(
            filled.iter().map(|p| p.request_count).collect::<Vec<_>>(),
            vec![0, 5, 0]
        );
    }

    #[test]
    fn empty_series_stays_empty() {
        assert!(fill_gaps(Vec::new(), 0, 10800, TimeSpan::Hour).is_empty());
    }

    #[test]
    fn range_presets() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let (start, end, span) = resolve_time_range("day", "", None, Some(100_000), tz);
        assert_eq!(span, TimeSpan::Hour);
        assert_eq!(end - start, 86400);

        let (_, _, span) = resolve_time_range("week", "minute", None, None, tz);
        assert_eq!(span, TimeSpan::Minute);
    }
}
