use crate::query::spec::Granularity;

/// Round to one decimal and drop a trailing `.0`.
fn format_bound(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract().abs() < f64::EPSILON {
        format!("{rounded:.0}")
    } else {
        format!("{rounded:.1}")
    }
}

/// Render a raw `"<min> - <max>"` bucket range, e.g. `"12.0 - 48.25"` -> `"12 - 48.3"`.
pub fn numeric_range_label(raw: &str) -> Option<String> {
    let (low, high) = raw.split_once(" - ")?;
    let low: f64 = low.trim().parse().ok()?;
    let high: f64 = high.trim().parse().ok()?;
    Some(format!("{} - {}", format_bound(low), format_bound(high)))
}

/// Render truncated local epoch seconds as a calendar label.
pub fn datetime_label(raw: &str, granularity: Granularity) -> Option<String> {
    let seconds: i64 = raw.trim().parse().ok()?;
    let local = chrono::DateTime::from_timestamp(seconds, 0)?.naive_utc();
    let fmt = match granularity {
        Granularity::Hour => "%Y-%m-%d %H:00",
        Granularity::Day | Granularity::Week => "%Y-%m-%d",
        Granularity::Month => "%Y-%m",
    };
    Some(local.format(fmt).to_string())
}
