//! Date literal parsing for comparisons against `date`.
//!
//! Accepted forms, always interpreted in UTC:
//!  - absolute: RFC 3339 (`2024-03-01T12:00:00Z`), `YYYY-MM-DD HH:MM:SS`,
//!    bare `YYYY-MM-DD` (midnight)
//!  - relative English, locale-fixed: `now`, `today`, `yesterday`,
//!    `N <unit>[s] ago` with second/minute/hour/day/week/month/year.
//!    Months count as 30 days and years as 365, which keeps relative
//!    expressions deterministic.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

pub fn parse_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();

    if let Ok(absolute) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(absolute.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(day.and_hms_opt(0, 0, 0)?.and_utc());
    }

    parse_relative(trimmed, now)
}

fn parse_relative(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lowered = text.to_ascii_lowercase();
    match lowered.as_str() {
        "now" | "today" => return Some(now),
        "yesterday" => return Some(now - Duration::days(1)),
        _ => {}
    }

    let mut parts = lowered.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next()? != "ago" || parts.next().is_some() {
        return None;
    }

    let duration = match unit.trim_end_matches('s') {
        "second" => Duration::seconds(amount),
        "minute" => Duration::minutes(amount),
        "hour" => Duration::hours(amount),
        "day" => Duration::days(amount),
        "week" => Duration::weeks(amount),
        "month" => Duration::days(amount * 30),
        "year" => Duration::days(amount * 365),
        _ => return None,
    };
    Some(now - duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn absolute_formats() {
        assert_eq!(
            parse_date("2024-03-01T06:30:00Z", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap()
        );
        assert_eq!(
            parse_date("2024-03-01 06:30:00", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap()
        );
        assert_eq!(
            parse_date("2024-03-01", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn relative_forms() {
        assert_eq!(
            parse_date("1 week ago", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date("36 hours ago", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap()
        );
        assert_eq!(parse_date("yesterday", now()).unwrap(), now() - Duration::days(1));
        assert_eq!(parse_date("1 day ago", now()), parse_date("yesterday", now()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_date("one week ago", now()).is_none());
        assert!(parse_date("1 fortnight ago", now()).is_none());
        assert!(parse_date("ago 1 week", now()).is_none());
        assert!(parse_date("03/17/2024", now()).is_none());
    }
}
