//! Lightweight cron expression parser
//!
//! Supports 5-field expressions: "MIN HOUR DOM MON DOW" with wildcards `*`,
//! steps `*/N`, lists `a,b,c`, and ranges `a-b`. Day-of-week is 0-6 with
//! Sunday as 0 (7 also accepted). No cron crate dependency.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// A parsed cron expression
#[derive(Debug, Clone)]
pub struct CronSpec {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    /// Standard cron day semantics: when both DOM and DOW are restricted,
    /// a day matching either fires
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSpec {
    /// Whether the given instant (to minute precision) matches
    fn matches(&self, t: DateTime<Utc>) -> bool {
        if !self.minutes.contains(&t.minute()) || !self.hours.contains(&t.hour()) {
            return false;
        }
        if !self.months.contains(&t.month()) {
            return false;
        }

        let dom_match = self.days_of_month.contains(&t.day());
        let dow_match = self.days_of_week.contains(&t.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }
}

/// Parse a 5-field cron expression
pub fn parse(expression: &str) -> Option<CronSpec> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        tracing::warn!(
            "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
            expression
        );
        return None;
    }

    let minutes = parse_field(parts[0], 0, 59)?;
    let hours = parse_field(parts[1], 0, 23)?;
    let days_of_month = parse_field(parts[2], 1, 31)?;
    let months = parse_field(parts[3], 1, 12)?;
    // Accept 7 for Sunday alongside 0
    let days_of_week: Vec<u32> = parse_field(parts[4], 0, 7)?
        .into_iter()
        .map(|d| if d == 7 { 0 } else { d })
        .collect();

    Some(CronSpec {
        minutes,
        hours,
        days_of_month,
        months,
        days_of_week,
        dom_restricted: parts[2] != "*",
        dow_restricted: parts[4] != "*",
    })
}

/// Compute the next matching time strictly after `after`
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let spec = parse(expression)?;

    let mut candidate = (after + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after);

    // Bounded scan: a valid expression fires within 366 days
    for _ in 0..(366 * 24 * 60) {
        if spec.matches(candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }

    None
}

/// Parse a cron field into a sorted list of matching values
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    // */N - every N
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    // Comma-separated list; each element may be a single value or a range
    let mut values = Vec::new();
    for element in field.split(',') {
        let element = element.trim();
        if let Some((start, end)) = element.split_once('-') {
            let start: u32 = start.parse().ok()?;
            let end: u32 = end.parse().ok()?;
            if start > end || start < min || end > max {
                return None;
            }
            values.extend(start..=end);
        } else {
            let n: u32 = element.parse().ok()?;
            if n < min || n > max {
                return None;
            }
            values.push(n);
        }
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_hour() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 0).unwrap();
        let next = next_occurrence("0 * * * *", after).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_specific_time() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = next_occurrence("0 8 * * *", after).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.day(), 22);
    }

    #[test]
    fn test_next_day_rollover() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 9, 0, 0).unwrap();
        let next = next_occurrence("0 8 * * *", after).unwrap();
        assert_eq!(next.day(), 23);
        assert_eq!(next.hour(), 8);
    }

    #[test]
    fn test_every_15_minutes() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 2, 0).unwrap();
        let next = next_occurrence("*/15 * * * *", after).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_strictly_after() {
        // An exact match at `after` must not be returned
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 8, 0, 0).unwrap();
        let next = next_occurrence("0 8 * * *", after).unwrap();
        assert_eq!(next.day(), 23);
    }

    #[test]
    fn test_day_of_month() {
        let after = Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap();
        let next = next_occurrence("0 6 1 * *", after).unwrap();
        assert_eq!(next.month(), 3);
        assert_eq!(next.day(), 1);
        assert_eq!(next.hour(), 6);
    }

    #[test]
    fn test_day_of_week() {
        // 2026-02-22 is a Sunday; next Monday 09:00 is the 23rd
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let next = next_occurrence("0 9 * * 1", after).unwrap();
        assert_eq!(next.day(), 23);
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_sunday_as_seven() {
        let after = Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 0).unwrap();
        let from_zero = next_occurrence("0 9 * * 0", after).unwrap();
        let from_seven = next_occurrence("0 9 * * 7", after).unwrap();
        assert_eq!(from_zero, from_seven);
        assert_eq!(from_zero.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn test_ranges_and_lists() {
        // Weekdays at 8 and 18
        let spec = parse("0 8,18 * * 1-5").unwrap();
        let monday_morning = Utc.with_ymd_and_hms(2026, 2, 23, 8, 0, 0).unwrap();
        let saturday_morning = Utc.with_ymd_and_hms(2026, 2, 28, 8, 0, 0).unwrap();
        assert!(spec.matches(monday_morning));
        assert!(!spec.matches(saturday_morning));
    }

    #[test]
    fn test_invalid_expressions() {
        let after = Utc::now();
        assert!(next_occurrence("bad", after).is_none());
        assert!(next_occurrence("60 * * * *", after).is_none());
        assert!(next_occurrence("* * * * * *", after).is_none());
        assert!(next_occurrence("*/0 * * * *", after).is_none());
        assert!(next_occurrence("5-1 * * * *", after).is_none());
    }
}
