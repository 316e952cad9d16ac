// SPDX-License-Identifier: MIT OR Apache-2.0
//! `cron(...)` / `rate(...)` schedule expression parsing.
//!
//! The dialect is AWS EventBridge-flavored: `rate(5 minutes)` and a 5-field
//! cron (`minute hour day-of-month month day-of-week`, `?` accepted as a
//! synonym for `*`). No published crate matches this exact grammar, so it's
//! hand-rolled.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use std::collections::BTreeSet;

/// A parsed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// `rate(N unit)` — fires every `N` units after the last fire.
    Rate(i64),
    /// `cron(...)` — fires at every wall-clock minute matching the cron fields.
    Cron(CronSpec),
}

/// One constrained field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSet {
    Any,
    Values(BTreeSet<u32>),
}

impl FieldSet {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.contains(&value),
        }
    }
}

/// A parsed 5-field cron spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

/// Parse a `cron(...)` or `rate(...)` expression.
///
/// # Errors
///
/// Returns [`ErrorKind::Validation`] if the expression is malformed.
pub fn parse_schedule(expr: &str) -> CoreResult<Schedule> {
    let expr = expr.trim();
    if let Some(inner) = expr.strip_prefix("rate(").and_then(|s| s.strip_suffix(')')) {
        return parse_rate(inner).map(Schedule::Rate);
    }
    if let Some(inner) = expr.strip_prefix("cron(").and_then(|s| s.strip_suffix(')')) {
        return parse_cron(inner).map(Schedule::Cron);
    }
    Err(CoreError::new(ErrorKind::Validation, format!("schedule expression must be rate(...) or cron(...): {expr}")))
}

fn parse_rate(inner: &str) -> CoreResult<i64> {
    let parts: Vec<&str> = inner.split_whitespace().collect();
    let [quantity, unit] = parts.as_slice() else {
        return Err(CoreError::new(ErrorKind::Validation, format!("rate expression must be 'N unit': {inner}")));
    };
    let quantity: i64 = quantity
        .parse()
        .map_err(|_| CoreError::new(ErrorKind::Validation, format!("rate quantity must be a positive integer: {quantity}")))?;
    if quantity <= 0 {
        return Err(CoreError::new(ErrorKind::Validation, "rate quantity must be positive"));
    }
    let minutes = match unit.trim_end_matches('s') {
        "minute" => quantity,
        "hour" => quantity * 60,
        "day" => quantity * 60 * 24,
        other => return Err(CoreError::new(ErrorKind::Validation, format!("unsupported rate unit: {other}"))),
    };
    Ok(minutes)
}

fn parse_cron(inner: &str) -> CoreResult<CronSpec> {
    let fields: Vec<&str> = inner.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        return Err(CoreError::new(
            ErrorKind::Validation,
            format!("cron expression must have 5 fields (minute hour day-of-month month day-of-week): {inner}"),
        ));
    };
    Ok(CronSpec {
        minute: parse_field(minute, 0, 59)?,
        hour: parse_field(hour, 0, 23)?,
        day_of_month: parse_field(dom, 1, 31)?,
        month: parse_field(month, 1, 12)?,
        day_of_week: parse_field(dow, 0, 6)?,
    })
}

fn parse_field(raw: &str, min: u32, max: u32) -> CoreResult<FieldSet> {
    if raw == "*" || raw == "?" {
        return Ok(FieldSet::Any);
    }
    let mut values = BTreeSet::new();
    for token in raw.split(',') {
        values.extend(parse_token(token, min, max)?);
    }
    Ok(FieldSet::Values(values))
}

fn parse_token(token: &str, min: u32, max: u32) -> CoreResult<Vec<u32>> {
    let (range_part, step) = match token.split_once('/') {
        Some((range, step)) => (
            range,
            step.parse::<u32>()
                .map_err(|_| CoreError::new(ErrorKind::Validation, format!("invalid step in cron field: {token}")))?,
        ),
        None => (token, 1),
    };
    let (start, end) = if range_part == "*" {
        (min, max)
    } else if let Some((lo, hi)) = range_part.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| CoreError::new(ErrorKind::Validation, format!("invalid cron range: {token}")))?;
        let hi: u32 = hi.parse().map_err(|_| CoreError::new(ErrorKind::Validation, format!("invalid cron range: {token}")))?;
        (lo, hi)
    } else {
        let value: u32 = range_part
            .parse()
            .map_err(|_| CoreError::new(ErrorKind::Validation, format!("invalid cron field value: {token}")))?;
        (value, value)
    };
    if start < min || end > max || start > end {
        return Err(CoreError::new(ErrorKind::Validation, format!("cron field value out of range [{min},{max}]: {token}")));
    }
    Ok((start..=end).step_by(step.max(1) as usize).collect())
}

impl CronSpec {
    fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }
}

/// Upper bound on how far forward `next_fire_after` searches before giving
/// up — one year of minutes.
const SEARCH_HORIZON_MINUTES: i64 = 366 * 24 * 60;

/// Compute the next nominal fire time strictly after `after`.
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if no match is found within one year,
/// which only happens for a self-contradictory cron spec (e.g. February 30th).
pub fn next_fire_after(schedule: &Schedule, after: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
    match schedule {
        Schedule::Rate(minutes) => Ok(after + Duration::minutes(*minutes)),
        Schedule::Cron(spec) => {
            let start = after
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(after)
                + Duration::minutes(1);
            for offset in 0..SEARCH_HORIZON_MINUTES {
                let candidate = start + Duration::minutes(offset);
                if spec.matches(candidate) {
                    return Ok(candidate);
                }
            }
            Err(CoreError::new(ErrorKind::Internal, "cron spec matched no minute within one year"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_in_minutes_hours_and_days() {
        assert_eq!(parse_schedule("rate(5 minutes)").unwrap(), Schedule::Rate(5));
        assert_eq!(parse_schedule("rate(2 hours)").unwrap(), Schedule::Rate(120));
        assert_eq!(parse_schedule("rate(1 day)").unwrap(), Schedule::Rate(1440));
    }

    #[test]
    fn rejects_unsupported_rate_unit() {
        assert!(parse_schedule("rate(5 fortnights)").is_err());
    }

    #[test]
    fn cron_next_fire_respects_wildcard_fields() {
        let schedule = parse_schedule("cron(0 12 * * ?)").unwrap();
        let after = DateTime::parse_from_rfc3339("2026-03-01T05:00:00Z").unwrap().with_timezone(&Utc);
        let next = next_fire_after(&schedule, after).unwrap();
        assert_eq!(next.hour(), 12);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.day(), 1);
    }

    #[test]
    fn cron_step_field_matches_every_nth_minute() {
        let schedule = parse_schedule("cron(*/15 * * * ?)").unwrap();
        let after = DateTime::parse_from_rfc3339("2026-03-01T00:01:00Z").unwrap().with_timezone(&Utc);
        let next = next_fire_after(&schedule, after).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn rate_schedule_advances_by_fixed_offset_regardless_of_now() {
        let schedule = parse_schedule("rate(10 minutes)").unwrap();
        let after = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = next_fire_after(&schedule, after).unwrap();
        assert_eq!(next, after + Duration::minutes(10));
    }
}
