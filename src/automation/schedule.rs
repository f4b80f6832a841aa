//! Due-time evaluation for automation schedules.

use super::{Schedule, TargetState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronExprSchedule;
use std::str::FromStr;

/// Outcome of a due check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCheck {
    pub due: bool,
    /// `YYYYMMDDHHMM` fire bucket for cron schedules; recording it prevents a
    /// second fire inside the same matching minute.
    pub bucket: Option<String>,
}

impl DueCheck {
    fn not_due() -> Self {
        Self {
            due: false,
            bucket: None,
        }
    }
}

/// Accept standard 5-field crontab (minute hour dom month dow) by prepending
/// a seconds field; pass crate-native 6/7-field forms through.
pub fn normalize_cron_expr(expression: &str) -> Result<String> {
    let expression = expression.trim();
    match expression.split_whitespace().count() {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        n => anyhow::bail!("Invalid cron expression: {expression} (got {n} fields)"),
    }
}

fn cron_due(
    expr: &str,
    tz: Option<&str>,
    now: DateTime<Utc>,
    state: &TargetState,
) -> Result<DueCheck> {
    let normalized = normalize_cron_expr(expr)?;
    let cron = CronExprSchedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expr}"))?;

    // Due when an occurrence landed inside the last minute; the bucket key
    // carries the matched minute in the schedule's timezone.
    let window_start = now - chrono::Duration::seconds(60);
    let (occurrence, bucket) = if let Some(tz_name) = tz {
        let timezone =
            chrono_tz::Tz::from_str(tz_name).with_context(|| format!("Invalid timezone: {tz_name}"))?;
        let localized = window_start.with_timezone(&timezone);
        match cron.after(&localized).next() {
            Some(next) if next.with_timezone(&Utc) <= now => {
                let bucket = next.format("%Y%m%d%H%M").to_string();
                (true, Some(bucket))
            }
            _ => (false, None),
        }
    } else {
        match cron.after(&window_start).next() {
            Some(next) if next <= now => {
                let bucket = next.format("%Y%m%d%H%M").to_string();
                (true, Some(bucket))
            }
            _ => (false, None),
        }
    };

    if !occurrence {
        return Ok(DueCheck::not_due());
    }
    if bucket.is_some() && bucket == state.last_cron_bucket {
        return Ok(DueCheck::not_due());
    }
    Ok(DueCheck { due: true, bucket })
}

/// Evaluate a schedule against the current time and persisted state.
pub fn is_due(schedule: &Schedule, now: DateTime<Utc>, state: &TargetState) -> Result<DueCheck> {
    match schedule {
        Schedule::Every { every_ms } => {
            let every = (*every_ms).max(60_000) as i64;
            let due = state
                .last_triggered_at_ms
                .map_or(true, |last| now.timestamp_millis() - last >= every);
            Ok(DueCheck { due, bucket: None })
        }
        Schedule::At { at } => {
            let at_ms = DateTime::parse_from_rfc3339(at)
                .with_context(|| format!("Invalid 'at' instant: {at}"))?
                .timestamp_millis();
            let already_done = state.last_triggered_at_ms.is_some_and(|last| last >= at_ms);
            Ok(DueCheck {
                due: now.timestamp_millis() >= at_ms && !already_done,
                bucket: None,
            })
        }
        Schedule::Cron { expr, tz } => cron_due(expr, tz.as_deref(), now, state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn normalize_accepts_five_fields() {
        assert_eq!(normalize_cron_expr("*/30 9-22 * * *").unwrap(), "0 */30 9-22 * * *");
        assert!(normalize_cron_expr("x y").is_err());
    }

    #[test]
    fn every_fires_on_elapsed_interval() {
        let schedule = Schedule::Every { every_ms: 120_000 };
        let now = at_utc(2026, 8, 2, 10, 0, 0);

        let fresh = TargetState::default();
        assert!(is_due(&schedule, now, &fresh).unwrap().due);

        let recent = TargetState {
            last_triggered_at_ms: Some(now.timestamp_millis() - 60_000),
            ..TargetState::default()
        };
        assert!(!is_due(&schedule, now, &recent).unwrap().due);

        let stale = TargetState {
            last_triggered_at_ms: Some(now.timestamp_millis() - 180_000),
            ..TargetState::default()
        };
        assert!(is_due(&schedule, now, &stale).unwrap().due);
    }

    #[test]
    fn at_fires_once() {
        let schedule = Schedule::At {
            at: "2026-08-02T10:00:00Z".into(),
        };
        let before = at_utc(2026, 8, 2, 9, 59, 0);
        let after = at_utc(2026, 8, 2, 10, 1, 0);

        let fresh = TargetState::default();
        assert!(!is_due(&schedule, before, &fresh).unwrap().due);
        assert!(is_due(&schedule, after, &fresh).unwrap().due);

        let done = TargetState {
            last_triggered_at_ms: Some(after.timestamp_millis()),
            ..TargetState::default()
        };
        assert!(!is_due(&schedule, after, &done).unwrap().due);
    }

    #[test]
    fn cron_matches_in_timezone() {
        // 10:00 Asia/Shanghai == 02:00 UTC.
        let schedule = Schedule::Cron {
            expr: "*/30 9-22 * * *".into(),
            tz: Some("Asia/Shanghai".into()),
        };
        let matching = at_utc(2026, 8, 2, 2, 0, 10);
        let check = is_due(&schedule, matching, &TargetState::default()).unwrap();
        assert!(check.due);
        assert_eq!(check.bucket.as_deref(), Some("202608021000"));

        // 03:10 Shanghai is outside 9-22.
        let off_hours = at_utc(2026, 8, 1, 19, 10, 0);
        assert!(!is_due(&schedule, off_hours, &TargetState::default()).unwrap().due);
    }

    #[test]
    fn cron_bucket_prevents_double_fire() {
        let schedule = Schedule::Cron {
            expr: "*/30 9-22 * * *".into(),
            tz: Some("Asia/Shanghai".into()),
        };
        let now = at_utc(2026, 8, 2, 2, 0, 10);
        let first = is_due(&schedule, now, &TargetState::default()).unwrap();
        assert!(first.due);

        let state = TargetState {
            last_cron_bucket: first.bucket.clone(),
            ..TargetState::default()
        };
        // Same matching minute, later second: suppressed.
        let later = at_utc(2026, 8, 2, 2, 0, 40);
        assert!(!is_due(&schedule, later, &state).unwrap().due);

        // Next matching minute fires again.
        let next_slot = at_utc(2026, 8, 2, 2, 30, 5);
        let second = is_due(&schedule, next_slot, &state).unwrap();
        assert!(second.due);
        assert_eq!(second.bucket.as_deref(), Some("202608021030"));
    }

    #[test]
    fn cron_without_tz_uses_utc() {
        let schedule = Schedule::Cron {
            expr: "0 12 * * *".into(),
            tz: None,
        };
        let hit = at_utc(2026, 8, 2, 12, 0, 30);
        let check = is_due(&schedule, hit, &TargetState::default()).unwrap();
        assert!(check.due);
        assert_eq!(check.bucket.as_deref(), Some("202608021200"));
        let miss = at_utc(2026, 8, 2, 13, 0, 0);
        // 13:00 does not match "0 12".
        assert!(!is_due(&schedule, miss, &TargetState::default()).unwrap().due);
    }
}
