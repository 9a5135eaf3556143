//! `ScheduleSpec` parsing and next-run computation (supplement to spec.md
//! §4.7: the spec references cron/interval schedules but never specifies
//! the accepted input surface).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::domain::ScheduleSpec;
use crate::error::EngineError;

/// The next run strictly after `after`, per `spec`.
pub fn next_run_after(
    spec: &ScheduleSpec,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    match spec {
        ScheduleSpec::Interval(shorthand) => {
            let expr = interval_to_cron(shorthand)?;
            next_from_cron(&expr, after)
        }
        ScheduleSpec::Cron(expr) => next_from_cron(expr, after),
    }
}

fn next_from_cron(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    // The `cron` crate's `Schedule` wants a leading seconds field; workflow
    // schedules are the conventional 5-field form.
    let six_field = format!("0 {expr}");
    let schedule = Schedule::from_str(&six_field)
        .map_err(|e| EngineError::logic(format!("invalid cron expression {expr:?}: {e}")))?;
    schedule.after(&after).next().ok_or_else(|| {
        EngineError::logic(format!("cron expression {expr:?} has no future occurrence"))
    })
}

/// Translates interval shorthand into the cron expression it aligns to
/// (spec.md §8 boundary behaviours): `"5m"` -> `"*/5 * * * *"`, `"1h"` ->
/// `"0 * * * *"`, `"1d"` -> `"0 0 * * *"`; sub-minute intervals collapse to
/// every-minute.
fn interval_to_cron(shorthand: &str) -> Result<String, EngineError> {
    if shorthand.len() < 2 {
        return Err(EngineError::logic(format!("invalid interval {shorthand:?}")));
    }
    let (digits, unit) = shorthand.split_at(shorthand.len() - 1);
    let count: i64 = digits
        .parse()
        .map_err(|_| EngineError::logic(format!("invalid interval {shorthand:?}")))?;
    if count <= 0 {
        return Err(EngineError::logic(format!("invalid interval {shorthand:?}")));
    }
    match unit {
        "s" => Ok("* * * * *".to_string()),
        "m" => Ok(if count == 1 {
            "* * * * *".to_string()
        } else {
            format!("*/{count} * * * *")
        }),
        "h" => Ok(if count == 1 {
            "0 * * * *".to_string()
        } else {
            format!("0 */{count} * * *")
        }),
        "d" => Ok(if count == 1 {
            "0 0 * * *".to_string()
        } else {
            format!("0 0 */{count} * *")
        }),
        _ => Err(EngineError::logic(format!("invalid interval unit in {shorthand:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn interval_shorthand_aligns_to_the_cron_boundary() {
        // Last run off-boundary at :47 — aligned "5m" lands on :50, not :52.
        let spec = ScheduleSpec::Interval("5m".into());
        let next = next_run_after(&spec, t(2026, 1, 1, 0, 47)).unwrap();
        assert_eq!(next, t(2026, 1, 1, 0, 50));
    }

    #[test]
    fn hour_and_day_shorthands_align_to_the_boundary() {
        // Last run off-boundary at 00:47 — aligned "1h" lands on 01:00, not 01:47.
        let spec = ScheduleSpec::Interval("1h".into());
        assert_eq!(next_run_after(&spec, t(2026, 1, 1, 0, 47)).unwrap(), t(2026, 1, 1, 1, 0));

        let spec = ScheduleSpec::Interval("1d".into());
        assert_eq!(next_run_after(&spec, t(2026, 1, 1, 13, 0)).unwrap(), t(2026, 1, 2, 0, 0));
    }

    #[test]
    fn sub_minute_interval_collapses_to_every_minute() {
        let spec = ScheduleSpec::Interval("30s".into());
        assert_eq!(next_run_after(&spec, t(2026, 1, 1, 0, 0)).unwrap(), t(2026, 1, 1, 0, 1));
    }

    #[test]
    fn cron_expression_finds_next_occurrence() {
        let spec = ScheduleSpec::Cron("0 * * * *".into());
        let next = next_run_after(&spec, t(2026, 1, 1, 0, 30)).unwrap();
        assert_eq!(next, t(2026, 1, 1, 1, 0));
    }

    #[test]
    fn invalid_interval_unit_is_rejected() {
        let spec = ScheduleSpec::Interval("5x".into());
        assert!(next_run_after(&spec, t(2026, 1, 1, 0, 0)).is_err());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let spec = ScheduleSpec::Cron("not a cron".into());
        assert!(next_run_after(&spec, t(2026, 1, 1, 0, 0)).is_err());
    }
}
