//! Due-time evaluation for recurring tasks.
//!
//! A task's `next_time` field selects one of three rules:
//!
//! - bare `HH:MM`: due once the Beijing-local clock passes that time today;
//!   the occurrence dedups on a daily slot and the next occurrence rolls
//!   forward 24 hours.
//! - absolute date-time: due once `now` reaches it; a positive `fail_delay`
//!   (minutes) turns the task into a fixed-delay retry loop.
//! - absent: a rolling task, always due, throttled only by the default slot
//!   TTL.
//!
//! Naive timestamps in configuration documents are Beijing wall time, the
//! same clock the next-time rules and the rest window use. Dedup slot ids
//! render instants in UTC.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::{Map, Value};

use crate::taskmeta::next_time::beijing;

/// A task found due, with its dedup slot and the rewritten next occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueOutcome {
    /// Slot identifier for the schedule-dedup key.
    pub slot: String,
    /// TTL for the dedup slot.
    pub dedup_ttl: Duration,
    /// New `next_time` to persist once a job was actually created.
    pub next_time: Option<DateTime<Utc>>,
}

const DAILY_SLOT_TTL: Duration = Duration::from_secs(26 * 3600);
const DATETIME_SLOT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Evaluate one task map against `now`. Returns `None` when not yet due.
pub fn evaluate_due(
    task: &Map<String, Value>,
    now: DateTime<Utc>,
    default_slot_ttl: Duration,
) -> Option<DueOutcome> {
    let next_raw = task
        .get("next_time")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");

    if !next_raw.is_empty() {
        if let Some((hour, minute)) = parse_hhmm(next_raw) {
            let local_now = now.with_timezone(&beijing());
            let target = beijing()
                .with_ymd_and_hms(
                    local_now.year(),
                    local_now.month(),
                    local_now.day(),
                    hour,
                    minute,
                    0,
                )
                .single()?
                .with_timezone(&Utc);
            if now < target {
                return None;
            }
            return Some(DueOutcome {
                slot: format!(
                    "daily:{}:{:02}{:02}",
                    local_now.format("%Y%m%d"),
                    hour,
                    minute
                ),
                dedup_ttl: DAILY_SLOT_TTL,
                next_time: Some(target + chrono::Duration::hours(24)),
            });
        }

        let parsed = parse_datetime(next_raw)?;
        if now < parsed {
            return None;
        }
        let fail_delay = to_i64(task.get("fail_delay"), 0);
        let next_time = (fail_delay > 0).then(|| now + chrono::Duration::minutes(fail_delay));
        return Some(DueOutcome {
            slot: format!("datetime:{}", parsed.format("%Y%m%d%H%M")),
            dedup_ttl: DATETIME_SLOT_TTL,
            next_time,
        });
    }

    // Rolling task: always due, capped by the dedup window.
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let fail_delay = to_i64(task.get("fail_delay"), 0);
    let next_time = (fail_delay > 0).then(|| now + chrono::Duration::minutes(fail_delay));
    Some(DueOutcome {
        slot: format!("rolling:{}", minute.format("%Y%m%d%H%M")),
        dedup_ttl: default_slot_ttl,
        next_time,
    })
}

/// Parse `HH:MM` with range checks; anything else is not a clock time.
pub fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (hour, minute) = value.split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Parse the accepted absolute formats. Naive values are Beijing wall time;
/// RFC 3339 values carry their own offset.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let naive_to_utc = |naive: NaiveDateTime| {
        beijing()
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc))
    };
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M") {
        return naive_to_utc(parsed);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return naive_to_utc(parsed);
    }
    None
}

/// Lenient integer coercion for document fields that may be stored as
/// numbers or strings.
pub fn to_i64(value: Option<&Value>, fallback: i64) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(fallback),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn task(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    const DEFAULT_TTL: Duration = Duration::from_secs(90);

    // 09:00 Beijing == 01:00 UTC.

    #[test]
    fn hhmm_not_due_one_minute_before_target() {
        let t = task(json!({"next_time": "09:00"}));
        assert_eq!(evaluate_due(&t, utc("2026-08-07T00:59:00Z"), DEFAULT_TTL), None);
    }

    #[test]
    fn hhmm_due_one_minute_after_rolls_forward_24h() {
        let t = task(json!({"next_time": "09:00"}));
        let outcome = evaluate_due(&t, utc("2026-08-07T01:01:00Z"), DEFAULT_TTL).unwrap();
        assert_eq!(outcome.slot, "daily:20260807:0900");
        assert_eq!(outcome.dedup_ttl, Duration::from_secs(26 * 3600));
        assert_eq!(outcome.next_time, Some(utc("2026-08-08T01:00:00Z")));
    }

    #[test]
    fn hhmm_uses_local_calendar_day() {
        // 23:30 Beijing on Aug 7 is 15:30 UTC on Aug 7; a 23:00 task is due
        // and slots on the Beijing date.
        let t = task(json!({"next_time": "23:00"}));
        let outcome = evaluate_due(&t, utc("2026-08-07T15:30:00Z"), DEFAULT_TTL).unwrap();
        assert_eq!(outcome.slot, "daily:20260807:2300");
    }

    #[test]
    fn datetime_due_with_fail_delay_retry_loop() {
        // 06:00 Beijing == 22:00 UTC the previous day.
        let t = task(json!({"next_time": "2026-08-07 06:00", "fail_delay": 30}));
        let now = utc("2026-08-06T22:05:00Z");
        let outcome = evaluate_due(&t, now, DEFAULT_TTL).unwrap();
        assert_eq!(outcome.slot, "datetime:202608062200");
        assert_eq!(outcome.dedup_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(outcome.next_time, Some(now + chrono::Duration::minutes(30)));
    }

    #[test]
    fn datetime_not_due_before_instant() {
        let t = task(json!({"next_time": "2026-08-07 06:00"}));
        assert_eq!(evaluate_due(&t, utc("2026-08-06T21:59:00Z"), DEFAULT_TTL), None);
    }

    #[test]
    fn datetime_without_fail_delay_has_no_next() {
        let t = task(json!({"next_time": "2026-08-07 06:00"}));
        let outcome = evaluate_due(&t, utc("2026-08-06T22:00:00Z"), DEFAULT_TTL).unwrap();
        assert_eq!(outcome.next_time, None);
    }

    #[test]
    fn rolling_task_always_due_with_minute_slot() {
        let t = task(json!({}));
        let outcome = evaluate_due(&t, utc("2026-08-07T06:05:42Z"), DEFAULT_TTL).unwrap();
        assert_eq!(outcome.slot, "rolling:202608070605");
        assert_eq!(outcome.dedup_ttl, DEFAULT_TTL);
        assert_eq!(outcome.next_time, None);
    }

    #[test]
    fn rolling_task_with_fail_delay_schedules_retry() {
        let t = task(json!({"fail_delay": 15}));
        let now = utc("2026-08-07T06:05:00Z");
        let outcome = evaluate_due(&t, now, DEFAULT_TTL).unwrap();
        assert_eq!(outcome.next_time, Some(now + chrono::Duration::minutes(15)));
    }

    #[test]
    fn unparseable_next_time_is_not_due() {
        let t = task(json!({"next_time": "whenever"}));
        assert_eq!(evaluate_due(&t, utc("2026-08-07T06:00:00Z"), DEFAULT_TTL), None);
    }

    #[test]
    fn hhmm_bounds_checked() {
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("7:5"), Some((7, 5)));
        assert_eq!(parse_hhmm("2026-08-07 06:00"), None);
    }

    #[test]
    fn datetime_accepts_rfc3339_and_seconds() {
        assert_eq!(
            parse_datetime("2026-08-07T06:00:00+08:00"),
            Some(utc("2026-08-06T22:00:00Z"))
        );
        assert_eq!(
            parse_datetime("2026-08-07 06:00:30"),
            Some(utc("2026-08-06T22:00:30Z"))
        );
    }

    #[test]
    fn int_coercion() {
        assert_eq!(to_i64(Some(&json!(5)), 0), 5);
        assert_eq!(to_i64(Some(&json!(5.9)), 0), 5);
        assert_eq!(to_i64(Some(&json!(" 7 ")), 0), 7);
        assert_eq!(to_i64(Some(&json!("x")), 3), 3);
        assert_eq!(to_i64(None, 3), 3);
    }
}
