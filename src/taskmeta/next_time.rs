//! Post-completion `next_time` computation.
//!
//! Rules are evaluated against Beijing local time (UTC+8) and rendered in
//! the human-readable `YYYY-MM-DD HH:MM` form the configuration documents
//! store.

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike, Utc, Weekday};

/// Beijing timezone (UTC+8), the reference clock for all schedule rules.
pub fn beijing() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset")
}

/// Render a timestamp in the stored `next_time` format (Beijing local).
pub fn format_next_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&beijing()).format("%Y-%m-%d %H:%M").to_string()
}

/// Compute the next execution time for a rule. `None` for `on_demand` and
/// unknown rules (external input decides the next run).
pub fn calc_next_time(rule: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let bj = now.with_timezone(&beijing());

    let local = |year: i32, month: u32, day: u32, hour: u32, minute: u32| {
        beijing()
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .map(|t| t.with_timezone(&Utc))
    };

    match rule {
        // Tomorrow 00:01 Beijing time.
        "daily_reset" => {
            let tomorrow = bj.date_naive() + Duration::days(1);
            local(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 1)
        }

        // Next Monday 00:01 Beijing time.
        "weekly_monday" => {
            let days_until = match bj.weekday() {
                Weekday::Mon => 7,
                other => 7 - other.num_days_from_monday() as i64,
            };
            let next_mon = bj.date_naive() + Duration::days(days_until);
            local(next_mon.year(), next_mon.month(), next_mon.day(), 0, 1)
        }

        "interval_6h" => Some(now + Duration::hours(6)),

        "interval_8h" => Some(now + Duration::hours(8)),

        // Two-hour quiz windows at 10..22 Beijing; past 22 rolls to 10:00
        // the next day.
        "interval_2h_window" => {
            let current_window = (bj.hour() / 2) * 2;
            let next_window = current_window + 2;
            if !(10..=22).contains(&next_window) {
                let next_day = bj.date_naive() + Duration::days(1);
                local(next_day.year(), next_day.month(), next_day.day(), 10, 0)
            } else {
                local(bj.year(), bj.month(), bj.day(), next_window, 0)
            }
        }

        // Next 18:00 or 21:00 Beijing time.
        "coop_window" => {
            let today = bj.date_naive();
            let today_18 = local(today.year(), today.month(), today.day(), 18, 0)?;
            let today_21 = local(today.year(), today.month(), today.day(), 21, 0)?;
            if now < today_18 {
                Some(today_18)
            } else if now < today_21 {
                Some(today_21)
            } else {
                let tomorrow = today + Duration::days(1);
                local(tomorrow.year(), tomorrow.month(), tomorrow.day(), 18, 0)
            }
        }

        "weekly_7d" => Some(now + Duration::days(7)),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_reset_rolls_to_next_beijing_midnight() {
        // 2026-08-07 15:30 UTC = 2026-08-07 23:30 Beijing.
        let next = calc_next_time("daily_reset", utc("2026-08-07T15:30:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-08 00:01");
    }

    #[test]
    fn weekly_monday_from_midweek() {
        // 2026-08-07 is a Friday (Beijing and UTC agree at 04:00 UTC).
        let next = calc_next_time("weekly_monday", utc("2026-08-07T04:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-10 00:01");
    }

    #[test]
    fn weekly_monday_from_monday_is_next_week() {
        // 2026-08-10 is a Monday.
        let next = calc_next_time("weekly_monday", utc("2026-08-10T04:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-17 00:01");
    }

    #[test]
    fn intervals_are_relative_to_now() {
        let now = utc("2026-08-07T04:00:00Z");
        assert_eq!(
            calc_next_time("interval_6h", now).unwrap(),
            now + Duration::hours(6)
        );
        assert_eq!(
            calc_next_time("interval_8h", now).unwrap(),
            now + Duration::hours(8)
        );
        assert_eq!(
            calc_next_time("weekly_7d", now).unwrap(),
            now + Duration::days(7)
        );
    }

    #[test]
    fn quiz_window_advances_within_day() {
        // 06:30 UTC = 14:30 Beijing → next window is 16:00 Beijing.
        let next = calc_next_time("interval_2h_window", utc("2026-08-07T06:30:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-07 16:00");
    }

    #[test]
    fn quiz_window_wraps_past_last_window() {
        // 15:00 UTC = 23:00 Beijing → next day 10:00 Beijing.
        let next = calc_next_time("interval_2h_window", utc("2026-08-07T15:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-08 10:00");
    }

    #[test]
    fn coop_window_picks_next_slot() {
        // 05:00 UTC = 13:00 Beijing → today 18:00.
        let next = calc_next_time("coop_window", utc("2026-08-07T05:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-07 18:00");
        // 11:00 UTC = 19:00 Beijing → today 21:00.
        let next = calc_next_time("coop_window", utc("2026-08-07T11:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-07 21:00");
        // 14:00 UTC = 22:00 Beijing → tomorrow 18:00.
        let next = calc_next_time("coop_window", utc("2026-08-07T14:00:00Z")).unwrap();
        assert_eq!(format_next_time(next), "2026-08-08 18:00");
    }

    #[test]
    fn on_demand_and_unknown_yield_nothing() {
        let now = utc("2026-08-07T04:00:00Z");
        assert!(calc_next_time("on_demand", now).is_none());
        assert!(calc_next_time("bogus", now).is_none());
    }
}
