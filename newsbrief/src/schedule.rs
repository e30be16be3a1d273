//! Weekly trigger for `--daemon` mode and the cycle key used by the delivery log.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use common::SchedulerConfig;

/// A weekly wall-clock slot, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySlot {
    pub weekday: Weekday,
    pub time: NaiveTime,
}

impl Default for WeeklySlot {
    fn default() -> Self {
        Self {
            weekday: Weekday::Sun,
            time: NaiveTime::from_hms_opt(11, 0, 0).unwrap_or_default(),
        }
    }
}

impl WeeklySlot {
    pub fn from_config(cfg: &SchedulerConfig) -> Result<Self> {
        let default = Self::default();
        let weekday = match cfg.weekday.as_deref() {
            Some(s) => s
                .trim()
                .parse::<Weekday>()
                .map_err(|_| anyhow::anyhow!("invalid scheduler weekday: {}", s))?,
            None => default.weekday,
        };
        let time = match cfg.time.as_deref() {
            Some(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .with_context(|| format!("invalid scheduler time (expected HH:MM): {}", s))?,
            None => default.time,
        };
        Ok(Self { weekday, time })
    }

    /// First occurrence of this slot strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let days_ahead = (7 + self.weekday.num_days_from_monday() as i64
            - now.weekday().num_days_from_monday() as i64)
            % 7;
        let date = now.date_naive() + Duration::days(days_ahead);
        let candidate = Utc.from_utc_datetime(&date.and_time(self.time));
        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(7)
        }
    }
}

/// ISO week of `at`, e.g. "2026-W42". Runs in the same week share a delivery cycle.
pub fn cycle_key(at: DateTime<Utc>) -> String {
    let week = at.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn parses_config() {
        let cfg = SchedulerConfig {
            weekday: Some("Mon".into()),
            time: Some("07:30".into()),
        };
        let slot = WeeklySlot::from_config(&cfg).unwrap();
        assert_eq!(slot.weekday, Weekday::Mon);
        assert_eq!(slot.time, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
    }

    #[test]
    fn defaults_to_sunday_eleven() {
        let slot = WeeklySlot::from_config(&SchedulerConfig::default()).unwrap();
        assert_eq!(slot, WeeklySlot::default());
    }

    #[test]
    fn rejects_bad_values() {
        let bad_day = SchedulerConfig {
            weekday: Some("Someday".into()),
            time: None,
        };
        assert!(WeeklySlot::from_config(&bad_day).is_err());
        let bad_time = SchedulerConfig {
            weekday: None,
            time: Some("25:99".into()),
        };
        assert!(WeeklySlot::from_config(&bad_time).is_err());
    }

    #[test]
    fn next_run_later_same_day_and_next_week() {
        let slot = WeeklySlot::default();
        // 2026-10-18 is a Sunday
        let morning = utc(2026, 10, 18, 9, 0);
        assert_eq!(slot.next_after(morning), utc(2026, 10, 18, 11, 0));
        let exactly = utc(2026, 10, 18, 11, 0);
        assert_eq!(slot.next_after(exactly), utc(2026, 10, 25, 11, 0));
        let friday = utc(2026, 10, 16, 12, 0);
        assert_eq!(slot.next_after(friday), utc(2026, 10, 18, 11, 0));
    }

    #[test]
    fn cycle_key_is_iso_week() {
        assert_eq!(cycle_key(utc(2026, 10, 16, 0, 0)), "2026-W42");
        // Jan 1st 2027 is a Friday and belongs to the last ISO week of 2026
        assert_eq!(cycle_key(utc(2027, 1, 1, 0, 0)), "2026-W53");
    }
}
