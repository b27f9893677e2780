//! Next-run computation. All times are UTC.

use crate::JobError;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use dw_config::Schedule;

/// When a job with `schedule` should next run, as seen at `now`.
///
/// The result is always strictly after `now`:
/// - `Interval`: `last_run_at` (or `now`) plus `max(1, hours)`; a stale base
///   yields `now` plus the interval
/// - `Daily`: the next `hour:minute` after `now`
/// - `Weekly`: the next `day_of_week` (0 = Sunday) at `hour:minute` after `now`
///
/// # Errors
///
/// Returns [`JobError::InvalidSchedule`] for out-of-range fields.
pub fn next_run_at(
    schedule: &Schedule,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, JobError> {
    match *schedule {
        Schedule::Interval { hours } => {
            let step = Duration::hours(i64::from(hours.max(1)));
            let next = last_run_at.unwrap_or(now) + step;
            Ok(if next > now { next } else { now + step })
        }
        Schedule::Daily { hour, minute } => {
            let candidate = at_time(now, 0, hour, minute)?;
            Ok(if candidate > now {
                candidate
            } else {
                candidate + Duration::days(1)
            })
        }
        Schedule::Weekly {
            day_of_week,
            hour,
            minute,
        } => {
            if day_of_week > 6 {
                return Err(JobError::InvalidSchedule(format!(
                    "day_of_week must be 0-6, got {day_of_week}"
                )));
            }
            let today = now.weekday().num_days_from_sunday();
            let days_ahead = (day_of_week + 7 - today) % 7;
            let candidate = at_time(now, days_ahead, hour, minute)?;
            Ok(if candidate > now {
                candidate
            } else {
                candidate + Duration::days(7)
            })
        }
    }
}

/// `now`'s date plus `days`, at `hour:minute:00`
fn at_time(
    now: DateTime<Utc>,
    days: u32,
    hour: u32,
    minute: u32,
) -> Result<DateTime<Utc>, JobError> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        JobError::InvalidSchedule(format!("invalid time {hour:02}:{minute:02}"))
    })?;
    let date = now.date_naive() + Duration::days(i64::from(days));
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_later_today() {
        let schedule = Schedule::Daily { hour: 2, minute: 0 };
        assert_eq!(
            next_run_at(&schedule, None, utc("2024-01-01T01:00:00Z")).unwrap(),
            utc("2024-01-01T02:00:00Z")
        );
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let schedule = Schedule::Daily { hour: 2, minute: 0 };
        assert_eq!(
            next_run_at(&schedule, None, utc("2024-01-01T03:00:00Z")).unwrap(),
            utc("2024-01-02T02:00:00Z")
        );
        // Exactly on time is not "after"
        assert_eq!(
            next_run_at(&schedule, None, utc("2024-01-01T02:00:00Z")).unwrap(),
            utc("2024-01-02T02:00:00Z")
        );
    }

    #[test]
    fn test_weekly() {
        // 2024-01-01 is a Monday
        let wednesday = Schedule::Weekly {
            day_of_week: 3,
            hour: 4,
            minute: 30,
        };
        assert_eq!(
            next_run_at(&wednesday, None, utc("2024-01-01T12:00:00Z")).unwrap(),
            utc("2024-01-03T04:30:00Z")
        );

        let sunday = Schedule::Weekly {
            day_of_week: 0,
            hour: 0,
            minute: 0,
        };
        assert_eq!(
            next_run_at(&sunday, None, utc("2024-01-06T23:59:00Z")).unwrap(),
            utc("2024-01-07T00:00:00Z")
        );
    }

    #[test]
    fn test_weekly_same_day_passed_rolls_a_week() {
        let monday = Schedule::Weekly {
            day_of_week: 1,
            hour: 9,
            minute: 0,
        };
        assert_eq!(
            next_run_at(&monday, None, utc("2024-01-01T09:00:00Z")).unwrap(),
            utc("2024-01-08T09:00:00Z")
        );
        assert_eq!(
            next_run_at(&monday, None, utc("2024-01-01T08:59:00Z")).unwrap(),
            utc("2024-01-01T09:00:00Z")
        );
    }

    #[test]
    fn test_interval() {
        let schedule = Schedule::Interval { hours: 6 };
        let now = utc("2024-01-01T12:00:00Z");
        assert_eq!(
            next_run_at(&schedule, None, now).unwrap(),
            utc("2024-01-01T18:00:00Z")
        );
        assert_eq!(
            next_run_at(&schedule, Some(utc("2024-01-01T10:00:00Z")), now).unwrap(),
            utc("2024-01-01T16:00:00Z")
        );
        // Missed runs do not schedule into the past
        assert_eq!(
            next_run_at(&schedule, Some(utc("2023-12-01T00:00:00Z")), now).unwrap(),
            utc("2024-01-01T18:00:00Z")
        );
    }

    #[test]
    fn test_interval_zero_means_one_hour() {
        let now = utc("2024-01-01T12:00:00Z");
        assert_eq!(
            next_run_at(&Schedule::Interval { hours: 0 }, None, now).unwrap(),
            utc("2024-01-01T13:00:00Z")
        );
    }

    #[test]
    fn test_invalid_fields() {
        let now = utc("2024-01-01T12:00:00Z");
        assert!(matches!(
            next_run_at(&Schedule::Daily { hour: 24, minute: 0 }, None, now),
            Err(JobError::InvalidSchedule(_))
        ));
        assert!(matches!(
            next_run_at(
                &Schedule::Weekly {
                    day_of_week: 7,
                    hour: 0,
                    minute: 0
                },
                None,
                now
            ),
            Err(JobError::InvalidSchedule(_))
        ));
    }

    fn any_schedule() -> impl Strategy<Value = Schedule> {
        prop_oneof![
            (0u32..200).prop_map(|hours| Schedule::Interval { hours }),
            (0u32..24, 0u32..60).prop_map(|(hour, minute)| Schedule::Daily { hour, minute }),
            (0u32..7, 0u32..24, 0u32..60).prop_map(|(day_of_week, hour, minute)| {
                Schedule::Weekly {
                    day_of_week,
                    hour,
                    minute,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_next_run_is_in_the_future(
            schedule in any_schedule(),
            now_secs in 1_600_000_000i64..1_900_000_000,
            last_offset in proptest::option::of(-1_000_000i64..1_000_000),
        ) {
            let now = Utc.timestamp_opt(now_secs, 0).unwrap();
            let last = last_offset.map(|o| now + Duration::seconds(o));
            let next = next_run_at(&schedule, last, now).unwrap();
            prop_assert!(next > now);
            if !matches!(schedule, Schedule::Interval { .. }) {
                prop_assert!(next - now <= Duration::days(7));
            }
        }
    }
}
