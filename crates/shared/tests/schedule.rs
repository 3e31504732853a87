#![allow(missing_docs)]

use chrono::{DateTime, TimeZone, Utc, Weekday};
use shared::{Schedule, ScheduleError};

fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
}

#[test]
fn weekly_sunday_to_monday_is_next_day() {
    // 2026-10-18 is a Sunday.
    let now = at(2026, 10, 18, 10, 0);
    let schedule = Schedule::Weekly {
        weekday: Weekday::Mon,
        hour: 2,
    };

    let next = schedule.next_run_after(&now).unwrap();
    assert_eq!(next, at(2026, 10, 19, 2, 0));
}

#[test]
fn weekly_saturday_to_sunday_is_next_day() {
    // 2026-10-24 is a Saturday.
    let now = at(2026, 10, 24, 23, 30);
    let schedule = Schedule::Weekly {
        weekday: Weekday::Sun,
        hour: 1,
    };

    let next = schedule.next_run_after(&now).unwrap();
    assert_eq!(next, at(2026, 10, 25, 1, 0));
}

#[test]
fn weekly_same_day_later_hour_is_today() {
    let now = at(2026, 10, 18, 1, 0);
    let schedule = Schedule::Weekly {
        weekday: Weekday::Sun,
        hour: 4,
    };

    let next = schedule.next_run_after(&now).unwrap();
    assert_eq!(next, at(2026, 10, 18, 4, 0));
}

#[test]
fn weekly_same_day_passed_hour_is_next_week() {
    let now = at(2026, 10, 18, 4, 0);
    let schedule = Schedule::Weekly {
        weekday: Weekday::Sun,
        hour: 4,
    };

    let next = schedule.next_run_after(&now).unwrap();
    assert_eq!(next, at(2026, 10, 25, 4, 0));
}

#[test]
fn daily_before_hour_is_today() {
    let now = at(2026, 10, 19, 1, 59);
    let schedule = Schedule::Daily { hour: 2 };

    assert_eq!(schedule.next_run_after(&now).unwrap(), at(2026, 10, 19, 2, 0));
}

#[test]
fn daily_after_hour_is_tomorrow() {
    let now = at(2026, 10, 19, 2, 1);
    let schedule = Schedule::Daily { hour: 2 };

    assert_eq!(schedule.next_run_after(&now).unwrap(), at(2026, 10, 20, 2, 0));
}

#[test]
fn daily_across_month_end() {
    let now = at(2026, 10, 31, 23, 0);
    let schedule = Schedule::Daily { hour: 0 };

    assert_eq!(schedule.next_run_after(&now).unwrap(), at(2026, 11, 1, 0, 0));
}

#[test]
fn invalid_hour_is_rejected() {
    let schedule = Schedule::Daily { hour: 24 };
    assert_eq!(
        schedule.next_run_after(&at(2026, 10, 19, 0, 0)),
        Err(ScheduleError::Hour(24))
    );
}

#[test]
fn columns_use_sunday_first_numbering() {
    let schedule = Schedule::Weekly {
        weekday: Weekday::Sun,
        hour: 5,
    };
    assert_eq!(schedule.to_columns(), ("weekly", Some(0), 5));

    let monday = Schedule::from_columns("weekly", Some(1), 5).unwrap();
    assert_eq!(
        monday,
        Schedule::Weekly {
            weekday: Weekday::Mon,
            hour: 5
        }
    );

    assert_eq!(
        Schedule::from_columns("weekly", Some(7), 5),
        Err(ScheduleError::Weekday(7))
    );
}

#[test]
fn serialized_weekday_is_sunday_first() {
    let schedule = Schedule::Weekly {
        weekday: Weekday::Sat,
        hour: 22,
    };

    let json = serde_json::to_value(schedule).unwrap();
    assert_eq!(json["mode"], "weekly");
    assert_eq!(json["weekday"], 6);

    let parsed: Schedule = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, schedule);
}
