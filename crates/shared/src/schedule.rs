use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The cadence scheduled backups run at.
///
/// Weekdays are numbered Sunday-first (`0` = Sunday .. `6` = Saturday)
/// wherever they leave this type, in configuration and in the database.
/// Every comparison is done on [`Weekday`] so the numbering can not drift
/// between the stored record and the clock.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Schedule {
    /// Every day at `hour`.
    Daily {
        /// Hour of the day, `0..=23`.
        hour: u32,
    },

    /// Every week on `weekday` at `hour`.
    Weekly {
        /// Day of the week.
        #[serde(with = "sunday_first")]
        weekday: Weekday,

        /// Hour of the day, `0..=23`.
        hour: u32,
    },
}

impl Schedule {
    /// The hour of the day the schedule fires at.
    pub fn hour(&self) -> u32 {
        match self {
            Self::Daily { hour } | Self::Weekly { hour, .. } => *hour,
        }
    }

    /// Ensure the schedule describes a real time.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.hour() > 23 {
            return Err(ScheduleError::Hour(self.hour()));
        }

        Ok(())
    }

    /// The first time strictly after `now` that the schedule fires.
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>, ScheduleError> {
        self.validate()?;

        let today = now.date_naive();
        let timezone = now.timezone();

        let (first_offset, step) = match self {
            Self::Daily { .. } => (0, 1),
            Self::Weekly { weekday, .. } => {
                let today_index = i64::from(now.weekday().num_days_from_sunday());
                let target_index = i64::from(weekday.num_days_from_sunday());
                ((target_index - today_index).rem_euclid(7), 7)
            }
        };

        // Today's slot may already have passed, so look at the next two or three slots.
        for slot in 0..3 {
            let offset = first_offset + slot * step;
            let Some(date) = today.checked_add_signed(TimeDelta::days(offset)) else {
                continue;
            };

            if let Some(candidate) = localize(&timezone, date, self.hour()) {
                if candidate > *now {
                    return Ok(candidate);
                }
            }
        }

        Err(ScheduleError::NoValidTime)
    }

    /// Split the schedule into the `(mode, weekday, hour)` columns it is persisted as.
    pub fn to_columns(&self) -> (&'static str, Option<u32>, u32) {
        match self {
            Self::Daily { hour } => ("daily", None, *hour),
            Self::Weekly { weekday, hour } => {
                ("weekly", Some(weekday.num_days_from_sunday()), *hour)
            }
        }
    }

    /// Rebuild a schedule from its persisted columns.
    pub fn from_columns(mode: &str, weekday: Option<u32>, hour: u32) -> Result<Self, ScheduleError> {
        let schedule = match mode {
            "daily" => Self::Daily { hour },
            "weekly" => {
                let index = weekday.ok_or(ScheduleError::MissingWeekday)?;
                let weekday = weekday_from_sunday_index(index).ok_or(ScheduleError::Weekday(index))?;
                Self::Weekly { weekday, hour }
            }
            other => return Err(ScheduleError::Mode(other.to_string())),
        };

        schedule.validate()?;
        Ok(schedule)
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::Daily { hour: 3 }
    }
}

/// Convert a Sunday-first day number into a weekday.
fn weekday_from_sunday_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Resolve `date` at `hour:00` in the timezone, stepping forward an hour at a time out of a
/// DST gap.
fn localize<Tz: TimeZone>(timezone: &Tz, date: NaiveDate, hour: u32) -> Option<DateTime<Tz>> {
    let naive: NaiveDateTime = date.and_hms_opt(hour, 0, 0)?;

    (0..3).find_map(|shift| {
        timezone
            .from_local_datetime(&(naive + TimeDelta::hours(shift)))
            .earliest()
    })
}

mod sunday_first {
    use chrono::Weekday;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(weekday: &Weekday, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(weekday.num_days_from_sunday())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Weekday, D::Error> {
        let index = u32::deserialize(deserializer)?;
        super::weekday_from_sunday_index(index)
            .ok_or_else(|| de::Error::custom(format!("weekday {index} is not in 0..=6")))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Hour {0} is not in 0..=23")]
    Hour(u32),

    #[error("Weekday {0} is not in 0..=6 (0 = Sunday)")]
    Weekday(u32),

    #[error("Weekly schedule is missing its weekday")]
    MissingWeekday,

    #[error("Unknown schedule mode '{0}'")]
    Mode(String),

    #[error("No valid local time exists for the schedule")]
    NoValidTime,
}
