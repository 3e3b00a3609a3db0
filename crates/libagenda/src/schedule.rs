use agenda_protocol::model::{
    Availability, HourlySchedule, Schedule, Task, WeekdayIndex, weekday_index,
};
use chrono::{DateTime, FixedOffset, Timelike};
use std::collections::{BTreeMap, BTreeSet};

/// First bookable hour of the day.
pub const FIRST_HOUR: u32 = 8;
/// Last hour a task may start in.
pub const LAST_HOUR: u32 = 17;

pub const MONDAY: WeekdayIndex = 1;
pub const FRIDAY: WeekdayIndex = 5;

pub fn is_business_day(weekday: WeekdayIndex) -> bool {
    (MONDAY..=FRIDAY).contains(&weekday)
}

pub fn is_business_hour(hour: u32) -> bool {
    (FIRST_HOUR..=LAST_HOUR).contains(&hour)
}

/// Whether a task window sits inside the bookable grid.
pub fn window_in_bounds(start: &DateTime<FixedOffset>, end: &DateTime<FixedOffset>) -> bool {
    end > start
        && is_business_hour(start.hour())
        && is_business_day(weekday_index(start))
        && is_business_day(weekday_index(end))
}

/// `"{weekday}-{hour}"`
pub fn composite_key(weekday: WeekdayIndex, hour: u32) -> String {
    format!("{weekday}-{hour}")
}

/// Zero-padded 12-hour clock label, e.g. "08 AM", "12 PM", "01 PM".
pub fn hour12(hour: u32) -> String {
    let hour = hour % 24;
    let suffix = if hour < 12 { "AM" } else { "PM" };
    let display = match hour % 12 {
        0 => 12,
        h => h,
    };
    format!("{display:02} {suffix}")
}

/// Builds the hourly agenda and availability lookups for one period.
///
/// Pure: the result depends only on the two inputs, and input order only
/// matters for tasks sharing a start instant.
pub fn build(availability: &[Availability], tasks: &[Task]) -> Schedule {
    Schedule {
        availability: availability.to_vec(),
        hourly_agenda: hourly_agenda(availability, tasks),
        days_available: days_available(availability),
        hours_available: hours_available(availability),
    }
}

fn hourly_agenda(availability: &[Availability], tasks: &[Task]) -> Vec<HourlySchedule> {
    let mut hours: BTreeSet<u32> = (FIRST_HOUR..=LAST_HOUR).collect();
    hours.extend(availability.iter().map(Availability::from_hour));

    let placeable: Vec<&Task> = tasks
        .iter()
        .filter(|t| {
            is_business_day(t.start_weekday())
                && is_business_day(t.end_weekday())
                && is_business_hour(t.start_hour())
        })
        .collect();

    hours
        .into_iter()
        .map(|hour| {
            let mut tasks_by_weekday: BTreeMap<WeekdayIndex, Vec<Task>> =
                (MONDAY..=FRIDAY).map(|d| (d, Vec::new())).collect();
            for task in placeable.iter().filter(|t| t.start_hour() == hour) {
                if let Some(bucket) = tasks_by_weekday.get_mut(&task.start_weekday()) {
                    bucket.push((*task).clone());
                }
            }
            for bucket in tasks_by_weekday.values_mut() {
                // stable: equal starts keep input order
                bucket.sort_by(|a, b| a.start.cmp(&b.start));
            }
            HourlySchedule {
                hour,
                hour12: hour12(hour),
                tasks_by_weekday,
            }
        })
        .collect()
}

fn days_available(availability: &[Availability]) -> BTreeMap<WeekdayIndex, bool> {
    let mut days: BTreeMap<WeekdayIndex, bool> = (MONDAY..=FRIDAY).map(|d| (d, false)).collect();
    for row in availability {
        if let Some(flag) = days.get_mut(&row.weekday) {
            *flag = true;
        }
    }
    days
}

fn hours_available(availability: &[Availability]) -> BTreeMap<String, bool> {
    let mut hours = BTreeMap::new();
    for row in availability {
        let (from, to) = (row.from_hour(), row.to_hour());
        if from < FIRST_HOUR || to > LAST_HOUR {
            continue;
        }
        hours.insert(composite_key(row.weekday, from), true);
        for hour in from..to {
            hours.insert(composite_key(row.weekday, hour), true);
        }
    }
    hours
}
