use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Weekday index with Sunday = 0, matching `chrono::Weekday::num_days_from_sunday`.
pub type WeekdayIndex = u8;

pub const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

pub fn weekday_name(weekday: WeekdayIndex) -> &'static str {
    WEEKDAY_NAMES
        .get(weekday as usize)
        .copied()
        .unwrap_or(WEEKDAY_NAMES[0])
}

pub fn weekday_index(ts: &DateTime<FixedOffset>) -> WeekdayIndex {
    ts.weekday().num_days_from_sunday() as WeekdayIndex
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PeriodKind {
    Weekly,
    BiWeekly,
    Monthly,
}

/// Date range a visitor is browsing. Also the subject of the broadcast overlap test.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// Whole days spanned by the range.
    pub length: i64,
    pub kind: PeriodKind,
    pub active: bool,
}

impl Period {
    pub fn between(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        let length = (end - start).num_days().max(0);
        let kind = match length {
            0..=7 => PeriodKind::Weekly,
            8..=14 => PeriodKind::BiWeekly,
            _ => PeriodKind::Monthly,
        };
        Self {
            start,
            end,
            length,
            kind,
            active: true,
        }
    }

    /// The Monday 00:00 to next Monday 00:00 week containing `ts`, in `ts`'s offset.
    pub fn week_of(ts: DateTime<FixedOffset>) -> Self {
        let back = i64::from(ts.weekday().num_days_from_monday());
        let monday = ts.date_naive() - TimeDelta::days(back);
        let start = local_midnight(monday, *ts.offset());
        Self::between(start, start + TimeDelta::days(7))
    }

    /// Smallest period covering both `self` and `other`.
    pub fn union(&self, other: &Period) -> Self {
        Self::between(self.start.min(other.start), self.end.max(other.end))
    }

    /// Half-open interval intersection: `[start, end)` against `[other.start, other.end)`.
    pub fn overlaps(&self, other: &Period) -> bool {
        self.start < other.end && other.start < self.end
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<FixedOffset> {
    let local = date.and_time(NaiveTime::MIN);
    let utc = local - TimeDelta::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, offset)
}

/// Administrator-defined recurring open-for-business window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub weekday: WeekdayIndex,
    pub day_name: String,
    pub available_from: NaiveTime,
    pub available_to: NaiveTime,
    pub created_at: DateTime<Utc>,
    /// Only rows flagged newest are authoritative; older rows are kept for history.
    pub newest: bool,
}

impl Availability {
    pub fn new(weekday: WeekdayIndex, from: NaiveTime, to: NaiveTime) -> Self {
        Self {
            weekday,
            day_name: weekday_name(weekday).to_string(),
            available_from: from,
            available_to: to,
            created_at: Utc::now(),
            newest: true,
        }
    }

    pub fn from_hour(&self) -> u32 {
        self.available_from.hour()
    }

    pub fn to_hour(&self) -> u32 {
        self.available_to.hour()
    }
}

/// How a booked meeting takes place.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskMethod {
    #[default]
    Phone,
    InPerson,
    Teams,
    Zoom,
    GoogleMeet,
}

impl TaskMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskMethod::Phone => "phone",
            TaskMethod::InPerson => "inPerson",
            TaskMethod::Teams => "teams",
            TaskMethod::Zoom => "zoom",
            TaskMethod::GoogleMeet => "googleMeet",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "phone" => Some(TaskMethod::Phone),
            "inPerson" => Some(TaskMethod::InPerson),
            "teams" => Some(TaskMethod::Teams),
            "zoom" => Some(TaskMethod::Zoom),
            "googleMeet" => Some(TaskMethod::GoogleMeet),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskMethod::Phone => "Phone",
            TaskMethod::InPerson => "In Person",
            TaskMethod::Teams => "Microsoft Teams",
            TaskMethod::Zoom => "Zoom",
            TaskMethod::GoogleMeet => "Google Meet",
        }
    }
}

/// A visitor-submitted booking request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    /// Opaque public identifier handed back to the visitor.
    pub tid: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub detail: String,
    pub method: TaskMethod,
    /// Derived requester id; immutable after creation.
    pub owner: String,
}

impl Task {
    pub fn start_weekday(&self) -> WeekdayIndex {
        weekday_index(&self.start)
    }

    pub fn end_weekday(&self) -> WeekdayIndex {
        weekday_index(&self.end)
    }

    pub fn start_hour(&self) -> u32 {
        self.start.hour()
    }

    /// e.g. "Tuesday March 4, 9:30 - 10:00"
    pub fn formatted_date_time(&self) -> String {
        format!(
            "{} {}, {} - {}",
            weekday_name(self.start_weekday()),
            self.start.format("%B %-d"),
            self.start.format("%-H:%M"),
            self.end.format("%-H:%M"),
        )
    }
}

/// Fields an edit may change. Owner and method are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub detail: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HourlySchedule {
    pub hour: u32,
    pub hour12: String,
    pub tasks_by_weekday: BTreeMap<WeekdayIndex, Vec<Task>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub availability: Vec<Availability>,
    pub hourly_agenda: Vec<HourlySchedule>,
    pub days_available: BTreeMap<WeekdayIndex, bool>,
    /// Keyed by `"{weekday}-{hour}"`.
    pub hours_available: BTreeMap<String, bool>,
}

impl Schedule {
    /// Every task across all hourly buckets.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.hourly_agenda
            .iter()
            .flat_map(|h| h.tasks_by_weekday.values())
            .flatten()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub current_period: Period,
    pub agenda: Schedule,
}

/// Requester profile cached by network address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uid: String,
    pub name: String,
    pub company: String,
    pub email: String,
    pub phone: String,
    pub roles: Vec<String>,
}

impl UserRecord {
    /// A record created on first visit carries only the derived id.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty() && self.email.is_empty()
    }
}

/// Per-address visit tally kept alongside tasks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub uid: String,
    pub address: String,
    pub visit_count: u64,
    pub has_created_task: bool,
}

pub fn split_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}
