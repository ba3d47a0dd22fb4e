use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::slot_key::{self, DateInput};

// ── Clock times ──────────────────────────────────────────────────

/// Wall-clock time of day at minute precision, written as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u16);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 60 + minute))
        } else {
            None
        }
    }

    pub fn minutes(&self) -> u32 {
        self.0 as u32
    }

    /// Advance by `minutes`. `None` once the result leaves the day.
    pub fn add_minutes(&self, minutes: u32) -> Option<Self> {
        let total = self.0 as u32 + minutes;
        if total < 24 * 60 {
            Some(Self(total as u16))
        } else {
            None
        }
    }

    pub fn to_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.0 as u32 / 60, self.0 as u32 % 60, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockTimeError(pub String);

impl fmt::Display for ClockTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?}, expected HH:MM", self.0)
    }
}

impl std::error::Error for ClockTimeError {}

impl FromStr for ClockTime {
    type Err = ClockTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ClockTimeError(s.to_string());
        let (h, m) = trimmed.split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u16 = h.parse().map_err(|_| err())?;
        let minute: u16 = m.parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl TimeRange {
    pub fn new(start: ClockTime, end: ClockTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end.minutes().saturating_sub(self.start.minutes())
    }
}

// ── Weekly template ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for DayOfWeek {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub active: bool,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
}

impl DaySchedule {
    pub fn window(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }
}

/// Weekday → working window. Days without an entry are off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule {
    pub days: BTreeMap<DayOfWeek, DaySchedule>,
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, day: DayOfWeek, start: ClockTime, end: ClockTime) -> Self {
        self.days.insert(
            day,
            DaySchedule {
                active: true,
                start_time: start,
                end_time: end,
            },
        );
        self
    }

    /// The active entry for a calendar weekday, if any.
    pub fn active_on(&self, weekday: Weekday) -> Option<&DaySchedule> {
        self.days
            .get(&DayOfWeek::from(weekday))
            .filter(|d| d.active)
    }

    pub fn has_active_day(&self) -> bool {
        self.days.values().any(|d| d.active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepetitionKind {
    Weekly,
    Biweekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepetitionConfig {
    #[serde(rename = "type")]
    pub kind: RepetitionKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl RepetitionConfig {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// Output of the generator before it is bound to an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCandidate {
    pub date: NaiveDate,
    pub time: ClockTime,
    pub duration_minutes: u32,
}

impl SlotCandidate {
    pub fn into_slot(self, owner_id: &str) -> Slot {
        Slot {
            owner_id: owner_id.to_string(),
            date: self.date,
            time: self.time,
            duration_minutes: self.duration_minutes,
            is_booked: false,
            booking_ref: None,
        }
    }
}

/// A concrete bookable unit. Identity is `(owner_id, date, time)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub owner_id: String,
    pub date: NaiveDate,
    pub time: ClockTime,
    pub duration_minutes: u32,
    pub is_booked: bool,
    pub booking_ref: Option<String>,
}

impl Slot {
    /// Reserved key shared with booking records.
    pub fn key(&self) -> String {
        slot_key::generate_slot_key(&DateInput::Day(self.date), &self.time.to_string())
    }

    /// Store document id: one document per owner and reserved key.
    pub fn document_id(&self) -> String {
        slot_document_id(&self.owner_id, self.date, self.time)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.date.and_time(self.time.to_naive()).and_utc()
    }

    pub fn from_document(doc: &SlotDocument) -> Self {
        let start = doc.start_instant;
        let minutes = (doc.end_instant - start).num_minutes().max(0) as u32;
        let time = ClockTime::from_hm(start.hour() as u16, start.minute() as u16)
            .unwrap_or(ClockTime::MIDNIGHT);
        Self {
            owner_id: doc.owner_id.clone(),
            date: start.date_naive(),
            time,
            duration_minutes: minutes,
            is_booked: !doc.is_available,
            booking_ref: doc.booking_ref.clone(),
        }
    }
}

pub fn slot_document_id(owner_id: &str, date: NaiveDate, time: ClockTime) -> String {
    format!(
        "{owner_id}_{}",
        slot_key::generate_slot_key(&DateInput::Day(date), &time.to_string())
    )
}

/// Calendar document as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotDocument {
    pub owner_id: String,
    pub title: String,
    #[serde(deserialize_with = "slot_key::deserialize_instant")]
    pub start_instant: DateTime<Utc>,
    #[serde(deserialize_with = "slot_key::deserialize_instant")]
    pub end_instant: DateTime<Utc>,
    pub is_available: bool,
    pub is_recurring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_pattern: Option<RepetitionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlotDocument {
    pub fn from_slot(slot: &Slot, pattern: Option<RepetitionKind>, now: DateTime<Utc>) -> Self {
        let start = slot.start();
        Self {
            owner_id: slot.owner_id.clone(),
            title: "Available".to_string(),
            start_instant: start,
            end_instant: start + chrono::Duration::minutes(slot.duration_minutes as i64),
            is_available: !slot.is_booked,
            is_recurring: pattern.is_some(),
            recurring_pattern: pattern,
            booking_ref: slot.booking_ref.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings count toward conflicts and availability.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Video,
    Audio,
    Chat,
}

/// Who initiated an action. The other side receives the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Patient,
    Professional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    /// Store document id; not part of the document body.
    #[serde(skip)]
    pub id: String,
    pub patient_id: String,
    pub professional_id: String,
    pub patient_name: String,
    pub professional_name: String,
    #[serde(deserialize_with = "slot_key::deserialize_day")]
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    #[serde(rename = "duration")]
    pub duration_minutes: u32,
    pub price: f64,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: BookingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }

    /// Reserved key of the slot this booking occupies.
    pub fn slot_key(&self) -> String {
        slot_key::generate_slot_key(&DateInput::Day(self.date), &self.start_time.to_string())
    }

    pub fn recipient_for(&self, actor: Actor) -> &str {
        match actor {
            Actor::Patient => &self.professional_id,
            Actor::Professional => &self.patient_id,
        }
    }
}

/// Caller-supplied fields for a new booking.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub patient_id: String,
    pub professional_id: String,
    pub patient_name: String,
    pub professional_name: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub price: f64,
    pub session_type: SessionType,
    pub notes: Option<String>,
}

// ── Side channels ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingRequested,
    BookingConfirmed,
    BookingCancelled,
    BookingCompleted,
}

/// Persistent inbox record addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub related_id: String,
    pub related_type: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Low-latency status feedback, keyed `{patient_id}/{booking_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    #[serde(skip)]
    pub patient_id: String,
    #[serde(skip)]
    pub booking_id: String,
    pub status: BookingStatus,
    pub timestamp: DateTime<Utc>,
    pub professional_name: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
}

impl StatusChange {
    pub fn key(&self) -> String {
        format!("{}/{}", self.patient_id, self.booking_id)
    }
}
