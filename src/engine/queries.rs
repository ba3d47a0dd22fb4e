use chrono::NaiveDate;
use tracing::warn;

use crate::limits::*;
use crate::model::*;
use crate::realtime::{EventSink, LiveQuery};
use crate::registry::{ListenerHandle, ScopeKey};
use crate::store::collections::{BOOKINGS, SLOTS};
use crate::store::{Filter, StoredDocument};

use super::availability::{active_booking_keys, merge};
use super::conflict::find_conflict;
use super::{decode_booking, decode_booking_lossy, decode_slot_lossy, Engine, EngineError};

/// Which side of a booking a feed or listing is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingRole {
    Patient,
    Professional,
}

impl BookingRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingRole::Patient => "patient",
            BookingRole::Professional => "professional",
        }
    }

    fn field(&self) -> &'static str {
        match self {
            BookingRole::Patient => "patientId",
            BookingRole::Professional => "professionalId",
        }
    }
}

fn active_status_filter() -> Filter {
    Filter::is_in("status", BookingStatus::ACTIVE.map(|s| s.as_str()))
}

fn sort_bookings(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| (a.date, a.start_time).cmp(&(b.date, b.start_time)));
}

impl Engine {
    /// Advisory: false iff an active booking overlaps `[start, end)`.
    ///
    /// Fails open on read errors; `create_booking` re-checks authoritatively.
    pub async fn check_availability(
        &self,
        professional_id: &str,
        date: NaiveDate,
        start: ClockTime,
        end: ClockTime,
    ) -> bool {
        match self.active_bookings(professional_id, date).await {
            Ok(existing) => find_conflict(&existing, &TimeRange::new(start, end)).is_none(),
            Err(e) => {
                warn!(
                    professional = professional_id,
                    %date,
                    error = %e,
                    "availability check failed; reporting available"
                );
                true
            }
        }
    }

    pub async fn get_booking(&self, id: &str) -> Result<Booking, EngineError> {
        let data = self
            .retry
            .run("get_booking", |store| async move { store.get(BOOKINGS, id).await })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        Ok(decode_booking(&StoredDocument {
            id: id.to_string(),
            data,
        })?)
    }

    async fn query_bookings(
        &self,
        op: &'static str,
        filters: Vec<Filter>,
    ) -> Result<Vec<Booking>, EngineError> {
        let docs = self
            .retry
            .run(op, |store| {
                let filters = filters.clone();
                async move { store.query(BOOKINGS, &filters).await }
            })
            .await?;
        let mut bookings = docs
            .iter()
            .map(decode_booking)
            .collect::<Result<Vec<_>, _>>()?;
        sort_bookings(&mut bookings);
        Ok(bookings)
    }

    /// Pending and confirmed bookings of one professional on one day.
    pub(super) async fn active_bookings(
        &self,
        professional_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        self.query_bookings(
            "active_bookings",
            vec![
                Filter::eq("professionalId", professional_id),
                Filter::eq("date", date.to_string()),
                active_status_filter(),
            ],
        )
        .await
    }

    /// Every booking of a professional, optionally narrowed to one day.
    pub async fn bookings_for_professional(
        &self,
        professional_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut filters = vec![Filter::eq("professionalId", professional_id)];
        if let Some(date) = date {
            filters.push(Filter::eq("date", date.to_string()));
        }
        self.query_bookings("bookings_for_professional", filters)
            .await
    }

    pub async fn bookings_for_patient(&self, patient_id: &str) -> Result<Vec<Booking>, EngineError> {
        self.query_bookings(
            "bookings_for_patient",
            vec![Filter::eq("patientId", patient_id)],
        )
        .await
    }

    fn check_window(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
        if to < from {
            return Err(EngineError::Validation(format!(
                "query window {from}..{to} is inverted"
            )));
        }
        if (to - from).num_days() >= MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        Ok(())
    }

    /// Stored slots of `owner_id` dated within `[from, to]`, booked or not.
    ///
    /// `startInstant` may be stored as an RFC 3339 string, a store timestamp
    /// or epoch millis, so the date range is applied after decoding.
    pub async fn slots_for_owner(
        &self,
        owner_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        Self::check_window(from, to)?;
        let filters = vec![Filter::eq("ownerId", owner_id)];
        let docs = self
            .retry
            .run("slots_for_owner", |store| {
                let filters = filters.clone();
                async move { store.query(SLOTS, &filters).await }
            })
            .await?;
        let mut slots: Vec<Slot> = docs
            .iter()
            .filter_map(decode_slot_lossy)
            .filter(|s| (from..=to).contains(&s.date))
            .collect();
        slots.sort_by(|a, b| (a.date, a.time).cmp(&(b.date, b.time)));
        Ok(slots)
    }

    /// Open slots in `[from, to]`: stored slots minus anything either the
    /// slot flag or an active booking marks busy.
    pub async fn available_slots(
        &self,
        owner_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let slots = self.slots_for_owner(owner_id, from, to).await?;
        let bookings = self
            .query_bookings(
                "available_slots",
                vec![
                    Filter::eq("professionalId", owner_id),
                    Filter::gte("date", from.to_string()),
                    Filter::lte("date", to.to_string()),
                    active_status_filter(),
                ],
            )
            .await?;
        Ok(merge(slots, &active_booking_keys(&bookings)))
    }

    // ── Live feeds ──────────────────────────────────────────────

    /// Live bookings for one patient or professional, scoped `bookings:{role}:{owner}`.
    pub fn watch_bookings(
        &self,
        role: BookingRole,
        owner_id: &str,
        last_known: Vec<Booking>,
        sink: EventSink<Booking>,
    ) -> ListenerHandle {
        let query = LiveQuery {
            scope: ScopeKey::new(format!("bookings:{}", role.as_str()), owner_id),
            collection: BOOKINGS,
            filters: vec![Filter::eq(role.field(), owner_id)],
            decode: decode_booking_lossy,
        };
        self.realtime.subscribe(query, last_known, sink)
    }

    /// Live slots of one professional, scoped `slots:{owner}`.
    pub fn watch_slots(
        &self,
        owner_id: &str,
        last_known: Vec<Slot>,
        sink: EventSink<Slot>,
    ) -> ListenerHandle {
        let query = LiveQuery {
            scope: ScopeKey::new("slots", owner_id),
            collection: SLOTS,
            filters: vec![Filter::eq("ownerId", owner_id)],
            decode: decode_slot_lossy,
        };
        self.realtime.subscribe(query, last_known, sink)
    }
}
