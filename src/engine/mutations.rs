use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKINGS_CREATED_TOTAL, BOOKING_CONFLICTS_TOTAL, BOOKING_TRANSITIONS_TOTAL, SLOTS_PURGED_TOTAL,
};
use crate::store::collections::{BOOKINGS, NOTIFICATIONS, SLOTS};
use crate::store::{to_document, Filter, StoreError, StoredDocument};

use super::conflict::{find_conflict, validate_new_booking, validate_slot_minutes};
use super::generator::generate_slots;
use super::state::{next_status, BookingAction};
use super::{decode_slot, decode_slot_lossy, Engine, EngineError};

/// Fields written by a status transition.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPatch<'a> {
    status: BookingStatus,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

/// Fields written when a slot is claimed or released.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotClaimPatch<'a> {
    is_available: bool,
    booking_ref: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

fn creation_lock_key(professional_id: &str, date: NaiveDate) -> String {
    format!("{professional_id}|{date}")
}

impl Engine {
    /// Create a pending booking.
    ///
    /// The overlap check re-runs here under the per-(professional, date) lock
    /// and is authoritative: on conflict nothing is written.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_new_booking(&req)?;
        let requested = TimeRange::new(req.start_time, req.end_time);
        let _guard = self
            .lock_scope(creation_lock_key(&req.professional_id, req.date))
            .await;

        let existing = self.active_bookings(&req.professional_id, req.date).await?;
        if let Some(hit) = find_conflict(&existing, &requested) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            info!(
                professional = %req.professional_id,
                date = %req.date,
                start = %req.start_time,
                end = %req.end_time,
                conflicting = %hit.id,
                "booking rejected: slot conflict"
            );
            return Err(EngineError::SlotConflict(hit.id.clone()));
        }

        let now = Utc::now();
        let booking = Booking {
            id: Ulid::new().to_string(),
            patient_id: req.patient_id,
            professional_id: req.professional_id,
            patient_name: req.patient_name,
            professional_name: req.professional_name,
            date: req.date,
            start_time: req.start_time,
            end_time: req.end_time,
            duration_minutes: requested.duration_minutes(),
            price: req.price,
            session_type: req.session_type,
            status: BookingStatus::Pending,
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };
        let doc = to_document(&booking)?;
        self.retry
            .run("create_booking", |store| {
                let doc = doc.clone();
                let id = booking.id.clone();
                async move { store.insert(BOOKINGS, &id, doc).await }
            })
            .await?;

        self.claim_slot(&booking, true).await;
        self.notify_counterparty(
            &booking,
            Actor::Patient,
            NotificationKind::BookingRequested,
        )
        .await;

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            id = %booking.id,
            professional = %booking.professional_id,
            patient = %booking.patient_id,
            date = %booking.date,
            start = %booking.start_time,
            "booking created"
        );
        Ok(booking)
    }

    /// Professional accepts a pending booking.
    pub async fn confirm_booking(&self, id: &str) -> Result<Booking, EngineError> {
        self.transition(id, BookingAction::Confirm, Actor::Professional)
            .await
    }

    /// Either side cancels a pending or confirmed booking; the slot is released.
    pub async fn cancel_booking(&self, id: &str, actor: Actor) -> Result<Booking, EngineError> {
        self.transition(id, BookingAction::Cancel, actor).await
    }

    /// Professional closes a confirmed booking, optionally attaching session notes.
    pub async fn complete_booking(
        &self,
        id: &str,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        self.transition(id, BookingAction::Complete { notes }, Actor::Professional)
            .await
    }

    async fn transition(
        &self,
        id: &str,
        action: BookingAction,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let _guard = self.lock_scope(format!("booking|{id}")).await;
        let mut booking = self.get_booking(id).await?;
        let next = next_status(booking.status, &action)?;

        let now = Utc::now();
        let notes = match &action {
            BookingAction::Complete { notes } => notes.as_deref(),
            _ => None,
        };
        let patch = to_document(&StatusPatch {
            status: next,
            updated_at: now,
            notes,
        })?;
        self.retry
            .run("transition_booking", |store| {
                let patch = patch.clone();
                async move { store.update(BOOKINGS, id, patch).await }
            })
            .await?;

        let from = booking.status;
        booking.status = next;
        booking.updated_at = now;
        if let Some(n) = notes {
            booking.notes = Some(n.to_string());
        }
        metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "action" => action.name()).increment(1);
        info!(id, %from, to = %next, action = action.name(), "booking transitioned");

        if matches!(action, BookingAction::Cancel) {
            self.claim_slot(&booking, false).await;
        }
        self.notify_counterparty(&booking, actor, action.notification_kind())
            .await;
        if action.emits_status_change() {
            self.status.publish(StatusChange {
                patient_id: booking.patient_id.clone(),
                booking_id: booking.id.clone(),
                status: next,
                timestamp: now,
                professional_name: booking.professional_name.clone(),
                date: booking.date,
                start_time: booking.start_time,
            });
        }
        Ok(booking)
    }

    /// Mirror a booking onto its slot document, if one exists.
    ///
    /// The slot flag is advisory (availability is OR-busy across both
    /// sources), so failures are logged rather than surfaced.
    async fn claim_slot(&self, booking: &Booking, claim: bool) {
        let slot_id = slot_document_id(&booking.professional_id, booking.date, booking.start_time);
        let result = self
            .retry
            .run("claim_slot", |store| {
                let slot_id = slot_id.clone();
                async move {
                    let Some(data) = store.get(SLOTS, &slot_id).await? else {
                        return Ok(false);
                    };
                    let current = data.get("bookingRef").and_then(Value::as_str);
                    // Release only what this booking claimed.
                    if !claim && current != Some(booking.id.as_str()) {
                        return Ok(false);
                    }
                    let patch = to_document(&SlotClaimPatch {
                        is_available: !claim,
                        booking_ref: claim.then_some(booking.id.as_str()),
                        updated_at: Utc::now(),
                    })?;
                    store.update(SLOTS, &slot_id, patch).await?;
                    Ok::<_, StoreError>(true)
                }
            })
            .await;
        match result {
            Ok(true) => debug!(slot = %slot_id, booking = %booking.id, claim, "slot flag updated"),
            Ok(false) => debug!(slot = %slot_id, "no slot document to update"),
            Err(e) => warn!(slot = %slot_id, booking = %booking.id, error = %e, "slot flag update failed"),
        }
    }

    async fn notify_counterparty(&self, booking: &Booking, actor: Actor, kind: NotificationKind) {
        let (title, counterpart) = match kind {
            NotificationKind::BookingRequested => ("New booking request", &booking.patient_name),
            NotificationKind::BookingConfirmed => ("Booking confirmed", &booking.professional_name),
            NotificationKind::BookingCancelled => (
                "Booking cancelled",
                match actor {
                    Actor::Patient => &booking.patient_name,
                    Actor::Professional => &booking.professional_name,
                },
            ),
            NotificationKind::BookingCompleted => ("Session completed", &booking.professional_name),
        };
        let notification = Notification {
            recipient_id: booking.recipient_for(actor).to_string(),
            kind,
            title: title.to_string(),
            body: format!(
                "{counterpart}: {} at {} is now {}.",
                booking.date, booking.start_time, booking.status
            ),
            related_id: booking.id.clone(),
            related_type: "booking".to_string(),
            read: false,
            created_at: Utc::now(),
        };
        let result = match to_document(&notification) {
            Ok(doc) => {
                let id = Ulid::new().to_string();
                self.retry
                    .run("notify", |store| {
                        let doc = doc.clone();
                        let id = id.clone();
                        async move { store.insert(NOTIFICATIONS, &id, doc).await }
                    })
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(booking = %booking.id, ?kind, error = %e, "notification not written");
        }
    }

    // ── Slot publication ────────────────────────────────────────

    /// Persist candidates as open slots. Keys that already exist are skipped.
    /// Returns how many were written.
    pub async fn publish_slots(
        &self,
        owner_id: &str,
        candidates: &[SlotCandidate],
        pattern: Option<RepetitionKind>,
    ) -> Result<usize, EngineError> {
        if owner_id.trim().is_empty() {
            return Err(EngineError::Validation("ownerId is required".into()));
        }
        if owner_id.len() > MAX_ID_LEN {
            return Err(EngineError::LimitExceeded("owner id too long"));
        }
        if candidates.len() > MAX_PUBLISH_BATCH {
            return Err(EngineError::LimitExceeded("publish batch too large"));
        }

        let now = Utc::now();
        let mut written = 0;
        for candidate in candidates {
            let slot = candidate.into_slot(owner_id);
            let doc = to_document(&SlotDocument::from_slot(&slot, pattern, now))?;
            let id = slot.document_id();
            let inserted = self
                .retry
                .run("publish_slot", |store| {
                    let doc = doc.clone();
                    let id = id.clone();
                    async move {
                        match store.insert(SLOTS, &id, doc).await {
                            Ok(()) => Ok(true),
                            Err(StoreError::AlreadyExists(_)) => Ok(false),
                            Err(e) => Err(e),
                        }
                    }
                })
                .await?;
            if inserted {
                written += 1;
            }
        }
        info!(owner = owner_id, requested = candidates.len(), written, "slots published");
        Ok(written)
    }

    /// Expand a weekly template and publish the result.
    ///
    /// `slot_minutes` falls back to the configured default.
    pub async fn generate_and_publish(
        &self,
        owner_id: &str,
        schedule: &WeeklySchedule,
        repetition: &RepetitionConfig,
        slot_minutes: Option<u32>,
    ) -> Result<usize, EngineError> {
        let minutes = slot_minutes.unwrap_or(self.config.default_slot_minutes);
        validate_slot_minutes(minutes)?;
        let candidates = generate_slots(schedule, repetition, minutes);
        let mut written = 0;
        for chunk in candidates.chunks(MAX_PUBLISH_BATCH) {
            written += self
                .publish_slots(owner_id, chunk, Some(repetition.kind))
                .await?;
        }
        Ok(written)
    }

    /// Delete an open slot. Booked slots are kept (`PreconditionFailed`).
    pub async fn remove_slot(
        &self,
        owner_id: &str,
        date: NaiveDate,
        time: ClockTime,
    ) -> Result<(), EngineError> {
        let _guard = self.lock_scope(creation_lock_key(owner_id, date)).await;
        let id = slot_document_id(owner_id, date, time);
        let data = self
            .retry
            .run("get_slot", |store| {
                let id = id.clone();
                async move { store.get(SLOTS, &id).await }
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("slot {id}")))?;
        let slot = decode_slot(&StoredDocument {
            id: id.clone(),
            data,
        })?;
        if slot.is_booked {
            return Err(EngineError::PreconditionFailed(format!(
                "slot {id} is booked"
            )));
        }
        self.retry
            .run("remove_slot", |store| {
                let id = id.clone();
                async move { store.delete(SLOTS, &id).await }
            })
            .await?;
        info!(slot = %id, "slot removed");
        Ok(())
    }

    /// Delete unbooked slots that start before `today`. Returns how many went.
    pub async fn purge_past_unbooked_slots(&self, today: NaiveDate) -> Result<usize, EngineError> {
        let filters = [Filter::eq("isAvailable", true)];
        let unbooked = self
            .retry
            .run("find_past_slots", |store| {
                let filters = filters.clone();
                async move { store.query(SLOTS, &filters).await }
            })
            .await?;
        // Instants come in several stored shapes; compare after decoding.
        let stale: Vec<&StoredDocument> = unbooked
            .iter()
            .filter(|doc| decode_slot_lossy(doc).is_some_and(|slot| slot.date < today))
            .collect();

        let mut purged = 0;
        for doc in &stale {
            let result = self
                .retry
                .run("purge_slot", |store| {
                    let id = doc.id.clone();
                    async move { store.delete(SLOTS, &id).await }
                })
                .await;
            match result {
                Ok(()) => purged += 1,
                Err(e) => warn!(slot = %doc.id, error = %e, "purge of past slot failed"),
            }
        }
        if purged > 0 {
            metrics::counter!(SLOTS_PURGED_TOTAL).increment(purged as u64);
            info!(purged, before = %today, "past unbooked slots purged");
        }
        Ok(purged)
    }
}
