use std::collections::HashSet;

use crate::model::*;

// ── Availability index ────────────────────────────────────────────

/// Reserved keys of every active booking.
///
/// Bookings whose key cannot be formed are left out rather than matching
/// everything.
pub fn active_booking_keys<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> HashSet<String> {
    bookings
        .into_iter()
        .filter(|b| b.status.is_active())
        .map(Booking::slot_key)
        .filter(|k| !k.is_empty())
        .collect()
}

/// Free slots: neither the slot record nor an active booking claims them.
///
/// Busy is OR-ed across both sources, so a stale `is_booked` or a booking
/// without a slot update each hide the candidate on their own.
pub fn merge(candidates: Vec<Slot>, active_keys: &HashSet<String>) -> Vec<Slot> {
    candidates
        .into_iter()
        .filter(|slot| !slot.is_booked && !active_keys.contains(&slot.key()))
        .collect()
}
