use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// The one overlap predicate: half-open `[start, end)` intervals intersect.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.start < b.end && b.start < a.end
}

/// First active booking whose interval overlaps `requested`.
pub fn find_conflict<'a>(existing: &'a [Booking], requested: &TimeRange) -> Option<&'a Booking> {
    existing
        .iter()
        .filter(|b| b.status.is_active())
        .find(|b| overlaps(&b.range(), requested))
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn require(value: &str, field: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    Ok(())
}

pub(crate) fn validate_new_booking(req: &NewBooking) -> Result<(), EngineError> {
    require(&req.patient_id, "patientId")?;
    require(&req.professional_id, "professionalId")?;
    check_len(&req.patient_id, MAX_ID_LEN, "patient id too long")?;
    check_len(&req.professional_id, MAX_ID_LEN, "professional id too long")?;
    check_len(&req.patient_name, MAX_NAME_LEN, "patient name too long")?;
    check_len(&req.professional_name, MAX_NAME_LEN, "professional name too long")?;
    if let Some(ref notes) = req.notes {
        check_len(notes, MAX_NOTES_LEN, "notes too long")?;
    }
    if TimeRange::new(req.start_time, req.end_time).is_empty() {
        return Err(EngineError::Validation(format!(
            "booking window {}-{} is empty",
            req.start_time, req.end_time
        )));
    }
    if !req.price.is_finite() || req.price < 0.0 {
        return Err(EngineError::Validation("price must be a non-negative number".into()));
    }
    Ok(())
}

pub(crate) fn validate_slot_minutes(minutes: u32) -> Result<(), EngineError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
        return Err(EngineError::Validation(format!(
            "slot duration {minutes} outside {MIN_SLOT_MINUTES}..={MAX_SLOT_MINUTES} minutes"
        )));
    }
    Ok(())
}
