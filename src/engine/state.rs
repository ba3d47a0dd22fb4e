use crate::model::{BookingStatus, NotificationKind};

use super::EngineError;

/// Status-changing actions on an existing booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingAction {
    Confirm,
    Cancel,
    Complete { notes: Option<String> },
}

impl BookingAction {
    pub fn name(&self) -> &'static str {
        match self {
            BookingAction::Confirm => "confirm",
            BookingAction::Cancel => "cancel",
            BookingAction::Complete { .. } => "complete",
        }
    }

    /// Confirm and cancel also go out on the low-latency status channel.
    pub fn emits_status_change(&self) -> bool {
        matches!(self, BookingAction::Confirm | BookingAction::Cancel)
    }

    pub fn notification_kind(&self) -> NotificationKind {
        match self {
            BookingAction::Confirm => NotificationKind::BookingConfirmed,
            BookingAction::Cancel => NotificationKind::BookingCancelled,
            BookingAction::Complete { .. } => NotificationKind::BookingCompleted,
        }
    }
}

/// Transition table. Completed and Cancelled have no way out.
pub fn next_status(from: BookingStatus, action: &BookingAction) -> Result<BookingStatus, EngineError> {
    use BookingStatus::*;
    match (from, action) {
        (Pending, BookingAction::Confirm) => Ok(Confirmed),
        (Pending | Confirmed, BookingAction::Cancel) => Ok(Cancelled),
        (Confirmed, BookingAction::Complete { .. }) => Ok(Completed),
        _ => Err(EngineError::InvalidTransition {
            from,
            action: action.name(),
        }),
    }
}
