use thiserror::Error;

use crate::model::BookingStatus;
use crate::store::{ErrorClass, StoreError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("slot conflict with booking {0}")]
    SlotConflict(String),
    #[error("cannot {action} a booking that is {from}")]
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("transport fatal: {0}")]
    TransportFatal(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::PermissionDenied(what) => EngineError::PermissionDenied(what),
            StoreError::FailedPrecondition(what) | StoreError::AlreadyExists(what) => {
                EngineError::PreconditionFailed(what)
            }
            StoreError::Decode(what) => EngineError::Validation(what),
            other => match other.class() {
                ErrorClass::Fatal => EngineError::TransportFatal(other.to_string()),
                _ => EngineError::TransportUnavailable(other.to_string()),
            },
        }
    }
}

impl EngineError {
    /// Errors raised by the transport rather than by the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EngineError::TransportUnavailable(_) | EngineError::TransportFatal(_)
        )
    }
}
