mod availability;
mod conflict;
mod error;
mod generator;
mod mutations;
mod queries;
mod state;
#[cfg(test)]
mod tests;

pub use availability::{active_booking_keys, merge};
pub use conflict::{find_conflict, overlaps};
pub use error::EngineError;
pub use generator::generate_slots;
pub use queries::BookingRole;
pub use state::{next_status, BookingAction};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::connection::ConnectionResetController;
use crate::model::{Booking, Slot, SlotDocument};
use crate::notify::StatusHub;
use crate::realtime::RealtimeSubscriptionManager;
use crate::retry::Retrier;
use crate::store::{from_document, Connector, StoreError, StoredDocument};

pub struct Engine {
    pub(super) connection: Arc<ConnectionResetController>,
    pub(super) retry: Retrier,
    pub status: Arc<StatusHub>,
    pub(super) realtime: RealtimeSubscriptionManager,
    pub(super) config: EngineConfig,
    /// Serialises the authoritative re-check + write per `{professionalId}|{date}`
    /// and transitions per booking id.
    scope_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(connection: Arc<ConnectionResetController>, config: EngineConfig) -> Self {
        Self {
            retry: Retrier::new(connection.clone(), config.retry),
            realtime: RealtimeSubscriptionManager::new(
                connection.clone(),
                config.subscription_timeout,
            ),
            connection,
            status: Arc::new(StatusHub::new()),
            config,
            scope_locks: DashMap::new(),
        }
    }

    /// Build the controller, connect the first client and return a ready engine.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let connection = ConnectionResetController::new(connector, config.reset);
        connection.init().await?;
        info!("engine ready");
        Ok(Self::new(connection, config))
    }

    pub fn connection(&self) -> &Arc<ConnectionResetController> {
        &self.connection
    }

    pub fn realtime(&self) -> &RealtimeSubscriptionManager {
        &self.realtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tear down every live feed and terminate the transport.
    pub async fn shutdown(&self) {
        self.realtime.registry().shutdown();
        self.connection.shutdown().await;
        info!("engine shut down");
    }

    pub(super) async fn lock_scope(&self, key: String) -> ScopeGuard<'_> {
        let lock = self.scope_locks.entry(key.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        ScopeGuard {
            locks: &self.scope_locks,
            key,
            guard: Some(guard),
        }
    }
}

/// Holds a scope lock. The map entry is dropped with the last holder so
/// `scope_locks` only tracks scopes that are in use.
pub(super) struct ScopeGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining reference.
        self.guard.take();
        // Waiters cloned the Arc under the shard lock, so a count of 1 means nobody is queued.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub(super) fn decode_booking(doc: &StoredDocument) -> Result<Booking, StoreError> {
    let mut booking: Booking = from_document(&doc.data)?;
    booking.id = doc.id.clone();
    Ok(booking)
}

pub(super) fn decode_slot(doc: &StoredDocument) -> Result<Slot, StoreError> {
    let raw: SlotDocument = from_document(&doc.data)?;
    Ok(Slot::from_document(&raw))
}

/// Feed decoders skip malformed documents instead of failing the whole snapshot.
pub(super) fn decode_booking_lossy(doc: &StoredDocument) -> Option<Booking> {
    decode_booking(doc)
        .map_err(|e| warn!(id = %doc.id, error = %e, "skipping malformed booking"))
        .ok()
}

pub(super) fn decode_slot_lossy(doc: &StoredDocument) -> Option<Slot> {
    decode_slot(doc)
        .map_err(|e| warn!(id = %doc.id, error = %e, "skipping malformed slot"))
        .ok()
}
