//! Owner of the single process-wide store handle.
//!
//! Only this controller terminates or replaces the handle. Everyone else calls
//! [`ConnectionResetController::store`] right before each use.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{ResetMode, ResetPolicy};
use crate::observability::CONNECTION_RESETS_TOTAL;
use crate::store::{Connector, StoreError, StoreHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Resetting,
    Ready,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_online: bool,
    pub is_initialized: bool,
    pub last_error: Option<String>,
    pub last_reset: Option<DateTime<Utc>>,
    /// Start times of resets inside the current rate-limit window.
    pub reset_history: VecDeque<Instant>,
}

pub struct ConnectionResetController {
    connector: Arc<dyn Connector>,
    policy: ResetPolicy,
    handle: watch::Sender<Option<StoreHandle>>,
    phase: watch::Sender<ConnectionPhase>,
    state: Mutex<ConnectionState>,
}

fn prune(history: &mut VecDeque<Instant>, now: Instant, policy: &ResetPolicy) {
    while let Some(oldest) = history.front() {
        if now.duration_since(*oldest) >= policy.window {
            history.pop_front();
        } else {
            break;
        }
    }
}

impl ConnectionResetController {
    pub fn new(connector: Arc<dyn Connector>, policy: ResetPolicy) -> Arc<Self> {
        let (handle, _) = watch::channel(None);
        let (phase, _) = watch::channel(ConnectionPhase::Idle);
        Arc::new(Self {
            connector,
            policy,
            handle,
            phase,
            state: Mutex::new(ConnectionState::default()),
        })
    }

    /// Connect the first client. No-op once initialised.
    pub async fn init(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.is_initialized {
            return Ok(());
        }
        match self.connector.connect().await {
            Ok(store) => {
                self.handle.send_replace(Some(store));
                state.is_initialized = true;
                state.is_online = true;
                state.last_error = None;
                self.phase.send_replace(ConnectionPhase::Ready);
                info!("transport initialised");
                Ok(())
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                warn!(error = %e, "transport initialisation failed");
                Err(e)
            }
        }
    }

    /// Current handle. Never hold it across an await that might span a reset.
    pub fn store(&self) -> Result<StoreHandle, StoreError> {
        self.handle
            .borrow()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("transport not initialised".into()))
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == ConnectionPhase::Ready
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    pub async fn record_error(&self, err: &StoreError) {
        self.state.lock().await.last_error = Some(err.to_string());
    }

    /// Wait up to `bound` for the phase to become `Ready`.
    pub async fn wait_ready(&self, bound: std::time::Duration) -> bool {
        let mut rx = self.phase.subscribe();
        matches!(
            timeout(bound, rx.wait_for(|p| *p == ConnectionPhase::Ready)).await,
            Ok(Ok(_))
        )
    }

    /// Reset the transport. Returns whether it ended up `Ready`.
    ///
    /// Limited to `max_resets` per rolling window; excess calls are rejected
    /// without side effects. A caller arriving during a reset joins it and waits
    /// at most `wait_bound`.
    pub async fn reset_connection(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().await;
            if self.phase() != ConnectionPhase::Resetting {
                let now = Instant::now();
                prune(&mut state.reset_history, now, &self.policy);
                if state.reset_history.len() >= self.policy.max_resets {
                    warn!(
                        limit = self.policy.max_resets,
                        "connection reset rejected: rate limit reached"
                    );
                    metrics::counter!(CONNECTION_RESETS_TOTAL, "outcome" => "rejected").increment(1);
                    return false;
                }
                state.reset_history.push_back(now);
                state.is_online = false;
                self.phase.send_replace(ConnectionPhase::Resetting);
                drop(state);

                // Runs detached so a cancelled caller cannot strand the phase in Resetting.
                let this = Arc::clone(self);
                return tokio::spawn(async move { this.run_reset().await })
                    .await
                    .unwrap_or(false);
            }
        }
        self.join_in_flight().await
    }

    async fn join_in_flight(&self) -> bool {
        metrics::counter!(CONNECTION_RESETS_TOTAL, "outcome" => "joined").increment(1);
        let mut rx = self.phase.subscribe();
        match timeout(
            self.policy.wait_bound,
            rx.wait_for(|p| *p != ConnectionPhase::Resetting),
        )
        .await
        {
            Ok(Ok(phase)) => *phase == ConnectionPhase::Ready,
            _ => {
                debug!("in-flight reset outlasted wait bound; transport treated as not ready");
                false
            }
        }
    }

    async fn run_reset(&self) -> bool {
        info!(mode = ?self.policy.mode, "transport reset started");
        if let Ok(current) = self.store()
            && let Err(e) = current.set_network_enabled(false).await
        {
            warn!(error = %e, "disabling network before reset failed");
        }
        sleep(self.policy.settle_delay).await;

        let next = match self.policy.mode {
            ResetMode::Full => {
                if let Some(old) = self.handle.send_replace(None)
                    && let Err(e) = old.terminate().await
                {
                    warn!(error = %e, "terminating previous client failed");
                }
                match self.connector.connect().await {
                    Ok(store) => store,
                    Err(e) => return self.fail_reset(e).await,
                }
            }
            ResetMode::Soft => match self.store() {
                Ok(store) => store,
                Err(e) => return self.fail_reset(e).await,
            },
        };

        if let Err(e) = next.set_network_enabled(true).await {
            return self.fail_reset(e).await;
        }
        self.handle.send_replace(Some(next));

        let mut state = self.state.lock().await;
        state.is_online = true;
        state.is_initialized = true;
        state.last_error = None;
        state.last_reset = Some(Utc::now());
        self.phase.send_replace(ConnectionPhase::Ready);
        drop(state);

        metrics::counter!(CONNECTION_RESETS_TOTAL, "outcome" => "completed").increment(1);
        info!("transport reset completed");
        true
    }

    async fn fail_reset(&self, err: StoreError) -> bool {
        let mut state = self.state.lock().await;
        state.last_error = Some(err.to_string());
        state.is_online = false;
        self.phase.send_replace(ConnectionPhase::Idle);
        drop(state);
        metrics::counter!(CONNECTION_RESETS_TOTAL, "outcome" => "failed").increment(1);
        warn!(error = %err, "transport reset failed");
        false
    }

    /// Terminate the current client and go idle.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(store) = self.handle.send_replace(None)
            && let Err(e) = store.terminate().await
        {
            warn!(error = %e, "terminate on shutdown failed");
        }
        state.is_online = false;
        state.is_initialized = false;
        self.phase.send_replace(ConnectionPhase::Idle);
    }
}
