use std::future::Future;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::connection::ConnectionResetController;
use crate::engine::EngineError;
use crate::observability::STORE_RETRIES_TOTAL;
use crate::store::{ErrorClass, StoreError, StoreHandle};

/// Bounded retry around store operations.
///
/// Each attempt gets a freshly fetched handle. Permanent errors surface at
/// once; the first transport-fatal error in a budget triggers a connection
/// reset before the next attempt.
#[derive(Clone)]
pub struct Retrier {
    connection: Arc<ConnectionResetController>,
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(connection: Arc<ConnectionResetController>, policy: RetryPolicy) -> Self {
        Self { connection, policy }
    }

    pub fn connection(&self) -> &Arc<ConnectionResetController> {
        &self.connection
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut(StoreHandle) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut reset_done = false;
        let mut last: Option<StoreError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                metrics::counter!(STORE_RETRIES_TOTAL).increment(1);
                sleep(self.policy.backoff(attempt - 1)).await;
            }
            let store = match self.connection.store() {
                Ok(store) => store,
                Err(e) => {
                    debug!(op, attempt, error = %e, "no transport handle");
                    last = Some(e);
                    continue;
                }
            };
            let err = match f(store).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match err.class() {
                ErrorClass::Permanent => return Err(err.into()),
                ErrorClass::Fatal => {
                    warn!(op, attempt, error = %err, "transport-fatal error");
                    self.connection.record_error(&err).await;
                    if !reset_done && attempt + 1 < attempts {
                        reset_done = true;
                        self.connection.reset_connection().await;
                    }
                }
                ErrorClass::Transient => {
                    debug!(op, attempt, error = %err, "transient store error");
                }
            }
            last = Some(err);
        }

        Err(match last {
            Some(e) if e.is_fatal() => EngineError::TransportFatal(e.to_string()),
            Some(e) => EngineError::TransportUnavailable(e.to_string()),
            None => EngineError::TransportUnavailable(format!("{op}: no attempt made")),
        })
    }
}
