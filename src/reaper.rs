use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::engine::Engine;

/// Background task that periodically deletes past slots nobody booked.
pub async fn run_slot_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = Utc::now().date_naive();
        match engine.purge_past_unbooked_slots(today).await {
            Ok(0) => debug!("slot reaper: nothing to purge"),
            Ok(_) => {}
            Err(e) => {
                // Next tick retries; the slots stay until then.
                warn!(error = %e, "slot reaper pass failed");
            }
        }
    }
}
