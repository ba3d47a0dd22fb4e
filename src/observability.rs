use tracing_subscriber::EnvFilter;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings written.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotsync_bookings_created_total";

/// Counter: creations rejected by the overlap re-check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotsync_booking_conflicts_total";

/// Counter: status transitions applied. Labels: action.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "slotsync_booking_transitions_total";

/// Counter: unbooked past slots removed by the reaper.
pub const SLOTS_PURGED_TOTAL: &str = "slotsync_slots_purged_total";

// ── Transport ───────────────────────────────────────────────────

/// Counter: reset requests. Labels: outcome (completed, rejected, failed, joined).
pub const CONNECTION_RESETS_TOTAL: &str = "slotsync_connection_resets_total";

/// Counter: store operations re-attempted by the retry wrapper.
pub const STORE_RETRIES_TOTAL: &str = "slotsync_store_retries_total";

// ── Subscriptions ───────────────────────────────────────────────

/// Gauge: live listener registrations.
pub const SUBSCRIPTIONS_ACTIVE: &str = "slotsync_subscriptions_active";

/// Counter: registrations whose first delivery missed the dead-man timer.
pub const SUBSCRIPTION_TIMEOUTS_TOTAL: &str = "slotsync_subscription_timeouts_total";

/// Counter: registrations torn down and degraded to empty results.
pub const SUBSCRIPTIONS_DEGRADED_TOTAL: &str = "slotsync_subscriptions_degraded_total";

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// No-op if the host already installed one.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
