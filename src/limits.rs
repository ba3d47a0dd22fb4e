/// Widest calendar window a single generation pass will expand (days, inclusive).
pub const MAX_GENERATION_DAYS: i64 = 731;

/// Max candidates persisted in one `publish_slots` call.
pub const MAX_PUBLISH_BATCH: usize = 2_000;

/// Smallest / largest slot length in minutes.
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_ID_LEN: usize = 128;

/// Window accepted by `available_slots` queries (days).
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;
