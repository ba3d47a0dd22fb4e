use std::str::FromStr;
use std::time::Duration;

/// Bounded exponential backoff around store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Toggle the network only.
    Soft,
    /// Terminate the client and connect a new one.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPolicy {
    pub max_resets: usize,
    pub window: Duration,
    pub settle_delay: Duration,
    /// How long a caller waits on someone else's in-flight reset.
    pub wait_bound: Duration,
    pub mode: ResetMode,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            max_resets: 5,
            window: Duration::from_secs(60 * 60),
            settle_delay: Duration::from_millis(250),
            wait_bound: Duration::from_secs(2),
            mode: ResetMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub reset: ResetPolicy,
    /// Dead-man timer for a subscription's first delivery.
    pub subscription_timeout: Duration,
    pub default_slot_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reset: ResetPolicy::default(),
            subscription_timeout: Duration::from_secs(15),
            default_slot_minutes: 60,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

impl EngineConfig {
    /// Defaults overridden by `SLOTSYNC_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let mode = match std::env::var("SLOTSYNC_RESET_MODE").as_deref() {
            Ok("soft") => ResetMode::Soft,
            Ok("full") => ResetMode::Full,
            _ => d.reset.mode,
        };
        Self {
            retry: RetryPolicy {
                max_attempts: env_or("SLOTSYNC_RETRY_ATTEMPTS", d.retry.max_attempts).max(1),
                base_delay: env_ms("SLOTSYNC_RETRY_BASE_MS", d.retry.base_delay),
                max_delay: env_ms("SLOTSYNC_RETRY_MAX_MS", d.retry.max_delay),
            },
            reset: ResetPolicy {
                max_resets: env_or("SLOTSYNC_RESET_LIMIT", d.reset.max_resets),
                window: env_ms("SLOTSYNC_RESET_WINDOW_MS", d.reset.window),
                settle_delay: env_ms("SLOTSYNC_RESET_SETTLE_MS", d.reset.settle_delay),
                wait_bound: env_ms("SLOTSYNC_RESET_WAIT_MS", d.reset.wait_bound),
                mode,
            },
            subscription_timeout: env_ms("SLOTSYNC_SUBSCRIPTION_TIMEOUT_MS", d.subscription_timeout),
            default_slot_minutes: env_or("SLOTSYNC_SLOT_MINUTES", d.default_slot_minutes),
        }
    }
}
