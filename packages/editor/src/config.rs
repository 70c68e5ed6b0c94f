use std::time::Duration;
use vows_common::DEFAULT_TEMPLATE_ID;

/// Quiet period before a slug uniqueness lookup fires
pub const DEFAULT_SLUG_DEBOUNCE: Duration = Duration::from_millis(500);

/// First delay before resubscribing after the realtime channel drops
pub const DEFAULT_REALTIME_RETRY: Duration = Duration::from_millis(250);

/// Upper bound for the resubscribe backoff
pub const MAX_REALTIME_RETRY: Duration = Duration::from_secs(5);

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub slug_debounce: Duration,
    pub realtime_retry: Duration,
    pub realtime_retry_max: Duration,
    /// Template given to documents created on first load
    pub default_template_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slug_debounce: DEFAULT_SLUG_DEBOUNCE,
            realtime_retry: DEFAULT_REALTIME_RETRY,
            realtime_retry_max: MAX_REALTIME_RETRY,
            default_template_id: DEFAULT_TEMPLATE_ID.to_string(),
        }
    }
}
