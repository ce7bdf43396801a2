//! System-wide default constants.
//!
//! Values that are not operator-tunable, grouped by subsystem.

// ============================================================================
// Acquisition
// ============================================================================

/// Capacity of the value-notification channel between transports and the router.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 4_096;

/// Default OPC UA TCP port when an endpoint omits it.
pub const DEFAULT_OPC_TCP_PORT: u16 = 4840;

/// Upper bound for `acquisition.session_backoff_ms` (one day).
pub const MAX_SESSION_BACKOFF_MS: u64 = 86_400_000;

// ============================================================================
// Prediction
// ============================================================================

/// Step used when a series has fewer than two points or no positive delta (seconds).
pub const FALLBACK_STEP_SECS: i64 = 60;

/// Upper bound for `prediction_cache.min_ahead_minutes` (one day).
pub const MAX_MIN_AHEAD_MINUTES: u64 = 1_440;

/// Upper bound for `prediction_cache.tolerance_ms` (one hour).
pub const MAX_TOLERANCE_MS: u64 = 3_600_000;

// ============================================================================
// Alerting
// ============================================================================

/// Values with absolute magnitude below this are treated as zero in deviation math.
pub const DEVIATION_EPSILON: f64 = 1e-6;

/// Default page size for "recent alerts" queries.
pub const RECENT_ALERTS_LIMIT: usize = 50;

/// Number of hourly buckets reported by alert statistics.
pub const ALERT_STATS_HOURS: i64 = 12;

/// Upper bound for `alert.duplicate_suppress_minutes` (one week).
pub const MAX_SUPPRESS_MINUTES: u64 = 10_080;

// ============================================================================
// Registry
// ============================================================================

/// Interval between devices-file mtime checks (milliseconds).
pub const REGISTRY_POLL_INTERVAL_MS: u64 = 2_000;

/// Debounce delay after a devices-file change is detected (milliseconds).
pub const REGISTRY_DEBOUNCE_MS: u64 = 500;
