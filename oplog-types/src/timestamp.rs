//! Wall-clock helpers.
//!
//! Operation timestamps are advisory: they drive last-writer-wins tie
//! breaking and resolution hints, never causality.

/// One hour in milliseconds.
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
