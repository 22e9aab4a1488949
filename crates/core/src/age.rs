//! Coarse relative ages ("5m", "3h", "12d").

#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Render the age of something created at `created`, as seen at `now`.
/// Always the single coarsest unit, floor-divided; future timestamps render as `0m`.
pub fn age_since(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created).num_seconds().max(0);
    if secs < 3_600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3_600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

/// Parse a `YYYY-MM-DDTHH:MM:SSZ` timestamp and render its age at `now`.
/// Empty or malformed input yields `N/A`.
pub fn age_at(ts: &str, now: DateTime<Utc>) -> String {
    if ts.is_empty() {
        return "N/A".to_string();
    }
    match NaiveDateTime::parse_from_str(ts, TS_FORMAT) {
        Ok(naive) => age_since(naive.and_utc(), now),
        Err(e) => {
            debug!(ts = %ts, error = %e, "unparseable creation timestamp");
            "N/A".to_string()
        }
    }
}
