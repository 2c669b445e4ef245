//! Machine liveness derived from heartbeats.
//!
//! Online/offline is never stored. Every view that reports a machine's
//! status projects it at read time from the last heartbeat.

use chrono::{DateTime, Duration, Utc};

/// A machine whose last heartbeat is this many seconds old (or older) is offline.
pub const STALE_WINDOW_SECS: i64 = 120;

/// A machine is online iff it has a heartbeat newer than [`STALE_WINDOW_SECS`].
pub fn is_online(heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match heartbeat {
        Some(hb) => now - hb < Duration::seconds(STALE_WINDOW_SECS),
        None => false,
    }
}

/// Whole seconds since the first heartbeat, 0 if never seen.
pub fn uptime_secs(first_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    first_heartbeat
        .map(|first| (now - first).num_seconds().max(0))
        .unwrap_or(0)
}
