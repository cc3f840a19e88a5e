//! Wall-clock helpers shared by transactions, merge, and TTL checks.

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_secs() -> u64 {
    now_nanos() / 1_000_000_000
}
