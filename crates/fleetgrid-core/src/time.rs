//! Wall-clock helpers. Timestamps are stored as unix seconds, leases as
//! unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
