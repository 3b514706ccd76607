// Clock helpers for logging
//
// Austin Shafer - 2025
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current wall clock time in milliseconds. This is
/// what the logging infrastructure stamps messages with.
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch")
        .as_millis() as u64
}
