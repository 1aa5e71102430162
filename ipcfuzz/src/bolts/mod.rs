//! Bolts are no-frills helpers the rest of the fuzzer is screwed together
//! with: PRNGs, time, and the OS process glue.

pub mod os;
pub mod rands;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time, as [`Duration`] since the epoch
#[must_use]
pub fn current_time() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

/// Current time, nanoseconds since the epoch. The default RNG seed.
#[must_use]
pub fn current_nanos() -> u64 {
    current_time().as_nanos() as u64
}

/// Current time, milliseconds since the epoch
#[must_use]
pub fn current_millis() -> u64 {
    current_time().as_millis() as u64
}
