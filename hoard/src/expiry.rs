//! Conversion between relative and absolute expiry times.
//!
//! An expiry is a number of seconds. Zero means the entry never expires.
//! Values below [`RELATIVE_EXPIRY_THRESHOLD`] (ten years) are durations from
//! now; anything at or above it is already a unix timestamp.

/// Ten years in seconds
pub const RELATIVE_EXPIRY_THRESHOLD: u64 = 86_400 * 3_650;

/// Current unix time in seconds
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Convert an optionally relative expiry to an absolute timestamp
pub fn to_absolute(expiry: u64) -> u64 {
    to_absolute_at(expiry, now_unix())
}

pub fn to_absolute_at(expiry: u64, now: u64) -> u64 {
    if expiry != 0 && expiry < RELATIVE_EXPIRY_THRESHOLD {
        now.saturating_add(expiry)
    } else {
        expiry
    }
}

/// Convert an optionally absolute expiry to a relative one. Absolute times
/// already in the past become 1 second, never 0 (which would mean "never").
pub fn to_relative(expiry: u64) -> u64 {
    to_relative_at(expiry, now_unix())
}

pub fn to_relative_at(expiry: u64, now: u64) -> u64 {
    if expiry >= RELATIVE_EXPIRY_THRESHOLD {
        expiry.saturating_sub(now).max(1)
    } else {
        expiry
    }
}

/// Whether an absolute expiry has passed. Zero never expires.
pub fn is_expired(expires_at: u64, now: u64) -> bool {
    expires_at != 0 && expires_at <= now
}
