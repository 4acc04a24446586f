//! Common time and retry helpers for servo_core.

use std::time::Duration;

use servo_traits::{Clock, Result, ServoError};

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of microseconds in one millisecond.
pub const MICROS_PER_MS: u64 = 1_000;

/// Default control tick period in microseconds (200 Hz).
pub const TICK_PERIOD_US: u64 = 5_000;

/// Compute the tick period in microseconds for a given rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Retry `op` while it reports [`ServoError::Again`], sleeping `delay`
/// between attempts, up to `attempts` tries in total.
///
/// This is a setup-time helper only: device discovery may briefly report
/// busy while a motor enumerates. The control tick never retries; a tick
/// that cannot read its sensors disconnects the servo instead.
pub fn retry_while_busy<T>(
    clock: &dyn Clock,
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op() {
            Err(ServoError::Again) if attempt < attempts => clock.sleep(delay),
            other => return other,
        }
    }
    Err(ServoError::Again)
}
