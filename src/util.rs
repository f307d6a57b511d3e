//! Small helpers shared by the runtime and the adapters.

use core::time::Duration;

use crate::app::ports::ClockPort;

/// Poll interval used by every bounded wait.
pub const POLL_INTERVAL_MS: u32 = 50;

/// Poll `cond` every `poll_ms` until it holds or `timeout` elapses.
/// Returns the final value of `cond`.
pub fn wait_until<C, F>(clock: &mut C, timeout: Duration, poll_ms: u32, mut cond: F) -> bool
where
    C: ClockPort + ?Sized,
    F: FnMut(&C) -> bool,
{
    let start = clock.uptime_ms();
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    while !cond(clock) {
        if clock.uptime_ms().saturating_sub(start) >= timeout_ms {
            return cond(clock);
        }
        clock.delay_ms(poll_ms);
    }
    true
}

/// Round `value` to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
