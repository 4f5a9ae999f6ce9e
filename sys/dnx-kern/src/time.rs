// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time and uptime.
//!
//! Monotonic uptime is counted in scheduler ticks ([`dnx_abi::Ticks`]);
//! callers generally deal in milliseconds, so this module owns the
//! conversion in both directions. Wall time itself is not modeled here —
//! it comes from an external RTC driver reached through the driver
//! registry, out of scope for this crate.

pub use dnx_abi::{Ticks, Timestamp};

/// Number of scheduler ticks per second. A concrete board port is free to
/// reconfigure this; it does not have to divide 1000 evenly, which is why
/// [`ms_to_ticks`] has to round.
pub const TICK_RATE_HZ: u64 = 1000;

/// Converts a millisecond duration to a tick count, ceiling-rounded.
///
/// When the tick rate does not divide 1000 evenly, the original kernel's
/// macro rounds up and then adds one extra tick, to guarantee that a
/// caller who asks to wait "at least N milliseconds" never wakes early due
/// to being scheduled partway through the tick in which the timeout
/// notionally expires. This is preserved exactly as specified rather than
/// "fixed": the original formula is `ceil(ms * rate / 1000) + 1`. A `ms` of
/// zero is the one exception — it means "don't block," and converts to
/// zero ticks with no `+1` fudge.
pub fn ms_to_ticks(ms: u32) -> Ticks {
    if ms == 0 {
        return Ticks(0);
    }
    let numerator = u64::from(ms) * TICK_RATE_HZ;
    let ticks = (numerator + 999) / 1000;
    Ticks(ticks + 1)
}

/// Converts a tick count back to whole milliseconds, floored.
pub fn ticks_to_ms(ticks: Ticks) -> u64 {
    (ticks.0 * 1000) / TICK_RATE_HZ
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ms_is_zero_ticks() {
        assert_eq!(ms_to_ticks(0), Ticks(0));
    }

    #[test]
    fn evenly_divisible_rate_still_gets_the_plus_one_fudge() {
        // At 1000 Hz, 1 ms is exactly 1 tick, but the formula always adds
        // one extra tick for any nonzero request.
        assert_eq!(ms_to_ticks(1), Ticks(2));
        assert_eq!(ms_to_ticks(1000), Ticks(1001));
    }

    #[test]
    fn ticks_to_ms_is_the_plain_inverse() {
        assert_eq!(ticks_to_ms(Ticks(1000)), 1000);
        assert_eq!(ticks_to_ms(Ticks(0)), 0);
    }
}
