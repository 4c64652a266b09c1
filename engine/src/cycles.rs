/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Cycle-accurate time keeping for the data-plane loop.
//!
//! The scheduler (`crate::scheduler`) needs a monotonic counter that is cheap
//! to read on every loop iteration and whose tick unit can be converted to
//! microseconds. On x86-64 this is the TSC; elsewhere we fall back to
//! `Instant`-derived nanosecond ticks so the crate still builds and tests on
//! non-x86 hosts.

use std::sync::OnceLock;
use std::time::Instant;

/// Number of scheduler ticks ("cycles") per wall-clock second. Calibrated
/// once, lazily, and cached for the remainder of the process.
static CYCLES_PER_SECOND: OnceLock<u64> = OnceLock::new();

/// Reads the current value of the monotonic tick counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn current_cycles() -> u64 {
    // Safety: `_rdtsc` is always available on x86_64; it has no memory or
    // aliasing preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn current_cycles() -> u64 {
    // No portable cycle counter; approximate with a fixed-frequency
    // nanosecond clock so the tick unit still behaves like a monotonic
    // counter with a known `cycles_per_second()`.
    start_instant().elapsed().as_nanos() as u64
}

#[cfg(not(target_arch = "x86_64"))]
fn start_instant() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

/// Returns the calibrated tick frequency, computing it on first use by
/// sampling the tick counter across a short sleep.
pub fn cycles_per_second() -> u64 {
    *CYCLES_PER_SECOND.get_or_init(calibrate)
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> u64 {
    const CALIBRATION_MILLIS: u64 = 50;

    let wall_start = Instant::now();
    let tsc_start = current_cycles();
    std::thread::sleep(std::time::Duration::from_millis(CALIBRATION_MILLIS));
    let tsc_end = current_cycles();
    let elapsed = wall_start.elapsed();

    let delta = tsc_end.wrapping_sub(tsc_start) as f64;
    let secs = elapsed.as_secs_f64();
    (delta / secs).round() as u64
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate() -> u64 {
    1_000_000_000
}

/// Converts a duration expressed in microseconds to scheduler ticks.
#[inline]
pub fn usecs_to_cycles(usecs: u64) -> u64 {
    (usecs as u128 * cycles_per_second() as u128 / 1_000_000) as u64
}

/// Converts a tick delta to microseconds, rounding down.
#[inline]
pub fn cycles_to_usecs(cycles: u64) -> u64 {
    (cycles as u128 * 1_000_000 / cycles_per_second().max(1) as u128) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cycles_per_second_is_plausible() {
        let hz = cycles_per_second();
        // Any modern CPU (or our nanosecond fallback) clears a few hundred
        // MHz; this just guards against a calibration that returned zero or
        // something wildly wrong.
        assert!(hz > 1_000_000, "implausible calibration: {hz} Hz");
    }

    #[test]
    fn usecs_roundtrip_is_close() {
        let usecs = 1_000u64;
        let cycles = usecs_to_cycles(usecs);
        let back = cycles_to_usecs(cycles);
        let diff = (back as i64 - usecs as i64).abs();
        assert!(diff <= 1, "roundtrip drifted by {diff} usec");
    }
}
