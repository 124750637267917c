// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Monotonic clock and timestamp conversions.
//!
//! All timestamps inside the engine are unsigned 64-bit nanoseconds from an
//! arbitrary monotonic epoch (process start). Microsecond decode timestamps
//! are signed and may go negative early in a session.

use std::sync::OnceLock;
use std::time::Instant;

pub use cindercast_plugin_api::{frames_to_ns, mul_div64, ns_to_frames};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in nanoseconds since the process epoch.
///
/// The first call pins the epoch; all later calls are relative to it.
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Nanoseconds per mixer tick at the given sample rate.
pub fn block_ns(block_frames: u32, sample_rate: u32) -> u64 {
    frames_to_ns(block_frames as u64, sample_rate)
}

/// Convert a timebase dts/pts value to microseconds.
pub fn timebase_to_usec(value: i64, timebase_num: u32, timebase_den: u32) -> i64 {
    value * timebase_num as i64 * 1_000_000 / timebase_den as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn timebase_conversion_video() {
        // 30 fps video: pts steps of 1 (timebase 1/30) are ~33.3ms.
        assert_eq!(timebase_to_usec(1, 1, 30), 33_333);
        assert_eq!(timebase_to_usec(30, 1, 30), 1_000_000);
    }

    #[test]
    fn timebase_conversion_audio() {
        // 48 kHz audio: a 1024-sample frame is ~21.3ms.
        assert_eq!(timebase_to_usec(1024, 1, 48_000), 21_333);
        // Negative priming timestamps keep their sign.
        assert_eq!(timebase_to_usec(-2048, 1, 48_000), -42_666);
    }
}
