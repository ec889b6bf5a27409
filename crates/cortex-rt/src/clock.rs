//! Monotonic nanosecond timestamps for latency measurement.
//!
//! On Linux, timestamps use `CLOCK_MONOTONIC_RAW` (immune to NTP slew).
//! On other platforms, an `Instant`-based fallback is used. All harness-side
//! and device-side stamps in a single process come from this clock; stamps
//! from different processes on the same host share the clock but stamps from
//! a remote device are only comparable with each other.

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Sleep until `target_ns` on the [`now_ns`] timeline.
///
/// Returns immediately if the target is already past — callers emit late
/// work anyway rather than skipping it.
pub fn sleep_until(target_ns: u64) {
    let now = now_ns();
    if target_ns > now {
        std::thread::sleep(std::time::Duration::from_nanos(target_ns - now));
    }
}
