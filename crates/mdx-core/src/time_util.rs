//! Timestamps and the cycle counter used to bound lock spins.
//!
//! Wall-clock nanoseconds come from `clock_gettime(CLOCK_REALTIME)` on Linux
//! and `SystemTime` elsewhere. [`cycles`] reads the TSC on x86_64 and falls
//! back to a monotonic nanosecond clock on other targets, so lock timeouts
//! expressed in cycles stay meaningful everywhere.

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
#[inline]
fn clock_realtime() -> (u64, u64) {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: CLOCK_REALTIME is always valid; on failure the zeroed ts is
    // reported as the epoch.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec as u64, ts.tv_nsec as u64)
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn clock_realtime() -> (u64, u64) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (d.as_secs(), d.subsec_nanos() as u64)
}

/// Current time as **nanoseconds** since Unix epoch.
#[inline]
pub fn now_ns() -> u64 {
    let (sec, nsec) = clock_realtime();
    sec * 1_000_000_000 + nsec
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    let (sec, nsec) = clock_realtime();
    sec * 1_000_000 + nsec / 1_000
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    let (sec, nsec) = clock_realtime();
    sec * 1_000 + nsec / 1_000_000
}

// ---------------------------------------------------------------------------
// Cycle counter
// ---------------------------------------------------------------------------

/// Free-running cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn cycles() -> u64 {
    // SAFETY: RDTSC is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Free-running cycle counter (monotonic nanoseconds on this target).
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn cycles() -> u64 {
    use std::{sync::LazyLock, time::Instant};
    static ORIGIN: LazyLock<Instant> = LazyLock::new(Instant::now);
    ORIGIN.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_advance() {
        let a = now_ns();
        let c = cycles();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now_ns() > a);
        assert!(cycles() > c);
        assert!(now_us() >= a / 1_000);
        assert!(now_ms() >= a / 1_000_000);
    }
}
