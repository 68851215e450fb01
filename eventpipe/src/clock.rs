//! Monotonic timestamp source, OS thread id, and processor id. Leaf
//! component — everything else in the crate depends on it, it depends on
//! nothing else here.

use nix::time::{clock_gettime, ClockId};

/// Ticks-per-second of the values returned by [`now`]. The file header's
/// `timestamp_frequency` field is always this constant: nanosecond
/// resolution.
pub const TIMESTAMP_FREQUENCY: i64 = 1_000_000_000;

/// Current monotonic timestamp in nanoseconds since an arbitrary epoch.
/// Not comparable across processes or reboots.
pub fn now() -> i64 {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("CLOCK_MONOTONIC unavailable");
    ts.tv_sec() * TIMESTAMP_FREQUENCY + ts.tv_nsec()
}

/// OS thread id of the calling thread (`gettid` on Linux).
pub fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Best-effort processor id of the calling thread. Returns 0 if the
/// platform call fails; it is advisory (`proc_num` in the wire format),
/// not relied on for correctness.
pub fn current_processor_id() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_non_decreasing() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(current_thread_id(), current_thread_id());
    }
}
