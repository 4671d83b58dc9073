//! Tick and wall-clock accounting, driven by the periodic timer interrupt.
//!
//! Reading the RTC to seed wall-clock time and programming the PIT/APIC
//! timer hardware are boot-time concerns out of scope here; this module
//! only carries the per-tick bookkeeping the original timer interrupt
//! handler performs once the timer is already running.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Timer interrupt frequency, in Hz.
pub const HZ: u32 = 1000;
/// Every this many ticks, the scheduler re-elects the running task.
pub const SCHED_TICKS: u32 = 10;

static TICKS: AtomicU64 = AtomicU64::new(0);
static REALTIME: AtomicU64 = AtomicU64::new(0);
static REALTIME_SUBTICK: AtomicU32 = AtomicU32::new(HZ);

/// Number of timer ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Current wall-clock time, in whole seconds since whatever epoch the
/// caller last set with [`stime`].
pub fn time() -> u64 {
    REALTIME.load(Ordering::Relaxed)
}

/// Sets the wall clock, as the `stime` syscall does.
pub fn stime(seconds: u64) {
    REALTIME.store(seconds, Ordering::Relaxed);
    REALTIME_SUBTICK.store(HZ, Ordering::Relaxed);
}

/// Converts a millisecond duration to a tick count, the way `do_sleep` does.
pub fn ms_to_ticks(msec: u64) -> u64 {
    (msec * HZ as u64) / 1000
}

/// Called once per timer interrupt. Advances the tick counter, charges the
/// running task for its slice of CPU time, wakes any sleeper whose timeout
/// has elapsed, rolls the wall clock forward once a second, and re-runs the
/// scheduler every [`SCHED_TICKS`] ticks.
pub fn handle_timer_interrupt() {
    let ticks = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    crate::sched::tick_current();
    crate::sched::tick_sleepers();

    if REALTIME_SUBTICK.fetch_sub(1, Ordering::Relaxed) == 1 {
        REALTIME.fetch_add(1, Ordering::Relaxed);
        REALTIME_SUBTICK.store(HZ, Ordering::Relaxed);
    }

    if ticks as u32 % SCHED_TICKS == 0 {
        crate::sched::schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_ticks_matches_hz() {
        assert_eq!(ms_to_ticks(1000), HZ as u64);
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(10), 10);
    }
}
