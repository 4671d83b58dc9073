//! The user-visible system-call surface, dispatched in the real kernel via
//! software interrupt 0x80 with arguments in registers and the return value
//! in the accumulator — both are hardware/ABI concerns for the interrupt
//! gate and calling convention set up at boot, out of scope here. What
//! remains in scope, and is implemented below, is each call's effect on
//! scheduler and memory state.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KError, KResult};
use crate::sched;
use crate::time;

pub fn exit(status: i32) {
    sched::do_exit(status);
}

pub fn fork() -> i32 {
    sched::fork().unwrap_or(-1)
}

/// Blocks for a specific child (`Some(pid)`) or any child (`None`), writing
/// its exit status through `status` if reaping succeeds. Returns -1 if the
/// caller has no matching child.
pub fn waitpid(pid: Option<i32>, status: &mut i32) -> i32 {
    match sched::do_waitpid(pid) {
        Ok((reaped_pid, exit_status)) => {
            *status = exit_status;
            reaped_pid
        }
        Err(_) => -1,
    }
}

pub fn getpid() -> i32 {
    sched::current_pid()
}

pub fn getppid() -> i32 {
    sched::current_ppid()
}

pub fn time() -> u64 {
    time::time()
}

pub fn stime(seconds: u64) {
    time::stime(seconds);
}

pub fn sleep(msec: u64) {
    sched::do_sleep(msec);
}

const PAGE_SIZE: u32 = 4096;

/// Per-task data segment break. A real per-task field belongs on the task
/// struct; tracked as a single global here since this crate does not model
/// more than one address space (see the module doc and the "segment-based
/// isolation" non-goal).
static BRK: AtomicU32 = AtomicU32::new(0);
static CODE_SEGMENT_SIZE: AtomicU32 = AtomicU32::new(0);

/// Establishes the code segment size `brk` may never shrink below, and the
/// data segment's starting break. Called once per task at creation time by
/// whoever sets up its segment descriptors.
pub fn init_brk(code_segment_size: u32, initial_break: u32) {
    CODE_SEGMENT_SIZE.store(code_segment_size, Ordering::Relaxed);
    BRK.store(initial_break, Ordering::Relaxed);
}

/// Grows or shrinks the data segment to `size` bytes, rounded up to a page.
/// Returns the break actually set; on failure (shrinking below the code
/// segment) the break is left unchanged and returned as-is.
pub fn brk(size: u32) -> u32 {
    let rounded = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let floor = CODE_SEGMENT_SIZE.load(Ordering::Relaxed);
    if rounded < floor {
        return BRK.load(Ordering::Relaxed);
    }
    BRK.store(rounded, Ordering::Relaxed);
    rounded
}

pub fn check_segment_layout(code_size: u32, data_size: u32) -> KResult<()> {
    if code_size > data_size {
        return Err(KError::InvalidArg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brk_rounds_up_to_a_page() {
        init_brk(0, 0);
        assert_eq!(brk(1), PAGE_SIZE);
        assert_eq!(brk(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(brk(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn brk_refuses_to_shrink_below_code_segment() {
        init_brk(3 * PAGE_SIZE, 5 * PAGE_SIZE);
        let before = brk(5 * PAGE_SIZE);
        let after = brk(PAGE_SIZE);
        assert_eq!(after, before);
    }

    #[test]
    fn sleep_zero_is_a_no_op() {
        sched::reset_for_test();
        sleep(0);
        assert_eq!(sched::current_pid(), 0);
    }

    #[test]
    fn waitpid_with_no_children_returns_negative_one() {
        sched::reset_for_test();
        let mut status = 0;
        assert_eq!(waitpid(None, &mut status), -1);
    }
}
