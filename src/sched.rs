//! Task lifecycle and the preemptive scheduler.
//!
//! Tasks live in a flat arena (`Vec<Task>`) addressed by PID rather than by
//! raw pointer; reaped slots go on a free list and are recycled by
//! [`kernel_thread`]. The actual register-level context switch (saving and
//! restoring a real CPU context, building the initial kernel stack for a
//! brand new thread) is hardware glue this crate does not own — [`set_context_switch`]
//! lets whoever does own it plug in, and the scheduler itself only ever
//! decides *which* task should run next.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KError, KResult};
use crate::time;

pub const INIT_TASK_PID: i32 = 1;
const MAX_PID: i32 = 32768;
const IDLE_PID: i32 = 0;

pub const INITIAL_TIMESLICE: i32 = 100;
const TIMESLICE_INCREMENT: i32 = 30;
const MAX_TIMESLICE: i32 = 150;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Interruptible,
    UninterruptibleSleep,
    Dead,
}

struct Task {
    pid: i32,
    ppid: i32,
    state: TaskState,
    timeslice: i32,
    cputime: u64,
    timeout: u64,
    exit_status: i32,
    prev: u32,
    next: u32,
}

struct SchedState {
    tasks: Vec<Task>,
    free_slots: Vec<u32>,
    head: u32,
    current: u32,
    idle: u32,
    next_pid: i32,
    switch_hook: fn(i32, i32),
}

fn no_op_switch(_from_pid: i32, _to_pid: i32) {}

impl SchedState {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            free_slots: Vec::new(),
            head: NIL,
            current: NIL,
            idle: NIL,
            next_pid: INIT_TASK_PID,
            switch_hook: no_op_switch,
        }
    }

    fn link(&mut self, idx: u32) {
        self.tasks[idx as usize].prev = NIL;
        self.tasks[idx as usize].next = self.head;
        if self.head != NIL {
            self.tasks[self.head as usize].prev = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = (self.tasks[idx as usize].prev, self.tasks[idx as usize].next);
        if prev != NIL {
            self.tasks[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.tasks[next as usize].prev = prev;
        }
    }

    fn insert(&mut self, task: Task) -> u32 {
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.tasks[idx as usize] = task;
                idx
            }
            None => {
                self.tasks.push(task);
                (self.tasks.len() - 1) as u32
            }
        };
        self.link(idx);
        idx
    }

    /// Advances a persisted cursor to the next candidate pid, wrapping back
    /// to [`INIT_TASK_PID`] past [`MAX_PID`], and skips any pid currently
    /// held by a live task. Fails only if every pid is taken, which requires
    /// wrapping all the way back to where the cursor started.
    fn alloc_pid(&mut self) -> KResult<i32> {
        let start = self.next_pid;
        loop {
            self.next_pid = if self.next_pid < MAX_PID {
                self.next_pid + 1
            } else {
                INIT_TASK_PID
            };
            if self.find(self.next_pid).is_none() {
                return Ok(self.next_pid);
            }
            if self.next_pid == start {
                return Err(KError::NoMemory);
            }
        }
    }

    fn find(&self, pid: i32) -> Option<u32> {
        let mut cur = self.head;
        while cur != NIL {
            if self.tasks[cur as usize].pid == pid {
                return Some(cur);
            }
            cur = self.tasks[cur as usize].next;
        }
        None
    }

    /// Election algorithm: pick the runnable task with the strictly
    /// greatest positive timeslice. If none has any timeslice left, give
    /// every non-idle task a boost (capped) and pick the *last* runnable
    /// task seen in that second pass — a deliberate tie-break, not an
    /// oversight, matching the original.
    fn elect(&mut self) -> u32 {
        let mut best = NIL;
        let mut best_slice = 0;

        let mut cur = self.head;
        while cur != NIL {
            let t = &self.tasks[cur as usize];
            if cur != self.idle && t.state == TaskState::Runnable && t.timeslice > best_slice {
                best = cur;
                best_slice = t.timeslice;
            }
            cur = self.tasks[cur as usize].next;
        }

        if best != NIL {
            return best;
        }

        let mut cur = self.head;
        while cur != NIL {
            if cur != self.idle {
                let t = &mut self.tasks[cur as usize];
                t.timeslice = (t.timeslice + TIMESLICE_INCREMENT).min(MAX_TIMESLICE);
                if t.state == TaskState::Runnable {
                    best = cur;
                }
            }
            cur = self.tasks[cur as usize].next;
        }

        if best != NIL {
            best
        } else {
            self.idle
        }
    }
}

lazy_static! {
    static ref SCHED: Mutex<SchedState> = Mutex::new(SchedState::new());
}

/// Installs the hook invoked on every context switch with `(from_pid, to_pid)`.
/// Building and switching real CPU contexts is out of scope for this crate.
pub fn set_context_switch(hook: fn(i32, i32)) {
    SCHED.lock().switch_hook = hook;
}

/// Creates the idle task. Must be called exactly once, before any other
/// scheduler entry point.
pub fn init_multitasking() {
    let mut s = SCHED.lock();
    let idx = s.insert(Task {
        pid: IDLE_PID,
        ppid: -1,
        state: TaskState::Runnable,
        timeslice: 0,
        cputime: 0,
        timeout: 0,
        exit_status: 0,
        prev: NIL,
        next: NIL,
    });
    s.idle = idx;
    s.current = idx;
}

/// Creates a new kernel task, runnable immediately, parented to the calling
/// task. Returns the new task's pid.
pub fn kernel_thread() -> KResult<i32> {
    let mut s = SCHED.lock();
    let pid = s.alloc_pid()?;
    let ppid = s.tasks[s.current as usize].pid;

    s.insert(Task {
        pid,
        ppid,
        state: TaskState::Runnable,
        timeslice: INITIAL_TIMESLICE,
        cputime: 0,
        timeout: 0,
        exit_status: 0,
        prev: NIL,
        next: NIL,
    });

    Ok(pid)
}

pub fn current_pid() -> i32 {
    let s = SCHED.lock();
    s.tasks[s.current as usize].pid
}

pub fn current_ppid() -> i32 {
    let s = SCHED.lock();
    s.tasks[s.current as usize].ppid
}

/// Duplicates the calling task's scheduling slot as a new child task.
/// Address-space duplication (the rest of what `fork()` means) is a
/// segment-based-isolation concern handled above this layer; this only
/// creates the new task's run-queue entry and assigns it a pid.
pub fn fork() -> KResult<i32> {
    kernel_thread()
}

/// Re-evaluates which task should run and switches to it if different from
/// the currently running one.
pub fn schedule() {
    let mut s = SCHED.lock();
    let next = s.elect();
    if next == s.current {
        return;
    }
    let from_pid = s.tasks[s.current as usize].pid;
    let to_pid = s.tasks[next as usize].pid;
    s.current = next;
    (s.switch_hook)(from_pid, to_pid);
    crate::console::println_trace!("trace_sched", "{} -> {}", from_pid, to_pid);
}

/// Marks a sleeping task runnable again. Panics if `pid` is not currently
/// asleep, matching the original's `ASSERT`.
pub fn wake_up(pid: i32) {
    let mut s = SCHED.lock();
    let idx = s.find(pid).expect("wake_up() on an unknown pid");
    let state = s.tasks[idx as usize].state;
    assert!(
        matches!(state, TaskState::Interruptible | TaskState::UninterruptibleSleep),
        "wake_up() on a task that is not asleep"
    );
    s.tasks[idx as usize].state = TaskState::Runnable;
}

fn sleep_on_state(state: TaskState) {
    {
        let mut s = SCHED.lock();
        let cur = s.current;
        s.tasks[cur as usize].state = state;
    }
    schedule();
}

pub fn sleep_on() {
    sleep_on_state(TaskState::UninterruptibleSleep);
}

pub fn interruptible_sleep_on() {
    sleep_on_state(TaskState::Interruptible);
}

/// Puts the calling task to sleep for `msec` milliseconds. Panics if called
/// from the idle task.
pub fn do_sleep(msec: u64) {
    if msec == 0 {
        return;
    }
    {
        let mut s = SCHED.lock();
        let cur = s.current;
        assert_ne!(cur, s.idle, "idle task must never sleep");
        s.tasks[cur as usize].timeout = time::ms_to_ticks(msec);
    }
    sleep_on();
}

/// Terminates the calling task. Reparents its children to [`INIT_TASK_PID`],
/// wakes its own parent if it was waiting, and reschedules. Panics if called
/// from the idle task.
///
/// Once a real context-switch hook is installed via [`set_context_switch`],
/// the call to [`schedule`] below never returns: a `Dead` task is never
/// elected again, so control leaves this stack for good. With the default
/// no-op hook (as in tests) it does return, purely as a bookkeeping
/// convenience.
pub fn do_exit(status: i32) {
    {
        let mut s = SCHED.lock();
        let cur = s.current;
        assert_ne!(cur, s.idle, "the idle task must never exit");

        let (pid, ppid) = (s.tasks[cur as usize].pid, s.tasks[cur as usize].ppid);
        s.tasks[cur as usize].state = TaskState::Dead;
        s.tasks[cur as usize].exit_status = status;

        let mut node = s.head;
        while node != NIL {
            if s.tasks[node as usize].ppid == pid {
                s.tasks[node as usize].ppid = INIT_TASK_PID;
            }
            node = s.tasks[node as usize].next;
        }

        if ppid != -1 {
            if let Some(parent) = s.find(ppid) {
                if s.tasks[parent as usize].state == TaskState::Interruptible {
                    s.tasks[parent as usize].state = TaskState::Runnable;
                }
            }
        }
    }

    schedule();
}

/// Blocks until a child matching `pid` (or any child, if `pid` is `None`)
/// exits, then reaps it and returns its pid and exit status. Returns
/// `Err(KError::Fail)` immediately if the calling task has no children at
/// all matching the filter.
pub fn do_waitpid(pid: Option<i32>) -> KResult<(i32, i32)> {
    loop {
        let mut s = SCHED.lock();
        let parent_pid = s.tasks[s.current as usize].pid;

        let mut any_child = false;
        let mut dead_child = NIL;
        let mut node = s.head;
        while node != NIL {
            let t = &s.tasks[node as usize];
            if t.ppid == parent_pid && pid.map_or(true, |want| want == t.pid) {
                any_child = true;
                if t.state == TaskState::Dead {
                    dead_child = node;
                    break;
                }
            }
            node = t.next;
        }

        if dead_child != NIL {
            let reaped_pid = s.tasks[dead_child as usize].pid;
            let status = s.tasks[dead_child as usize].exit_status;
            s.unlink(dead_child);
            s.free_slots.push(dead_child);
            return Ok((reaped_pid, status));
        }

        if !any_child {
            return Err(KError::Fail);
        }

        drop(s);
        interruptible_sleep_on();
    }
}

/// Timer-tick hook: charges the running task for one tick and decrements
/// its timeslice.
pub fn tick_current() {
    let mut s = SCHED.lock();
    let cur = s.current;
    s.tasks[cur as usize].cputime += 1;
    if cur != s.idle && s.tasks[cur as usize].timeslice > 0 {
        s.tasks[cur as usize].timeslice -= 1;
    }
}

/// Timer-tick hook: decrements every sleeping task's timeout, waking those
/// that reach zero.
pub fn tick_sleepers() {
    let mut s = SCHED.lock();
    let mut node = s.head;
    while node != NIL {
        let t = &mut s.tasks[node as usize];
        if t.state == TaskState::UninterruptibleSleep && t.timeout > 0 {
            t.timeout -= 1;
            if t.timeout == 0 {
                t.state = TaskState::Runnable;
            }
        }
        node = s.tasks[node as usize].next;
    }
}

/// Test-only hook letting other modules' tests park a task in a given
/// state without going through a real blocking call.
#[cfg(test)]
pub fn reset_for_test() {
    *SCHED.lock() = SchedState::new();
    init_multitasking();
}

#[cfg(test)]
pub fn set_state_for_test(pid: i32, state: TaskState) {
    let mut s = SCHED.lock();
    if let Some(idx) = s.find(pid) {
        s.tasks[idx as usize].state = state;
    }
}

#[cfg(test)]
pub fn is_runnable(pid: i32) -> bool {
    let s = SCHED.lock();
    s.find(pid)
        .map(|idx| s.tasks[idx as usize].state == TaskState::Runnable)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        reset_for_test();
    }

    #[test]
    fn election_prefers_greatest_timeslice() {
        reset();
        let a = kernel_thread().unwrap();
        let b = kernel_thread().unwrap();
        {
            let mut s = SCHED.lock();
            let ia = s.find(a).unwrap();
            s.tasks[ia as usize].timeslice = 5;
        }
        schedule();
        assert_eq!(current_pid(), b);
    }

    #[test]
    fn election_falls_back_to_idle_when_nothing_runnable() {
        reset();
        let a = kernel_thread().unwrap();
        {
            let mut s = SCHED.lock();
            let ia = s.find(a).unwrap();
            s.tasks[ia as usize].state = TaskState::Interruptible;
        }
        schedule();
        assert_eq!(current_pid(), IDLE_PID);
    }

    #[test]
    fn sleep_then_wake_makes_task_runnable_again() {
        reset();
        let a = kernel_thread().unwrap();
        {
            let mut s = SCHED.lock();
            let ia = s.find(a).unwrap();
            s.tasks[ia as usize].state = TaskState::Interruptible;
        }
        wake_up(a);
        let s = SCHED.lock();
        let ia = s.find(a).unwrap();
        assert_eq!(s.tasks[ia as usize].state, TaskState::Runnable);
    }

    #[test]
    #[should_panic(expected = "not asleep")]
    fn wake_up_on_runnable_task_panics() {
        reset();
        let a = kernel_thread().unwrap();
        let _ = a;
        wake_up(a);
    }

    #[test]
    fn exit_reparents_children_to_init() {
        reset();
        let parent = kernel_thread().unwrap();
        {
            let mut s = SCHED.lock();
            s.current = s.find(parent).unwrap();
        }
        let child = kernel_thread().unwrap();

        do_exit(0);

        let mut s = SCHED.lock();
        let ichild = s.find(child).unwrap();
        assert_eq!(s.tasks[ichild as usize].ppid, INIT_TASK_PID);
    }

    #[test]
    fn alloc_pid_advances_monotonically_instead_of_reusing_a_freed_pid() {
        reset();
        let _a = kernel_thread().unwrap();
        let b = kernel_thread().unwrap();
        let c = kernel_thread().unwrap();

        set_state_for_test(b, TaskState::Dead);
        let (reaped, _status) = do_waitpid(Some(b)).unwrap();
        assert_eq!(reaped, b);

        let d = kernel_thread().unwrap();
        assert_ne!(d, b, "the freed pid must not be handed out immediately");
        assert!(d > c, "pid allocation must keep advancing past the last-issued pid");
    }

    #[test]
    fn waitpid_reaps_dead_child_immediately() {
        reset();
        let child = kernel_thread().unwrap();
        {
            let mut s = SCHED.lock();
            let ichild = s.find(child).unwrap();
            s.tasks[ichild as usize].state = TaskState::Dead;
            s.tasks[ichild as usize].exit_status = 42;
        }
        let (pid, status) = do_waitpid(Some(child)).unwrap();
        assert_eq!(pid, child);
        assert_eq!(status, 42);
    }

    #[test]
    fn waitpid_with_no_children_fails_immediately() {
        reset();
        assert_eq!(do_waitpid(None), Err(KError::Fail));
    }
}
