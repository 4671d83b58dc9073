//! Counting semaphores and the binary mutexes built on them.
//!
//! Mirrors the original: a mutex is nothing but a semaphore initialized to
//! one, and both operations run with interrupts disabled (the only
//! concurrency on a uniprocessor kernel is with interrupt handlers and with
//! the scheduler itself). `up()` only increments the count and wakes the
//! longest-waiting blocked task; the woken task is the one that decrements
//! the count, after it resumes inside `down()`.

use alloc::collections::VecDeque;
use spin::Mutex as SpinMutex;

use crate::arch::IrqGuard;
use crate::error::{KError, KResult};
use crate::sched;

struct SemInner {
    value: i32,
    waiters: VecDeque<i32>,
}

pub struct Semaphore(SpinMutex<SemInner>);

impl Semaphore {
    pub fn new(initial: i32) -> Self {
        Self(SpinMutex::new(SemInner {
            value: initial,
            waiters: VecDeque::new(),
        }))
    }

    pub fn down(&self) {
        let _irq = IrqGuard::new();
        let mut inner = self.0.lock();
        if inner.value == 0 {
            inner.waiters.push_back(sched::current_pid());
            drop(inner);
            sched::sleep_on();
            inner = self.0.lock();
        }
        inner.value -= 1;
    }

    pub fn up(&self) {
        let _irq = IrqGuard::new();
        let mut inner = self.0.lock();
        inner.value += 1;
        let waiter = inner.waiters.pop_front();
        drop(inner);
        if let Some(pid) = waiter {
            sched::wake_up(pid);
        }
    }

    /// Fails with `Busy` if any task is currently blocked on this semaphore,
    /// matching the original's refusal to free a contended `ksema`.
    pub fn destroy(&self) -> KResult<()> {
        let _irq = IrqGuard::new();
        if self.0.lock().waiters.is_empty() {
            Ok(())
        } else {
            Err(KError::Busy)
        }
    }

    pub fn value(&self) -> i32 {
        self.0.lock().value
    }
}

/// A binary mutex: a [`Semaphore`] initialized to one.
pub struct Mutex(Semaphore);

impl Mutex {
    pub fn new() -> Self {
        Self(Semaphore::new(1))
    }

    pub fn lock(&self) {
        self.0.down();
    }

    pub fn unlock(&self) {
        self.0.up();
    }

    pub fn destroy(&self) -> KResult<()> {
        self.0.destroy()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// --- Handle-based API -------------------------------------------------
//
// The original exposes semaphores and mutexes as opaque handles returned by
// `ksema_init`/`kmutex_init` rather than as Rust values a caller owns
// directly; callers elsewhere in the kernel (and across the syscall
// boundary) only ever hold an id. These wrappers reproduce that surface
// over small id-indexed arenas.

use alloc::sync::Arc;
use alloc::vec::Vec;

fn find_free_slot<T>(slots: &mut Vec<Option<T>>, value: T) -> u32 {
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(value);
            return i as u32;
        }
    }
    slots.push(Some(value));
    (slots.len() - 1) as u32
}

static SEMAPHORES: SpinMutex<Vec<Option<Arc<Semaphore>>>> = SpinMutex::new(Vec::new());
static MUTEXES: SpinMutex<Vec<Option<Arc<Mutex>>>> = SpinMutex::new(Vec::new());

pub fn ksema_init(initval: i32) -> u32 {
    find_free_slot(&mut SEMAPHORES.lock(), Arc::new(Semaphore::new(initval)))
}

pub fn ksema_down(handle: u32) {
    let sem = SEMAPHORES.lock()[handle as usize].clone().unwrap();
    sem.down();
}

pub fn ksema_up(handle: u32) {
    let sem = SEMAPHORES.lock()[handle as usize].clone().unwrap();
    sem.up();
}

pub fn ksema_free(handle: u32) -> KResult<()> {
    let mut slots = SEMAPHORES.lock();
    let sem = slots[handle as usize].clone().ok_or(KError::InvalidArg)?;
    sem.destroy()?;
    slots[handle as usize] = None;
    Ok(())
}

pub fn kmutex_init() -> u32 {
    find_free_slot(&mut MUTEXES.lock(), Arc::new(Mutex::new()))
}

pub fn kmutex_lock(handle: u32) {
    let m = MUTEXES.lock()[handle as usize].clone().unwrap();
    m.lock();
}

pub fn kmutex_unlock(handle: u32) {
    let m = MUTEXES.lock()[handle as usize].clone().unwrap();
    m.unlock();
}

pub fn kmutex_free(handle: u32) -> KResult<()> {
    let mut slots = MUTEXES.lock();
    let m = slots[handle as usize].clone().ok_or(KError::InvalidArg)?;
    m.destroy()?;
    slots[handle as usize] = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_up_round_trip_without_blocking() {
        let sem = Semaphore::new(2);
        sem.down();
        assert_eq!(sem.value(), 1);
        sem.down();
        assert_eq!(sem.value(), 0);
        sem.up();
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn destroy_fails_while_a_task_is_queued() {
        sched::reset_for_test();
        let waiter = sched::kernel_thread().unwrap();

        let sem = Semaphore::new(0);
        // Simulate a task already parked on this semaphore without
        // actually blocking the test thread inside down().
        sem.0.lock().waiters.push_back(waiter);

        assert_eq!(sem.destroy(), Err(KError::Busy));
    }

    #[test]
    fn up_wakes_the_oldest_waiter_first() {
        sched::reset_for_test();
        let a = sched::kernel_thread().unwrap();
        let b = sched::kernel_thread().unwrap();

        let sem = Semaphore::new(0);
        {
            let mut inner = sem.0.lock();
            inner.waiters.push_back(a);
            inner.waiters.push_back(b);
        }

        // `up()` only wakes; it does not itself mark the semaphore state,
        // so put both tasks to sleep the way `down()` would have.
        sched::set_state_for_test(a, sched::TaskState::UninterruptibleSleep);
        sched::set_state_for_test(b, sched::TaskState::UninterruptibleSleep);

        sem.up();
        assert!(sched::is_runnable(a));
        assert!(!sched::is_runnable(b));
    }

    #[test]
    fn mutex_is_binary() {
        let m = Mutex::new();
        assert_eq!(m.0.value(), 1);
        m.lock();
        assert_eq!(m.0.value(), 0);
        m.unlock();
        assert_eq!(m.0.value(), 1);
    }
}
