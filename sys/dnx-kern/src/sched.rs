// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel primitives facade's scheduler dependency.
//!
//! `dnx-kern` never runs a task itself and never implements preemption; the
//! preemptive task scheduler is named only by this trait boundary, exactly
//! as the purpose and external-interfaces sections require. Everything the
//! rest of the kernel needs from "the scheduler" — task lifecycle,
//! counting semaphores, mutexes with priority inheritance, event flags,
//! fixed-item-size message queues, sleeps, critical sections — is a method
//! here. Any concrete implementation that honors the documented contract
//! of each method will do; [`crate::arch::sim`] is a host-only one used by
//! this crate's own tests.
//!
//! Handles are opaque `u32`s, the same way the original kernel's resource
//! header self-pointer stands in for "the kind of proof that this handle
//! is real": callers never construct one, only pass back what they were
//! given.

use dnx_abi::{Priority, Ticks};

pub type TaskHandle = u32;
pub type SemHandle = u32;
pub type MutexHandle = u32;
pub type FlagsHandle = u32;
pub type QueueHandle = u32;

/// Token returned by [`Scheduler::critical_enter`] and required to leave
/// the critical section. Carrying state here (rather than a bare `()`)
/// lets an implementation nest critical sections correctly, restoring the
/// interrupt-enable state that was in effect before the matching `enter`.
#[derive(Copy, Clone, Debug)]
pub struct CriticalToken(pub bool);

/// The scheduling contract every implementation must honor (§5):
///
/// - Preemptive, priority-based, with round-robin among equal priorities.
/// - A task blocks on wait/receive/lock exactly when the corresponding
///   predicate is false; it never busy-polls.
/// - Priorities span `[0, 255]` with 0 most important and most likely to
///   run; `NORMAL` (0) is the default.
/// - Every timeout is in milliseconds, with `dnx_abi::TIMEOUT_FOREVER`
///   reserved to mean "block indefinitely." Expiry is not an error: it is
///   reported back as `false`/`None` from the relevant method.
/// - Mutexes provide priority inheritance (or an equivalent) so a
///   high-priority waiter on a low-priority owner makes progress.
pub trait Scheduler: Send + Sync {
    // --- Task lifecycle -----------------------------------------------
    fn task_create(
        &self,
        entry: fn(usize),
        arg: usize,
        stack_words: usize,
        priority: Priority,
    ) -> TaskHandle;
    fn task_delete(&self, task: TaskHandle);
    fn task_yield(&self);
    fn task_priority_get(&self, task: TaskHandle) -> Priority;
    fn task_priority_set(&self, task: TaskHandle, priority: Priority);
    /// Approximate free stack remaining, in words, for diagnostics
    /// (`process::Stats`).
    fn task_free_stack(&self, task: TaskHandle) -> usize;
    fn task_set_tag(&self, task: TaskHandle, tag: usize);
    fn task_get_tag(&self, task: TaskHandle) -> usize;
    /// Has the task run to completion (or been deleted)?
    fn task_is_finished(&self, task: TaskHandle) -> bool;

    // --- Time -----------------------------------------------------------
    fn tick_count(&self) -> Ticks;
    fn sleep_ms(&self, ms: u32);

    // --- Counting semaphore ---------------------------------------------
    fn sem_create(&self, max: u32, initial: u32) -> SemHandle;
    fn sem_delete(&self, sem: SemHandle);
    /// Returns `false` on timeout, `true` if signaled.
    fn sem_wait(&self, sem: SemHandle, timeout_ms: u32) -> bool;
    fn sem_signal(&self, sem: SemHandle);
    fn sem_value(&self, sem: SemHandle) -> u32;

    // --- Mutex (normal and recursive) -----------------------------------
    fn mutex_create(&self, recursive: bool) -> MutexHandle;
    fn mutex_delete(&self, mutex: MutexHandle);
    fn mutex_lock(&self, mutex: MutexHandle, timeout_ms: u32) -> bool;
    fn mutex_unlock(&self, mutex: MutexHandle);

    // --- Event flags (32-bit bitset) -------------------------------------
    fn flags_create(&self) -> FlagsHandle;
    fn flags_delete(&self, flags: FlagsHandle);
    fn flags_set(&self, flags: FlagsHandle, bits: u32);
    fn flags_clear(&self, flags: FlagsHandle, bits: u32);
    /// Waits for `bits` (all of them if `wait_all`, any one otherwise).
    /// Returns the bits observed at wake, or `None` on timeout.
    fn flags_wait(
        &self,
        flags: FlagsHandle,
        bits: u32,
        wait_all: bool,
        timeout_ms: u32,
    ) -> Option<u32>;

    // --- Message queue (fixed item size, byte-slot based) ----------------
    fn queue_create(&self, length: usize, item_size: usize) -> QueueHandle;
    fn queue_delete(&self, queue: QueueHandle);
    fn queue_send(&self, queue: QueueHandle, item: &[u8], timeout_ms: u32) -> bool;
    fn queue_receive(&self, queue: QueueHandle, out: &mut [u8], timeout_ms: u32) -> bool;
    fn queue_peek(&self, queue: QueueHandle, out: &mut [u8], timeout_ms: u32) -> bool;
    fn queue_reset(&self, queue: QueueHandle);
    fn queue_count(&self, queue: QueueHandle) -> usize;
    fn queue_free_space(&self, queue: QueueHandle) -> usize;

    // --- Critical sections / ISR control ---------------------------------
    fn critical_enter(&self) -> CriticalToken;
    fn critical_exit(&self, token: CriticalToken);

    /// Optional hook invoked by the scheduler on every context switch,
    /// used to sample CPU usage per task (`process::Stats`). Grounded on
    /// the original `khooks.c` CPU-usage sampling hooks; most
    /// implementations can leave this at its no-op default.
    fn on_context_switch(&self, _from: Option<TaskHandle>, _to: TaskHandle) {}
}
