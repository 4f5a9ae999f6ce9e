// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel primitives facade.
//!
//! Everything in here is a thin, typed wrapper over [`crate::sched::Scheduler`]
//! that turns its bare `u32` handles into RAII objects: creation returns a
//! value, and dropping the value releases the underlying scheduler object.
//! No module above this one talks to a `Scheduler` directly.

use dnx_abi::{Priority, Ticks, TIMEOUT_FOREVER};

use crate::sched::{CriticalToken, Scheduler};

/// A running task, created via [`Primitives::spawn_task`]. Dropping it
/// deletes the underlying scheduler task; callers that want to let a task
/// run to completion on its own should `core::mem::forget` the handle (the
/// process model does this for every task it launches, since the task's
/// own lifetime is governed by `process_exit`/`process_kill`, not Rust
/// scope).
pub struct Task<'s> {
    scheduler: &'s dyn Scheduler,
    handle: crate::sched::TaskHandle,
}

impl<'s> Task<'s> {
    pub fn handle(&self) -> crate::sched::TaskHandle {
        self.handle
    }

    pub fn yield_now(&self) {
        self.scheduler.task_yield();
    }

    pub fn priority(&self) -> Priority {
        self.scheduler.task_priority_get(self.handle)
    }

    pub fn set_priority(&self, priority: Priority) {
        self.scheduler.task_priority_set(self.handle, priority);
    }

    pub fn free_stack_words(&self) -> usize {
        self.scheduler.task_free_stack(self.handle)
    }

    pub fn is_finished(&self) -> bool {
        self.scheduler.task_is_finished(self.handle)
    }

    pub fn set_tag(&self, tag: usize) {
        self.scheduler.task_set_tag(self.handle, tag);
    }

    pub fn tag(&self) -> usize {
        self.scheduler.task_get_tag(self.handle)
    }
}

impl Drop for Task<'_> {
    fn drop(&mut self) {
        self.scheduler.task_delete(self.handle);
    }
}

/// A counting semaphore.
pub struct Semaphore<'s> {
    scheduler: &'s dyn Scheduler,
    handle: crate::sched::SemHandle,
}

impl<'s> Semaphore<'s> {
    /// The raw scheduler handle, for callers that need to hand it to
    /// another task (e.g. a completion slot) rather than keep the owning
    /// `Semaphore` itself in scope.
    pub fn handle(&self) -> crate::sched::SemHandle {
        self.handle
    }

    /// Blocks until signaled or `timeout_ms` elapses (`TIMEOUT_FOREVER` to
    /// block indefinitely). Returns whether it was signaled.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        self.scheduler.sem_wait(self.handle, timeout_ms)
    }

    pub fn signal(&self) {
        self.scheduler.sem_signal(self.handle);
    }

    pub fn value(&self) -> u32 {
        self.scheduler.sem_value(self.handle)
    }
}

impl Drop for Semaphore<'_> {
    fn drop(&mut self) {
        self.scheduler.sem_delete(self.handle);
    }
}

/// A mutex, normal or recursive, with priority inheritance provided by the
/// underlying scheduler.
pub struct Mutex<'s> {
    scheduler: &'s dyn Scheduler,
    handle: crate::sched::MutexHandle,
}

impl<'s> Mutex<'s> {
    pub fn lock(&self, timeout_ms: u32) -> bool {
        self.scheduler.mutex_lock(self.handle, timeout_ms)
    }

    pub fn unlock(&self) {
        self.scheduler.mutex_unlock(self.handle);
    }
}

impl Drop for Mutex<'_> {
    fn drop(&mut self) {
        self.scheduler.mutex_delete(self.handle);
    }
}

/// A 32-bit event flag group.
pub struct EventFlags<'s> {
    scheduler: &'s dyn Scheduler,
    handle: crate::sched::FlagsHandle,
}

impl<'s> EventFlags<'s> {
    pub fn set(&self, bits: u32) {
        self.scheduler.flags_set(self.handle, bits);
    }

    pub fn clear(&self, bits: u32) {
        self.scheduler.flags_clear(self.handle, bits);
    }

    pub fn wait(&self, bits: u32, wait_all: bool, timeout_ms: u32) -> Option<u32> {
        self.scheduler
            .flags_wait(self.handle, bits, wait_all, timeout_ms)
    }
}

impl Drop for EventFlags<'_> {
    fn drop(&mut self) {
        self.scheduler.flags_delete(self.handle);
    }
}

/// A fixed-item-size message queue.
pub struct Queue<'s> {
    scheduler: &'s dyn Scheduler,
    handle: crate::sched::QueueHandle,
    item_size: usize,
}

impl<'s> Queue<'s> {
    pub fn send(&self, item: &[u8], timeout_ms: u32) -> bool {
        debug_assert_eq!(item.len(), self.item_size);
        self.scheduler.queue_send(self.handle, item, timeout_ms)
    }

    pub fn receive(&self, out: &mut [u8], timeout_ms: u32) -> bool {
        debug_assert_eq!(out.len(), self.item_size);
        self.scheduler.queue_receive(self.handle, out, timeout_ms)
    }

    pub fn peek(&self, out: &mut [u8], timeout_ms: u32) -> bool {
        debug_assert_eq!(out.len(), self.item_size);
        self.scheduler.queue_peek(self.handle, out, timeout_ms)
    }

    pub fn reset(&self) {
        self.scheduler.queue_reset(self.handle);
    }

    pub fn count(&self) -> usize {
        self.scheduler.queue_count(self.handle)
    }

    pub fn free_space(&self) -> usize {
        self.scheduler.queue_free_space(self.handle)
    }
}

impl Drop for Queue<'_> {
    fn drop(&mut self) {
        self.scheduler.queue_delete(self.handle);
    }
}

/// An entered critical section. Dropping it leaves the section, restoring
/// whatever interrupt-enable state was recorded on entry.
#[must_use = "dropping this immediately leaves the critical section"]
pub struct CriticalSection<'s> {
    scheduler: &'s dyn Scheduler,
    token: CriticalToken,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.scheduler.critical_exit(self.token);
    }
}

/// The facade itself: every kernel subsystem above this one reaches the
/// scheduler only through a `&Primitives`.
#[derive(Copy, Clone)]
pub struct Primitives<'s> {
    scheduler: &'s dyn Scheduler,
}

impl<'s> Primitives<'s> {
    pub fn new(scheduler: &'s dyn Scheduler) -> Self {
        Primitives { scheduler }
    }

    pub fn spawn_task(
        &self,
        entry: fn(usize),
        arg: usize,
        stack_words: usize,
        priority: Priority,
    ) -> Task<'s> {
        let handle = self
            .scheduler
            .task_create(entry, arg, stack_words, priority);
        Task {
            scheduler: self.scheduler,
            handle,
        }
    }

    pub fn create_semaphore(&self, max: u32, initial: u32) -> Semaphore<'s> {
        Semaphore {
            scheduler: self.scheduler,
            handle: self.scheduler.sem_create(max, initial),
        }
    }

    pub fn create_mutex(&self, recursive: bool) -> Mutex<'s> {
        Mutex {
            scheduler: self.scheduler,
            handle: self.scheduler.mutex_create(recursive),
        }
    }

    pub fn create_event_flags(&self) -> EventFlags<'s> {
        EventFlags {
            scheduler: self.scheduler,
            handle: self.scheduler.flags_create(),
        }
    }

    pub fn create_queue(&self, length: usize, item_size: usize) -> Queue<'s> {
        Queue {
            scheduler: self.scheduler,
            handle: self.scheduler.queue_create(length, item_size),
            item_size,
        }
    }

    pub fn sleep_ms(&self, ms: u32) {
        self.scheduler.sleep_ms(ms);
    }

    pub fn sleep_ticks(&self, ticks: Ticks) {
        self.scheduler
            .sleep_ms(crate::time::ticks_to_ms(ticks) as u32);
    }

    pub fn tick_count(&self) -> Ticks {
        self.scheduler.tick_count()
    }

    pub fn enter_critical(&self) -> CriticalSection<'s> {
        CriticalSection {
            scheduler: self.scheduler,
            token: self.scheduler.critical_enter(),
        }
    }
}

/// Sentinel meaning "block indefinitely," re-exported here since every
/// facade method takes a millisecond timeout.
pub const FOREVER: u32 = TIMEOUT_FOREVER;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimScheduler;

    #[test]
    fn semaphore_through_the_facade_round_trips() {
        let sched = SimScheduler::new();
        let primitives = Primitives::new(&sched);
        let sem = primitives.create_semaphore(1, 0);
        assert!(!sem.wait(5));
        sem.signal();
        assert!(sem.wait(FOREVER));
    }

    #[test]
    fn queue_through_the_facade_round_trips() {
        let sched = SimScheduler::new();
        let primitives = Primitives::new(&sched);
        let queue = primitives.create_queue(1, 4);
        assert!(queue.send(b"ABCD", FOREVER));
        let mut out = [0u8; 4];
        assert!(queue.receive(&mut out, FOREVER));
        assert_eq!(&out, b"ABCD");
    }
}
