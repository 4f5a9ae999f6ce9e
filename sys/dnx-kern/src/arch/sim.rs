// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-only `Scheduler` backend built on `std::sync` and real OS threads.
//!
//! This is not a product scheduler — it exists so the rest of the kernel
//! (process lifecycle, the syscall dispatcher, device locking, the FS
//! cache, SHM) can be driven end-to-end in `#[cfg(test)]` modules and the
//! `tests/` integration suite without a real board. It favors obviously
//! correct implementations over efficient ones, the same preference for
//! "simple and clear" the rest of this crate follows.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use dnx_abi::{Priority, Ticks, TIMEOUT_FOREVER};

use crate::sched::{
    CriticalToken, FlagsHandle, MutexHandle, QueueHandle, Scheduler, SemHandle, TaskHandle,
};

struct TaskEntry {
    join: Option<std::thread::JoinHandle<()>>,
    priority: Mutex<Priority>,
    tag: Mutex<usize>,
}

struct SemEntry {
    state: Mutex<(u32, u32)>, // (value, max)
    cond: Condvar,
}

struct MutexEntry {
    recursive: bool,
    state: Mutex<Option<(std::thread::ThreadId, u32)>>,
    cond: Condvar,
}

struct FlagsEntry {
    bits: Mutex<u32>,
    cond: Condvar,
}

struct QueueEntry {
    item_size: usize,
    capacity: usize,
    items: Mutex<std::collections::VecDeque<Vec<u8>>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// A host-process-wide simulated scheduler. Construct one with
/// [`SimScheduler::new`] and share it (usually via a `'static` reference)
/// across whatever kernel singletons a test wires up.
#[derive(Default)]
pub struct SimScheduler {
    start: Mutex<Option<Instant>>,
    next_handle: Mutex<u32>,
    tasks: Mutex<HashMap<TaskHandle, TaskEntry>>,
    sems: Mutex<HashMap<SemHandle, SemEntry>>,
    mutexes: Mutex<HashMap<MutexHandle, MutexEntry>>,
    flags: Mutex<HashMap<FlagsHandle, FlagsEntry>>,
    queues: Mutex<HashMap<QueueHandle, QueueEntry>>,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self {
            start: Mutex::new(Some(Instant::now())),
            next_handle: Mutex::new(1),
            tasks: Mutex::new(HashMap::new()),
            sems: Mutex::new(HashMap::new()),
            mutexes: Mutex::new(HashMap::new()),
            flags: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_handle(&self) -> u32 {
        let mut next = self.next_handle.lock().unwrap();
        let h = *next;
        *next += 1;
        h
    }

    fn deadline(timeout_ms: u32) -> Option<Instant> {
        if timeout_ms == TIMEOUT_FOREVER {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
        }
    }
}

impl Scheduler for SimScheduler {
    fn task_create(
        &self,
        entry: fn(usize),
        arg: usize,
        _stack_words: usize,
        priority: Priority,
    ) -> TaskHandle {
        let handle = self.alloc_handle();
        let join = std::thread::Builder::new()
            .name(format!("dnx-sim-task-{handle}"))
            .spawn(move || entry(arg))
            .expect("failed to spawn simulated task thread");
        self.tasks.lock().unwrap().insert(
            handle,
            TaskEntry {
                join: Some(join),
                priority: Mutex::new(priority),
                tag: Mutex::new(0),
            },
        );
        handle
    }

    fn task_delete(&self, task: TaskHandle) {
        if let Some(entry) = self.tasks.lock().unwrap().remove(&task) {
            if let Some(join) = entry.join {
                let _ = join.join();
            }
        }
    }

    fn task_yield(&self) {
        std::thread::yield_now();
    }

    fn task_priority_get(&self, task: TaskHandle) -> Priority {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .get(&task)
            .map(|t| *t.priority.lock().unwrap())
            .unwrap_or_default()
    }

    fn task_priority_set(&self, task: TaskHandle, priority: Priority) {
        if let Some(entry) = self.tasks.lock().unwrap().get(&task) {
            *entry.priority.lock().unwrap() = priority;
        }
    }

    fn task_free_stack(&self, _task: TaskHandle) -> usize {
        // Real stack depth isn't meaningful for a host thread; report a
        // constant so callers exercising `process::Stats` get a stable
        // value.
        4096
    }

    fn task_set_tag(&self, task: TaskHandle, tag: usize) {
        if let Some(entry) = self.tasks.lock().unwrap().get(&task) {
            *entry.tag.lock().unwrap() = tag;
        }
    }

    fn task_get_tag(&self, task: TaskHandle) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .get(&task)
            .map(|t| *t.tag.lock().unwrap())
            .unwrap_or(0)
    }

    fn task_is_finished(&self, task: TaskHandle) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(&task)
            .map(|t| t.join.as_ref().map(|j| j.is_finished()).unwrap_or(true))
            .unwrap_or(true)
    }

    fn tick_count(&self) -> Ticks {
        let start = self.start.lock().unwrap().unwrap_or_else(Instant::now);
        Ticks(start.elapsed().as_millis() as u64)
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn sem_create(&self, max: u32, initial: u32) -> SemHandle {
        let handle = self.alloc_handle();
        self.sems.lock().unwrap().insert(
            handle,
            SemEntry {
                state: Mutex::new((initial.min(max), max)),
                cond: Condvar::new(),
            },
        );
        handle
    }

    fn sem_delete(&self, sem: SemHandle) {
        self.sems.lock().unwrap().remove(&sem);
    }

    fn sem_wait(&self, sem: SemHandle, timeout_ms: u32) -> bool {
        let sems = self.sems.lock().unwrap();
        let Some(entry) = sems.get(&sem) else {
            return false;
        };
        let mut state = entry.state.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        while state.0 == 0 {
            match deadline {
                None => state = entry.cond.wait(state).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    let (s, timed_out) =
                        entry.cond.wait_timeout(state, d - now).unwrap();
                    state = s;
                    if timed_out.timed_out() && state.0 == 0 {
                        return false;
                    }
                }
            }
        }
        state.0 -= 1;
        true
    }

    fn sem_signal(&self, sem: SemHandle) {
        let sems = self.sems.lock().unwrap();
        if let Some(entry) = sems.get(&sem) {
            let mut state = entry.state.lock().unwrap();
            if state.0 < state.1 {
                state.0 += 1;
            }
            entry.cond.notify_one();
        }
    }

    fn sem_value(&self, sem: SemHandle) -> u32 {
        self.sems
            .lock()
            .unwrap()
            .get(&sem)
            .map(|e| e.state.lock().unwrap().0)
            .unwrap_or(0)
    }

    fn mutex_create(&self, recursive: bool) -> MutexHandle {
        let handle = self.alloc_handle();
        self.mutexes.lock().unwrap().insert(
            handle,
            MutexEntry {
                recursive,
                state: Mutex::new(None),
                cond: Condvar::new(),
            },
        );
        handle
    }

    fn mutex_delete(&self, mutex: MutexHandle) {
        self.mutexes.lock().unwrap().remove(&mutex);
    }

    fn mutex_lock(&self, mutex: MutexHandle, timeout_ms: u32) -> bool {
        let mutexes = self.mutexes.lock().unwrap();
        let Some(entry) = mutexes.get(&mutex) else {
            return false;
        };
        let me = std::thread::current().id();
        let mut state = entry.state.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        loop {
            match *state {
                None => {
                    *state = Some((me, 1));
                    return true;
                }
                Some((owner, depth)) if owner == me && entry.recursive => {
                    *state = Some((owner, depth + 1));
                    return true;
                }
                _ => match deadline {
                    None => state = entry.cond.wait(state).unwrap(),
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return false;
                        }
                        let (s, timed_out) =
                            entry.cond.wait_timeout(state, d - now).unwrap();
                        state = s;
                        if timed_out.timed_out() && state.is_some() {
                            return false;
                        }
                    }
                },
            }
        }
    }

    fn mutex_unlock(&self, mutex: MutexHandle) {
        let mutexes = self.mutexes.lock().unwrap();
        if let Some(entry) = mutexes.get(&mutex) {
            let mut state = entry.state.lock().unwrap();
            if let Some((owner, depth)) = *state {
                if owner == std::thread::current().id() {
                    if depth > 1 {
                        *state = Some((owner, depth - 1));
                    } else {
                        *state = None;
                        entry.cond.notify_one();
                    }
                }
            }
        }
    }

    fn flags_create(&self) -> FlagsHandle {
        let handle = self.alloc_handle();
        self.flags.lock().unwrap().insert(
            handle,
            FlagsEntry {
                bits: Mutex::new(0),
                cond: Condvar::new(),
            },
        );
        handle
    }

    fn flags_delete(&self, flags: FlagsHandle) {
        self.flags.lock().unwrap().remove(&flags);
    }

    fn flags_set(&self, flags: FlagsHandle, bits: u32) {
        let table = self.flags.lock().unwrap();
        if let Some(entry) = table.get(&flags) {
            *entry.bits.lock().unwrap() |= bits;
            entry.cond.notify_all();
        }
    }

    fn flags_clear(&self, flags: FlagsHandle, bits: u32) {
        let table = self.flags.lock().unwrap();
        if let Some(entry) = table.get(&flags) {
            *entry.bits.lock().unwrap() &= !bits;
        }
    }

    fn flags_wait(
        &self,
        flags: FlagsHandle,
        bits: u32,
        wait_all: bool,
        timeout_ms: u32,
    ) -> Option<u32> {
        let table = self.flags.lock().unwrap();
        let entry = table.get(&flags)?;
        let mut observed = entry.bits.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        let satisfied = |b: u32| {
            if wait_all {
                b & bits == bits
            } else {
                b & bits != 0
            }
        };
        while !satisfied(*observed) {
            match deadline {
                None => observed = entry.cond.wait(observed).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    let (o, timed_out) =
                        entry.cond.wait_timeout(observed, d - now).unwrap();
                    observed = o;
                    if timed_out.timed_out() && !satisfied(*observed) {
                        return None;
                    }
                }
            }
        }
        Some(*observed)
    }

    fn queue_create(&self, length: usize, item_size: usize) -> QueueHandle {
        let handle = self.alloc_handle();
        self.queues.lock().unwrap().insert(
            handle,
            QueueEntry {
                item_size,
                capacity: length,
                items: Mutex::new(std::collections::VecDeque::with_capacity(length)),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            },
        );
        handle
    }

    fn queue_delete(&self, queue: QueueHandle) {
        self.queues.lock().unwrap().remove(&queue);
    }

    fn queue_send(&self, queue: QueueHandle, item: &[u8], timeout_ms: u32) -> bool {
        let queues = self.queues.lock().unwrap();
        let Some(entry) = queues.get(&queue) else {
            return false;
        };
        debug_assert_eq!(item.len(), entry.item_size);
        let mut items = entry.items.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        while items.len() >= entry.capacity {
            match deadline {
                None => items = entry.not_full.wait(items).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    let (i, timed_out) =
                        entry.not_full.wait_timeout(items, d - now).unwrap();
                    items = i;
                    if timed_out.timed_out() && items.len() >= entry.capacity {
                        return false;
                    }
                }
            }
        }
        items.push_back(item.to_vec());
        entry.not_empty.notify_one();
        true
    }

    fn queue_receive(&self, queue: QueueHandle, out: &mut [u8], timeout_ms: u32) -> bool {
        let queues = self.queues.lock().unwrap();
        let Some(entry) = queues.get(&queue) else {
            return false;
        };
        let mut items = entry.items.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        while items.is_empty() {
            match deadline {
                None => items = entry.not_empty.wait(items).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    let (i, timed_out) =
                        entry.not_empty.wait_timeout(items, d - now).unwrap();
                    items = i;
                    if timed_out.timed_out() && items.is_empty() {
                        return false;
                    }
                }
            }
        }
        if let Some(front) = items.pop_front() {
            out[..front.len()].copy_from_slice(&front);
            entry.not_full.notify_one();
            true
        } else {
            false
        }
    }

    fn queue_peek(&self, queue: QueueHandle, out: &mut [u8], timeout_ms: u32) -> bool {
        let queues = self.queues.lock().unwrap();
        let Some(entry) = queues.get(&queue) else {
            return false;
        };
        let mut items = entry.items.lock().unwrap();
        let deadline = Self::deadline(timeout_ms);
        while items.is_empty() {
            match deadline {
                None => items = entry.not_empty.wait(items).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    let (i, timed_out) =
                        entry.not_empty.wait_timeout(items, d - now).unwrap();
                    items = i;
                    if timed_out.timed_out() && items.is_empty() {
                        return false;
                    }
                }
            }
        }
        if let Some(front) = items.front() {
            out[..front.len()].copy_from_slice(front);
            true
        } else {
            false
        }
    }

    fn queue_reset(&self, queue: QueueHandle) {
        let queues = self.queues.lock().unwrap();
        if let Some(entry) = queues.get(&queue) {
            entry.items.lock().unwrap().clear();
            entry.not_full.notify_all();
        }
    }

    fn queue_count(&self, queue: QueueHandle) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(&queue)
            .map(|e| e.items.lock().unwrap().len())
            .unwrap_or(0)
    }

    fn queue_free_space(&self, queue: QueueHandle) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(&queue)
            .map(|e| e.capacity - e.items.lock().unwrap().len())
            .unwrap_or(0)
    }

    fn critical_enter(&self) -> CriticalToken {
        // Hosted tests have no real interrupts to disable; the token just
        // records that a section was entered, for symmetry with the real
        // implementation's nesting behavior.
        CriticalToken(true)
    }

    fn critical_exit(&self, _token: CriticalToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_wait_blocks_until_signaled() {
        let sched = SimScheduler::new();
        let sem = sched.sem_create(1, 0);
        assert!(!sched.sem_wait(sem, 10));
        sched.sem_signal(sem);
        assert!(sched.sem_wait(sem, TIMEOUT_FOREVER));
    }

    #[test]
    fn mutex_is_exclusive_and_recursive_when_requested() {
        let sched = SimScheduler::new();
        let m = sched.mutex_create(true);
        assert!(sched.mutex_lock(m, TIMEOUT_FOREVER));
        assert!(sched.mutex_lock(m, TIMEOUT_FOREVER));
        sched.mutex_unlock(m);
        sched.mutex_unlock(m);
        assert!(sched.mutex_lock(m, TIMEOUT_FOREVER));
        sched.mutex_unlock(m);
    }

    #[test]
    fn queue_send_receive_round_trips() {
        let sched = SimScheduler::new();
        let q = sched.queue_create(2, 4);
        assert!(sched.queue_send(q, b"abcd", TIMEOUT_FOREVER));
        assert_eq!(sched.queue_count(q), 1);
        let mut out = [0u8; 4];
        assert!(sched.queue_receive(q, &mut out, TIMEOUT_FOREVER));
        assert_eq!(&out, b"abcd");
    }
}
