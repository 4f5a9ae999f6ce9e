// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process and thread model.
//!
//! A [`Process`] carries everything the original kernel's process struct
//! does — pid, parent, argv, cwd, std streams with their "referenced" bits,
//! a resource list, exit status — except the fields that were pointers
//! purely so C could thread a singly-linked list through them. Those
//! become a fixed-capacity table indexed by pid, which this module owns as
//! a single mutex-protected singleton ([`Processes`]), matching the rest of
//! this crate's approach to what used to be global mutable state.
//!
//! A thread shares its parent's address space, stdio and cwd by
//! definition — there is nothing to copy — so it is represented as an
//! entry in the owning `Process`'s own thread list rather than as a peer
//! table row.

use dnx_abi::{ErrorKind, Priority, ProgramDesc, Ticks, INIT_PID, KILLED_EXIT_CODE};
use heapless::{String, Vec};

use crate::config::{MAX_ARGV, MAX_NAME_LEN, MAX_PATH_LEN, MAX_PROCESSES, MAX_THREADS_PER_PROCESS};
use crate::err::{KResult, KernelError};
use crate::resource::{ResourceId, ResourceList};
use crate::sched::{Scheduler, TaskHandle};
use crate::time;

const MAX_PROCESS_RESOURCES: usize = 48;
/// Byte capacity of a NUL-terminated argument as built for a program's
/// `main`, including the terminator.
const ARG_BUF_LEN: usize = MAX_NAME_LEN + 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcKind {
    Process,
    Thread,
}

/// One end of a standard stream. `referenced` mirrors the original
/// kernel's bit distinguishing "the parent handed us its own open file" —
/// which must not be closed twice — from "we opened a fresh one for this
/// child," which this process owns outright.
#[derive(Copy, Clone, Debug)]
pub struct StdioHandle {
    pub file: ResourceId,
    pub referenced: bool,
}

#[derive(Clone)]
pub struct ThreadInfo {
    pub tid: u32,
    pub task: TaskHandle,
    pub exit_status: Option<i32>,
}

/// Attributes a caller supplies to [`Processes::create`], mirroring the
/// original attribute struct passed to `process_create`.
pub struct CreateAttrs {
    pub cwd: String<MAX_PATH_LEN>,
    pub stdin: Option<StdioHandle>,
    pub stdout: Option<StdioHandle>,
    pub stderr: Option<StdioHandle>,
    pub priority: Priority,
    pub argv: Vec<String<MAX_NAME_LEN>, MAX_ARGV>,
}

pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub kind: ProcKind,
    pub name: String<MAX_NAME_LEN>,
    pub task: TaskHandle,
    pub cwd: String<MAX_PATH_LEN>,
    pub stdin: Option<StdioHandle>,
    pub stdout: Option<StdioHandle>,
    pub stderr: Option<StdioHandle>,
    pub globals_ptr: Option<usize>,
    pub globals_len: usize,
    argv: Vec<String<MAX_NAME_LEN>, MAX_ARGV>,
    main: fn(usize, *const *const u8) -> i32,
    pub exit_status: Option<i32>,
    pub last_error: Option<ErrorKind>,
    pub resources: ResourceList<MAX_PROCESS_RESOURCES>,
    pub cpu_ticks: u64,
    pub priority: Priority,
    pub stack_words: usize,
    killed: bool,
    threads: Vec<ThreadInfo, MAX_THREADS_PER_PROCESS>,
}

/// Everything [`Processes::stats`] reports about one live process.
#[derive(Clone, Debug)]
pub struct Stats {
    pub pid: u32,
    pub ppid: u32,
    pub name: String<MAX_NAME_LEN>,
    pub priority: Priority,
    pub stack_words: usize,
    pub free_stack_words: usize,
    pub thread_count: usize,
    pub memory_usage: usize,
    pub cpu_usage_fraction: f32,
}

struct Inner {
    processes: Vec<Process, MAX_PROCESSES>,
    next_pid: u32,
}

/// The process table singleton. A concrete kernel wires one of these up at
/// boot with its chosen [`Scheduler`] and never constructs a second one.
pub struct Processes<'s> {
    scheduler: &'s dyn Scheduler,
    inner: spin::Mutex<Inner>,
}

impl<'s> Processes<'s> {
    pub fn new(scheduler: &'s dyn Scheduler) -> Self {
        Processes {
            scheduler,
            inner: spin::Mutex::new(Inner {
                processes: Vec::new(),
                next_pid: INIT_PID,
            }),
        }
    }

    /// Locates the registered program by `program.name`-already-resolved
    /// descriptor (name resolution against the program table is `app`'s
    /// job, done by the caller before this is invoked), allocates its
    /// globals blob, launches it via the startup trampoline, and inserts
    /// it into the process list. `globals` must have been obtained from
    /// the memory manager by the caller with size `program.globals_size`
    /// and purpose `Program`; ownership passes to the new process, which
    /// frees it on exit.
    pub fn create(
        &self,
        program: &ProgramDesc,
        ppid: u32,
        globals: Option<(usize, usize)>,
        attrs: CreateAttrs,
    ) -> KResult<u32> {
        let mut inner = self.inner.lock();
        if inner.processes.is_full() {
            return Err(KernelError::Recoverable(ErrorKind::NoMemory));
        }
        let pid = inner.next_pid;
        inner.next_pid += 1;

        let mut name = String::new();
        let _ = name.push_str(program.name);

        let task = self.scheduler.task_create(
            process_entry_trampoline,
            pid as usize,
            program.stack_depth,
            attrs.priority,
        );

        let process = Process {
            pid,
            ppid,
            kind: ProcKind::Process,
            name,
            task,
            cwd: attrs.cwd,
            stdin: attrs.stdin,
            stdout: attrs.stdout,
            stderr: attrs.stderr,
            globals_ptr: globals.map(|(ptr, _)| ptr),
            globals_len: globals.map(|(_, len)| len).unwrap_or(0),
            argv: attrs.argv,
            main: program.main,
            exit_status: None,
            last_error: None,
            resources: ResourceList::new(),
            cpu_ticks: 0,
            priority: attrs.priority,
            stack_words: program.stack_depth,
            killed: false,
            threads: Vec::new(),
        };
        inner
            .processes
            .push(process)
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        Ok(pid)
    }

    /// Spawns an additional thread sharing `pid`'s address space, stdio,
    /// cwd and globals. Returns the new thread's tid, which shares the pid
    /// numbering space for simplicity (the original kernel's `tid` and
    /// `pid` are both just task identifiers).
    pub fn create_thread(
        &self,
        pid: u32,
        entry: fn(usize),
        arg: usize,
        stack_words: usize,
        priority: Priority,
    ) -> KResult<u32> {
        let mut inner = self.inner.lock();
        let next_tid = inner.next_pid;
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if process.threads.is_full() {
            return Err(KernelError::Recoverable(ErrorKind::NoMemory));
        }
        let task = self.scheduler.task_create(entry, arg, stack_words, priority);
        process
            .threads
            .push(ThreadInfo {
                tid: next_tid,
                task,
                exit_status: None,
            })
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        inner.next_pid += 1;
        Ok(next_tid)
    }

    /// Blocks the caller (via `timeout_ms`-bounded polling sleeps on the
    /// scheduler) until `pid` exits or the timeout elapses, then reaps it,
    /// removing its table entry and returning its exit status. Only
    /// meaningful when called by the parent or a privileged caller — the
    /// syscall dispatcher is responsible for enforcing that before this is
    /// reached.
    pub fn wait(&self, pid: u32, timeout_ms: u32) -> KResult<i32> {
        let deadline_ticks = if timeout_ms == dnx_abi::TIMEOUT_FOREVER {
            None
        } else {
            Some(self.scheduler.tick_count().0 + time::ms_to_ticks(timeout_ms).0)
        };
        loop {
            {
                let mut inner = self.inner.lock();
                let finished = find(&inner.processes, pid)
                    .map(|p| self.scheduler.task_is_finished(p.task))
                    .unwrap_or(true);
                if finished {
                    let index = inner.processes.iter().position(|p| p.pid == pid);
                    return match index {
                        Some(index) => {
                            let process = inner.processes.swap_remove(index);
                            Ok(process.exit_status.unwrap_or(KILLED_EXIT_CODE))
                        }
                        None => Err(KernelError::Recoverable(ErrorKind::NoSuchEntry)),
                    };
                }
            }
            if let Some(deadline) = deadline_ticks {
                if self.scheduler.tick_count().0 >= deadline {
                    return Err(KernelError::Recoverable(ErrorKind::Timeout));
                }
            }
            self.scheduler.sleep_ms(1);
        }
    }

    /// As [`Processes::wait`], for a single thread of `pid`.
    pub fn join_thread(&self, pid: u32, tid: u32, timeout_ms: u32) -> KResult<i32> {
        let deadline_ticks = if timeout_ms == dnx_abi::TIMEOUT_FOREVER {
            None
        } else {
            Some(self.scheduler.tick_count().0 + time::ms_to_ticks(timeout_ms).0)
        };
        loop {
            {
                let mut inner = self.inner.lock();
                let process = find_mut(&mut inner.processes, pid)
                    .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
                let thread_index = process.threads.iter().position(|t| t.tid == tid);
                if let Some(thread_index) = thread_index {
                    if self.scheduler.task_is_finished(process.threads[thread_index].task) {
                        let thread = process.threads.swap_remove(thread_index);
                        return Ok(thread.exit_status.unwrap_or(KILLED_EXIT_CODE));
                    }
                } else {
                    return Err(KernelError::Recoverable(ErrorKind::NoSuchEntry));
                }
            }
            if let Some(deadline) = deadline_ticks {
                if self.scheduler.tick_count().0 >= deadline {
                    return Err(KernelError::Recoverable(ErrorKind::Timeout));
                }
            }
            self.scheduler.sleep_ms(1);
        }
    }

    /// Marks `pid` for termination and stops its task. The init process may
    /// not be killed. This only flips the bookkeeping fields and calls
    /// [`Scheduler::task_delete`] — it does not touch the victim's open
    /// files, IPC objects, device locks or globals blob. The caller (the
    /// syscall dispatcher's `ProcessKill` handling) is responsible for
    /// draining [`Process::resources`] via [`Processes::take_resources`]
    /// and releasing each entry, the same way a `ProcessExit` is cleaned up,
    /// so a killed process leaks nothing a clean exit wouldn't have freed.
    pub fn kill(&self, pid: u32) -> KResult<()> {
        if pid == INIT_PID {
            return Err(KernelError::Recoverable(ErrorKind::PermissionDenied));
        }
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        process.killed = true;
        process.exit_status = Some(KILLED_EXIT_CODE);
        self.scheduler.task_delete(process.task);
        Ok(())
    }

    /// Self-kill with the distinguished abort exit code.
    pub fn abort(&self, pid: u32) -> KResult<()> {
        self.record_exit(pid, KILLED_EXIT_CODE)
    }

    /// Records a natural exit status for `pid`, called by
    /// [`process_entry_trampoline`] when a program's `main` returns. Actual
    /// resource release (closing files, detaching shm, freeing memory) is
    /// driven by the caller via each resource's owning subsystem walking
    /// [`Process::resources`] before the table entry is reaped by
    /// [`Processes::wait`] — this only records the status.
    pub fn record_exit(&self, pid: u32, status: i32) -> KResult<()> {
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        process.exit_status = Some(status);
        Ok(())
    }

    /// Takes the resource list of `pid`, leaving an empty list behind —
    /// used by `process_exit`/`process_kill` handling in the syscall
    /// dispatcher to release every resource exactly once.
    pub fn take_resources(&self, pid: u32) -> KResult<ResourceList<MAX_PROCESS_RESOURCES>> {
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        Ok(core::mem::take(&mut process.resources))
    }

    /// Takes `pid`'s globals-blob pointer and length, leaving `None`/`0`
    /// behind — used alongside [`Processes::take_resources`] to free the
    /// blob exactly once via [`crate::mm::Mm::reclaim_program_memory`].
    pub fn take_globals(&self, pid: u32) -> KResult<(Option<usize>, usize)> {
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        let globals = (process.globals_ptr.take(), process.globals_len);
        process.globals_len = 0;
        Ok(globals)
    }

    pub fn link_resource(&self, pid: u32, id: ResourceId) -> KResult<()> {
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        process
            .resources
            .push(id)
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))
    }

    pub fn unlink_resource(&self, pid: u32, id: ResourceId) -> KResult<bool> {
        let mut inner = self.inner.lock();
        let process = find_mut(&mut inner.processes, pid)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        Ok(crate::resource::unlink(&mut process.resources, id))
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        find(&self.inner.lock().processes, pid).is_some()
    }

    /// Seekable iteration over the process list for the stats syscall.
    /// `start_index` lets a caller resume a partial read across multiple
    /// calls, as the original `_ps` iteration API allows.
    pub fn stats(&self, start_index: usize, out: &mut [Stats]) -> usize {
        let inner = self.inner.lock();
        let mut written = 0;
        for process in inner.processes.iter().skip(start_index) {
            if written >= out.len() {
                break;
            }
            let usage_window = time::ms_to_ticks(crate::config::CPU_USAGE_WINDOW_MS as u32).0;
            out[written] = Stats {
                pid: process.pid,
                ppid: process.ppid,
                name: process.name.clone(),
                priority: process.priority,
                stack_words: process.stack_words,
                free_stack_words: self.scheduler.task_free_stack(process.task),
                thread_count: process.threads.len() + 1,
                memory_usage: process.globals_len,
                cpu_usage_fraction: if usage_window == 0 {
                    0.0
                } else {
                    process.cpu_ticks as f32 / usage_window as f32
                },
            };
            written += 1;
        }
        written
    }

    /// Adds `ticks` to `pid`'s CPU-time counter, called from an
    /// `on_context_switch` sampling hook.
    pub fn account_cpu_ticks(&self, pid: u32, ticks: Ticks) {
        let mut inner = self.inner.lock();
        if let Some(process) = find_mut(&mut inner.processes, pid) {
            process.cpu_ticks += ticks.0;
        }
    }
}

fn find(processes: &[Process], pid: u32) -> Option<&Process> {
    processes.iter().find(|p| p.pid == pid)
}

fn find_mut(processes: &mut [Process], pid: u32) -> Option<&mut Process> {
    processes.iter_mut().find(|p| p.pid == pid)
}

/// The task entry point every process-level task launches with. It exists
/// purely to bridge the scheduler's `fn(usize)` task signature to a
/// program's `fn(argc, argv) -> i32` main, building a transient
/// NUL-terminated argv array on its own stack for the duration of the
/// call — nothing about it outlives this function.
///
/// This function reaches the process table through a process-global
/// registered with [`register_trampoline_table`] at boot, since a bare `fn`
/// pointer cannot capture state.
fn process_entry_trampoline(pid: usize) {
    TRAMPOLINE.with(|processes| {
        let (main, argv, pid_u32) = {
            let inner = processes.inner.lock();
            let process = find(&inner.processes, pid as u32)
                .expect("trampoline invoked for an unregistered pid");
            (process.main, process.argv.clone(), process.pid)
        };

        let mut bufs: Vec<[u8; ARG_BUF_LEN], MAX_ARGV> = Vec::new();
        for arg in &argv {
            let mut buf = [0u8; ARG_BUF_LEN];
            let bytes = arg.as_bytes();
            let len = bytes.len().min(ARG_BUF_LEN - 1);
            buf[..len].copy_from_slice(&bytes[..len]);
            let _ = bufs.push(buf);
        }
        let mut ptrs: Vec<*const u8, MAX_ARGV> = Vec::new();
        for buf in &bufs {
            let _ = ptrs.push(buf.as_ptr());
        }

        let status = (main)(ptrs.len(), ptrs.as_ptr());
        let _ = processes.record_exit(pid_u32, status);
    });
}

/// Global registration point for [`process_entry_trampoline`]. A kernel
/// built on top of this crate calls [`register_trampoline_table`] once at
/// boot, before launching `init`.
static TRAMPOLINE_SLOT: spin::Mutex<Option<&'static Processes<'static>>> = spin::Mutex::new(None);

struct TrampolineTable;
static TRAMPOLINE: TrampolineTable = TrampolineTable;

impl TrampolineTable {
    fn with<R>(&self, f: impl FnOnce(&'static Processes<'static>) -> R) -> R {
        let slot: Option<&'static Processes<'static>> = *TRAMPOLINE_SLOT.lock();
        let processes =
            slot.expect("process table not registered before a task started running");
        f(processes)
    }
}

/// Registers the single process table the trampoline dispatches through.
/// Must be called exactly once, before any process is created.
pub fn register_trampoline_table(processes: &'static Processes<'static>) {
    *TRAMPOLINE_SLOT.lock() = Some(processes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimScheduler;

    fn program() -> ProgramDesc {
        ProgramDesc {
            name: "init",
            globals_size: 0,
            stack_depth: 256,
            default_priority: Priority::NORMAL,
            main: |_argc, _argv| 7,
        }
    }

    fn attrs() -> CreateAttrs {
        CreateAttrs {
            cwd: String::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            priority: Priority::NORMAL,
            argv: Vec::new(),
        }
    }

    #[test]
    fn create_and_wait_reports_exit_status() {
        let sched: &'static SimScheduler = Box::leak(Box::new(SimScheduler::new()));
        let processes = Box::leak(Box::new(Processes::new(sched)));
        register_trampoline_table(processes);

        let program = program();
        let pid = processes.create(&program, INIT_PID, None, attrs()).unwrap();
        let status = processes.wait(pid, dnx_abi::TIMEOUT_FOREVER).unwrap();
        assert_eq!(status, 7);
        assert!(!processes.is_alive(pid));
    }

    #[test]
    fn kill_refuses_init() {
        let sched: &'static SimScheduler = Box::leak(Box::new(SimScheduler::new()));
        let processes = Box::leak(Box::new(Processes::new(sched)));
        assert!(processes.kill(INIT_PID).is_err());
    }

    #[test]
    fn take_globals_clears_the_blob_and_is_idempotent() {
        let sched: &'static SimScheduler = Box::leak(Box::new(SimScheduler::new()));
        let processes = Box::leak(Box::new(Processes::new(sched)));
        register_trampoline_table(processes);

        let pid = processes
            .create(&program(), INIT_PID, Some((0x1000, 64)), attrs())
            .unwrap();

        assert_eq!(processes.take_globals(pid).unwrap(), (Some(0x1000), 64));
        assert_eq!(processes.take_globals(pid).unwrap(), (None, 0));
    }
}
