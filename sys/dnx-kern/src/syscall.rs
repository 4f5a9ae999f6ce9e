// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The syscall boundary: a bounded request queue, a single-threaded
//! dispatch loop, and the function table every syscall number resolves
//! into.
//!
//! The original kernel passes a `{client-process pointer, tid, syscall
//! number, argument cursor, completion semaphore, return slot}` record by
//! pointer through the queue — the caller allocates it on its own stack.
//! Here the record's mutable half (request/response) lives in a
//! fixed-capacity slot table instead of on an arbitrary stack frame (this
//! crate has no way to name "the caller's stack" generically), and only the
//! slot's *index* travels through the queue; the completion semaphore stays
//! exactly where the original put it, on the caller's own stack, inside
//! [`Dispatcher::submit_and_wait`]. The function table is the match
//! statement in [`Dispatcher::dispatch`] — a calling convention Rust's enum
//! exhaustiveness check enforces completeness over, where the original
//! relied on an array sized to the highest syscall number.

use heapless::{String, Vec};

use dnx_abi::{DeviceNumber, ErrorKind, OpenFlags, Priority, SeekFrom, Sysnum, Ticks};

use crate::app::{FsRegistry, ProgramRegistry};
use crate::cache::Cache;
use crate::config::{
    CACHE_SYNC_PERIOD_MS, MAX_ARGV, MAX_NAME_LEN, MAX_PATH_LEN, SYSCALL_QUEUE_DEPTH,
};
use crate::driver::Registry as DriverRegistry;
use crate::err::{KResult, KernelError};
use crate::mm::Mm;
use crate::panic;
use crate::primitives::{self, Primitives};
use crate::process::{CreateAttrs, Processes, Stats};
use crate::resource::{ResourceId, Slab};
use crate::sched::{MutexHandle, QueueHandle, Scheduler, SemHandle};
use crate::shm::Shm;
use crate::vfs::{DirEntry, FsStat, Stat, Vfs};

const MAX_IPC_OBJECTS: usize = 8;
const SYSCALL_IO_CHUNK: usize = 256;
const PROCESS_STAT_PAGE: usize = 8;

/// Converts a raw syscall number off the wire into a typed [`Sysnum`],
/// rejecting anything outside the registered range. The original ABI's
/// "syscall number is in range" check.
pub fn decode_sysnum(raw: u32) -> KResult<Sysnum> {
    Sysnum::try_from(raw).map_err(|_| KernelError::Recoverable(ErrorKind::InvalidArgument))
}

/// A fully-decoded syscall request. One variant per [`Sysnum`]; the
/// network syscalls are folded into [`SyscallRequest::Unsupported`] since
/// this core ships no TCP/IP or SIPC stack.
pub enum SyscallRequest {
    ProcessCreate {
        program_name: String<MAX_NAME_LEN>,
        cwd: String<MAX_PATH_LEN>,
        priority: Priority,
        argv: Vec<String<MAX_NAME_LEN>, MAX_ARGV>,
    },
    ProcessWait { pid: u32, timeout_ticks: u32 },
    ProcessKill { pid: u32 },
    ProcessAbort { pid: u32 },
    ProcessExit { status: i32 },
    ProcessStat { start_index: usize },
    ThreadJoin { pid: u32, tid: u32, timeout_ticks: u32 },

    Mount {
        fs_name: String<MAX_NAME_LEN>,
        source: String<MAX_PATH_LEN>,
        mount_point: String<MAX_PATH_LEN>,
        options: String<MAX_PATH_LEN>,
    },
    Umount { mount_point: String<MAX_PATH_LEN> },
    Open { path: String<MAX_PATH_LEN>, flags: OpenFlags },
    Close { file: ResourceId },
    Read { file: ResourceId, len: u16 },
    Write { file: ResourceId, data: Vec<u8, SYSCALL_IO_CHUNK> },
    Seek { file: ResourceId, from: SeekFrom },
    Opendir { path: String<MAX_PATH_LEN> },
    Readdir { dir: ResourceId },
    Closedir { dir: ResourceId },
    Mkdir { path: String<MAX_PATH_LEN> },
    Mkfifo { path: String<MAX_PATH_LEN> },
    Mknod { path: String<MAX_PATH_LEN>, device: DeviceNumber },
    Remove { path: String<MAX_PATH_LEN> },
    Rename { old_path: String<MAX_PATH_LEN>, new_path: String<MAX_PATH_LEN> },
    Chmod { path: String<MAX_PATH_LEN>, mode: u32 },
    Chown { path: String<MAX_PATH_LEN>, uid: u32, gid: u32 },
    Stat { path: String<MAX_PATH_LEN> },
    Statfs { path: String<MAX_PATH_LEN> },

    DriverInit {
        module_name: String<MAX_NAME_LEN>,
        major: u16,
        minor: u16,
        node_path: String<MAX_PATH_LEN>,
        config: String<MAX_PATH_LEN>,
    },
    DriverRelease { node_path: String<MAX_PATH_LEN> },

    Malloc { size: usize },
    Zalloc { size: usize },
    Free { ptr: usize },

    SemOpen { max: u32, initial: u32 },
    SemWait { sem: ResourceId, timeout_ticks: u32 },
    SemSignal { sem: ResourceId },
    MutexOpen { recursive: bool },
    MutexLock { mutex: ResourceId, timeout_ticks: u32 },
    MutexUnlock { mutex: ResourceId },
    QueueOpen { length: usize, item_size: usize },
    QueueSend { queue: ResourceId, item: Vec<u8, SYSCALL_IO_CHUNK>, timeout_ticks: u32 },
    QueueReceive { queue: ResourceId, item_size: usize, timeout_ticks: u32 },

    ShmCreate { name: String<MAX_NAME_LEN>, size: usize },
    ShmAttach { name: String<MAX_NAME_LEN> },
    ShmDetach { name: String<MAX_NAME_LEN> },
    ShmDestroy { name: String<MAX_NAME_LEN> },

    TimeUptime,

    SyslogRead { len: u16 },
    SyslogClear,
    KernelPanicInfo,

    SystemReset,
    SystemShutdown,

    /// Network stack and anything else this core never implements.
    Unsupported,
}

pub enum SyscallResponse {
    Unit,
    Pid(u32),
    ExitStatus(i32),
    ProcessStats(Vec<Stats, PROCESS_STAT_PAGE>),
    Opened(ResourceId),
    BytesRead(Vec<u8, SYSCALL_IO_CHUNK>),
    BytesWritten(usize),
    Position(u64),
    DirEntry(Option<DirEntry>),
    FileStat(Stat),
    FilesystemStat(FsStat),
    DeviceNumber(DeviceNumber),
    Ptr(usize),
    ShmView { base: usize, size: usize },
    Uptime(Ticks),
    LogBytes(Vec<u8, SYSCALL_IO_CHUNK>),
    PanicInfo(Option<panic::PanicReport>),
}

struct Slot {
    client_pid: u32,
    tid: u32,
    request: Option<SyscallRequest>,
    response: Option<KResult<SyscallResponse>>,
    sem_handle: SemHandle,
}

/// The syscall dispatcher singleton: the request queue plus every
/// subsystem the function table reaches into.
pub struct Dispatcher<'k> {
    scheduler: &'k dyn Scheduler,
    primitives: Primitives<'k>,
    processes: &'k Processes<'k>,
    vfs: &'k Vfs,
    driver: &'k DriverRegistry,
    mm: &'k Mm<'k>,
    shm: &'k Shm<'k, 'k>,
    cache: &'k Cache<'k>,
    klog: &'k crate::klog::KernelLog<'k>,
    programs: &'k ProgramRegistry,
    filesystems: &'k FsRegistry,
    order: primitives::Queue<'k>,
    slots: spin::Mutex<Vec<Option<Slot>, SYSCALL_QUEUE_DEPTH>>,
    sems: spin::Mutex<Slab<SemHandle, MAX_IPC_OBJECTS>>,
    mutexes: spin::Mutex<Slab<MutexHandle, MAX_IPC_OBJECTS>>,
    queues: spin::Mutex<Slab<(QueueHandle, usize), MAX_IPC_OBJECTS>>,
    last_sync_ms: spin::Mutex<u64>,
}

#[allow(clippy::too_many_arguments)]
impl<'k> Dispatcher<'k> {
    pub fn new(
        scheduler: &'k dyn Scheduler,
        processes: &'k Processes<'k>,
        vfs: &'k Vfs,
        driver: &'k DriverRegistry,
        mm: &'k Mm<'k>,
        shm: &'k Shm<'k, 'k>,
        cache: &'k Cache<'k>,
        klog: &'k crate::klog::KernelLog<'k>,
        programs: &'k ProgramRegistry,
        filesystems: &'k FsRegistry,
    ) -> Self {
        let primitives = Primitives::new(scheduler);
        let order = primitives.create_queue(SYSCALL_QUEUE_DEPTH, 4);
        let mut slots = Vec::new();
        for _ in 0..SYSCALL_QUEUE_DEPTH {
            let _ = slots.push(None);
        }
        Dispatcher {
            scheduler,
            primitives,
            processes,
            vfs,
            driver,
            mm,
            shm,
            cache,
            klog,
            programs,
            filesystems,
            order,
            slots: spin::Mutex::new(slots),
            sems: spin::Mutex::new(Slab::new(dnx_abi::ResourceTag::Sem)),
            mutexes: spin::Mutex::new(Slab::new(dnx_abi::ResourceTag::Mutex)),
            queues: spin::Mutex::new(Slab::new(dnx_abi::ResourceTag::Queue)),
            last_sync_ms: spin::Mutex::new(0),
        }
    }

    /// The user-side stub: reserves a slot, enqueues its index, and blocks
    /// on a semaphore that lives on this call's own stack frame until the
    /// kworker signals completion.
    pub fn submit_and_wait(
        &self,
        client_pid: u32,
        tid: u32,
        request: SyscallRequest,
    ) -> KResult<SyscallResponse> {
        let sem = self.primitives.create_semaphore(1, 0);
        let index = {
            let mut slots = self.slots.lock();
            let idx = slots
                .iter()
                .position(Option::is_none)
                .ok_or(KernelError::Recoverable(ErrorKind::Busy))?;
            slots[idx] = Some(Slot {
                client_pid,
                tid,
                request: Some(request),
                response: None,
                sem_handle: sem.handle(),
            });
            idx
        };

        if !self.order.send(&(index as u32).to_le_bytes(), primitives::FOREVER) {
            self.slots.lock()[index] = None;
            return Err(KernelError::Recoverable(ErrorKind::Busy));
        }

        sem.wait(primitives::FOREVER);

        let mut slots = self.slots.lock();
        let slot = slots[index]
            .take()
            .expect("kworker leaves the slot populated until the client reclaims it");
        slot.response
            .expect("kworker always writes a response before signaling")
    }

    /// The kworker body: receives one queued slot index (if any within
    /// `timeout_ms`), validates and dispatches it, writes the response, and
    /// signals the waiting caller. Returns whether a request was serviced.
    pub fn service_one(&self, timeout_ms: u32) -> bool {
        let mut buf = [0u8; 4];
        if !self.order.receive(&mut buf, timeout_ms) {
            return false;
        }
        let index = u32::from_le_bytes(buf) as usize;

        let (client_pid, tid, request, sem_handle) = {
            let mut slots = self.slots.lock();
            let slot = slots[index]
                .as_mut()
                .expect("queued index always names a live slot");
            let request = slot
                .request
                .take()
                .expect("a slot is only queued once, with its request still present");
            (slot.client_pid, slot.tid, request, slot.sem_handle)
        };

        let outcome = self.validate_and_dispatch(client_pid, tid, request);

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots[index].as_mut() {
                slot.response = Some(outcome);
            }
        }
        self.scheduler.sem_signal(sem_handle);
        true
    }

    /// Runs the kworker loop: services requests as they arrive and, every
    /// `CACHE_SYNC_PERIOD_MS`, writes back dirty cache blocks. Never
    /// returns; a concrete kernel spawns this as the kworker task.
    pub fn run_forever(&self) -> ! {
        loop {
            self.service_one(CACHE_SYNC_PERIOD_MS as u32);
            self.maybe_sync_cache();
        }
    }

    fn maybe_sync_cache(&self) {
        let now = self.primitives.tick_count().0;
        let mut last = self.last_sync_ms.lock();
        let now_ms = crate::time::ticks_to_ms(Ticks(now));
        if now_ms.saturating_sub(*last) >= CACHE_SYNC_PERIOD_MS as u64 {
            let written = self.cache.sync();
            if written > 0 {
                self.log("cache: synced dirty blocks back to storage");
            }
            *last = now_ms;
        }
    }

    /// Appends one line to the kernel log, timestamped with the current
    /// uptime. The one call path through which MM, cache and dispatch
    /// events reach [`crate::klog::KernelLog`].
    fn log(&self, message: &str) {
        let ms = crate::time::ticks_to_ms(self.primitives.tick_count());
        self.klog.write_line(ms, message);
    }

    /// Releases everything `pid` could still be holding: its open files and
    /// directories, its semaphores/mutexes/queues, any device lock, and its
    /// globals blob. Shared by `process_exit` and `process_kill` so a
    /// process that dies abnormally leaks nothing a clean exit wouldn't
    /// have freed either.
    fn cleanup_process(&self, pid: u32) -> KResult<()> {
        self.shm.detach_all(pid);

        let resources = self.processes.take_resources(pid)?;
        for id in resources {
            match id.tag {
                dnx_abi::ResourceTag::File => {
                    let _ = self.vfs.close(id, true);
                }
                dnx_abi::ResourceTag::Dir => {
                    let _ = self.vfs.closedir(id, true);
                }
                dnx_abi::ResourceTag::Sem => {
                    if let Some(handle) = self.sems.lock().remove(id) {
                        self.scheduler.sem_delete(handle);
                    }
                }
                dnx_abi::ResourceTag::Mutex => {
                    if let Some(handle) = self.mutexes.lock().remove(id) {
                        self.scheduler.mutex_delete(handle);
                    }
                }
                dnx_abi::ResourceTag::Queue => {
                    if let Some((handle, _)) = self.queues.lock().remove(id) {
                        self.scheduler.queue_delete(handle);
                    }
                }
                dnx_abi::ResourceTag::Process
                | dnx_abi::ResourceTag::Memory
                | dnx_abi::ResourceTag::Socket
                | dnx_abi::ResourceTag::Flag => {}
            }
        }

        self.driver.unlock_all_owned_by(pid);

        let (globals_ptr, globals_len) = self.processes.take_globals(pid)?;
        if let Some(ptr) = globals_ptr {
            if globals_len > 0 {
                self.mm.reclaim_program_memory(&[ptr as *mut u8]);
            }
        }

        self.log("process exited, resources reclaimed");
        Ok(())
    }

    /// Confirms the client process is still a live entry in the process
    /// table before dispatching anything on its behalf. A syscall arriving
    /// for a process that is not live means the submission path itself is
    /// broken — not something a process caused — so it is fatal.
    fn validate_and_dispatch(
        &self,
        client_pid: u32,
        tid: u32,
        request: SyscallRequest,
    ) -> KResult<SyscallResponse> {
        if !self.processes.is_alive(client_pid) {
            return Err(KernelError::Fatal(
                "syscall dispatch: client process is not live",
            ));
        }
        match self.dispatch(client_pid, tid, request) {
            Ok(response) => Ok(response),
            Err(KernelError::Fatal(msg)) => {
                self.log(msg);
                panic::die(msg)
            }
            Err(err) => Err(err),
        }
    }

    fn dispatch(&self, client_pid: u32, tid: u32, request: SyscallRequest) -> KResult<SyscallResponse> {
        use SyscallRequest as Req;
        use SyscallResponse as Res;
        match request {
            Req::ProcessCreate { program_name, cwd, priority, argv } => {
                let program = self
                    .programs
                    .find(&program_name)
                    .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
                let globals = if program.globals_size > 0 {
                    Some((
                        self.mm
                            .kzalloc(dnx_abi::PurposeTag::Program, program.globals_size, None)?
                            as usize,
                        program.globals_size,
                    ))
                } else {
                    None
                };
                let pid = self.processes.create(
                    program,
                    client_pid,
                    globals,
                    CreateAttrs { cwd, stdin: None, stdout: None, stderr: None, priority, argv },
                )?;
                Ok(Res::Pid(pid))
            }
            Req::ProcessWait { pid, timeout_ticks } => {
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                let status = self.processes.wait(pid, timeout_ms)?;
                Ok(Res::ExitStatus(status))
            }
            Req::ProcessKill { pid } => {
                self.processes.kill(pid)?;
                self.cleanup_process(pid)?;
                Ok(Res::Unit)
            }
            Req::ProcessAbort { pid } => {
                self.processes.abort(pid)?;
                self.cleanup_process(pid)?;
                Ok(Res::Unit)
            }
            Req::ProcessExit { status } => {
                self.cleanup_process(client_pid)?;
                self.processes.record_exit(client_pid, status)?;
                Ok(Res::Unit)
            }
            Req::ProcessStat { start_index } => {
                let mut page: Vec<Stats, PROCESS_STAT_PAGE> = Vec::new();
                let mut buf = [
                    stats_placeholder(), stats_placeholder(), stats_placeholder(), stats_placeholder(),
                    stats_placeholder(), stats_placeholder(), stats_placeholder(), stats_placeholder(),
                ];
                let n = self.processes.stats(start_index, &mut buf);
                for stat in buf.into_iter().take(n) {
                    let _ = page.push(stat);
                }
                Ok(Res::ProcessStats(page))
            }
            Req::ThreadJoin { pid, tid: joined_tid, timeout_ticks } => {
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                let status = self.processes.join_thread(pid, joined_tid, timeout_ms)?;
                Ok(Res::ExitStatus(status))
            }

            Req::Mount { fs_name, source, mount_point, options } => {
                let fs = self.filesystems.find(&fs_name)?;
                self.vfs.mount(fs, &source, &mount_point, &options)?;
                Ok(Res::Unit)
            }
            Req::Umount { mount_point } => {
                self.vfs.unmount(&mount_point)?;
                Ok(Res::Unit)
            }
            Req::Open { path, flags } => {
                let id = self.vfs.open(&path, flags)?;
                self.processes.link_resource(client_pid, id)?;
                Ok(Res::Opened(id))
            }
            Req::Close { file } => {
                self.vfs.close(file, false)?;
                self.processes.unlink_resource(client_pid, file)?;
                Ok(Res::Unit)
            }
            Req::Read { file, len } => {
                let mut buf = [0u8; SYSCALL_IO_CHUNK];
                let take = (len as usize).min(SYSCALL_IO_CHUNK);
                let n = self.vfs.read(file, &mut buf[..take])?;
                let mut out: Vec<u8, SYSCALL_IO_CHUNK> = Vec::new();
                let _ = out.extend_from_slice(&buf[..n]);
                Ok(Res::BytesRead(out))
            }
            Req::Write { file, data } => {
                let n = self.vfs.write(file, &data)?;
                Ok(Res::BytesWritten(n))
            }
            Req::Seek { file, from } => Ok(Res::Position(self.vfs.seek(file, from)?)),
            Req::Opendir { path } => {
                let id = self.vfs.opendir(&path)?;
                self.processes.link_resource(client_pid, id)?;
                Ok(Res::Opened(id))
            }
            Req::Readdir { dir } => Ok(Res::DirEntry(self.vfs.readdir(dir)?)),
            Req::Closedir { dir } => {
                self.vfs.closedir(dir, false)?;
                self.processes.unlink_resource(client_pid, dir)?;
                Ok(Res::Unit)
            }
            Req::Mkdir { path } => {
                self.vfs.mkdir(&path)?;
                Ok(Res::Unit)
            }
            Req::Mkfifo { path } => {
                self.vfs.mkfifo(&path)?;
                Ok(Res::Unit)
            }
            Req::Mknod { path, device } => {
                self.vfs.mknod(&path, device)?;
                Ok(Res::Unit)
            }
            Req::Remove { path } => {
                self.vfs.remove(&path)?;
                Ok(Res::Unit)
            }
            Req::Rename { old_path, new_path } => {
                self.vfs.rename(&old_path, &new_path)?;
                Ok(Res::Unit)
            }
            Req::Chmod { path, mode } => {
                self.vfs.chmod(&path, mode)?;
                Ok(Res::Unit)
            }
            Req::Chown { path, uid, gid } => {
                self.vfs.chown(&path, uid, gid)?;
                Ok(Res::Unit)
            }
            Req::Stat { path } => Ok(Res::FileStat(self.vfs.stat(&path)?)),
            Req::Statfs { path } => Ok(Res::FilesystemStat(self.vfs.statfs(&path)?)),

            Req::DriverInit { module_name, major, minor, node_path, config } => {
                let device = self
                    .driver
                    .driver_init(&module_name, major, minor, &node_path, &config)?;
                Ok(Res::DeviceNumber(device))
            }
            Req::DriverRelease { node_path } => {
                self.driver.driver_release(&node_path)?;
                Ok(Res::Unit)
            }

            Req::Malloc { size } => match self.mm.kalloc(dnx_abi::PurposeTag::Program, size, None) {
                Ok(ptr) => Ok(Res::Ptr(ptr as usize)),
                Err(err) => {
                    self.log("malloc: region exhausted");
                    Err(err)
                }
            },
            Req::Zalloc { size } => match self.mm.kzalloc(dnx_abi::PurposeTag::Program, size, None) {
                Ok(ptr) => Ok(Res::Ptr(ptr as usize)),
                Err(err) => {
                    self.log("zalloc: region exhausted");
                    Err(err)
                }
            },
            Req::Free { ptr } => {
                self.mm.kfree(dnx_abi::PurposeTag::Program, ptr as *mut u8, None)?;
                Ok(Res::Unit)
            }

            Req::SemOpen { max, initial } => {
                let handle = self.scheduler.sem_create(max, initial);
                let id = self
                    .sems
                    .lock()
                    .insert(handle)
                    .ok_or(KernelError::Recoverable(ErrorKind::NoMemory))?;
                self.processes.link_resource(client_pid, id)?;
                Ok(Res::Opened(id))
            }
            Req::SemWait { sem, timeout_ticks } => {
                let handle = *self
                    .sems
                    .lock()
                    .get(sem)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                if self.scheduler.sem_wait(handle, timeout_ms) {
                    Ok(Res::Unit)
                } else {
                    Err(KernelError::Recoverable(ErrorKind::Timeout))
                }
            }
            Req::SemSignal { sem } => {
                let handle = *self
                    .sems
                    .lock()
                    .get(sem)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
                self.scheduler.sem_signal(handle);
                Ok(Res::Unit)
            }
            Req::MutexOpen { recursive } => {
                let handle = self.scheduler.mutex_create(recursive);
                let id = self
                    .mutexes
                    .lock()
                    .insert(handle)
                    .ok_or(KernelError::Recoverable(ErrorKind::NoMemory))?;
                self.processes.link_resource(client_pid, id)?;
                Ok(Res::Opened(id))
            }
            Req::MutexLock { mutex, timeout_ticks } => {
                let handle = *self
                    .mutexes
                    .lock()
                    .get(mutex)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                if self.scheduler.mutex_lock(handle, timeout_ms) {
                    Ok(Res::Unit)
                } else {
                    Err(KernelError::Recoverable(ErrorKind::Timeout))
                }
            }
            Req::MutexUnlock { mutex } => {
                let handle = *self
                    .mutexes
                    .lock()
                    .get(mutex)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
                self.scheduler.mutex_unlock(handle);
                Ok(Res::Unit)
            }
            Req::QueueOpen { length, item_size } => {
                let handle = self.scheduler.queue_create(length, item_size);
                let id = self
                    .queues
                    .lock()
                    .insert((handle, item_size))
                    .ok_or(KernelError::Recoverable(ErrorKind::NoMemory))?;
                self.processes.link_resource(client_pid, id)?;
                Ok(Res::Opened(id))
            }
            Req::QueueSend { queue, item, timeout_ticks } => {
                let handle = self
                    .queues
                    .lock()
                    .get(queue)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?
                    .0;
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                if self.scheduler.queue_send(handle, &item, timeout_ms) {
                    Ok(Res::Unit)
                } else {
                    Err(KernelError::Recoverable(ErrorKind::Timeout))
                }
            }
            Req::QueueReceive { queue, item_size, timeout_ticks } => {
                let handle = self
                    .queues
                    .lock()
                    .get(queue)
                    .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?
                    .0;
                let mut buf = [0u8; SYSCALL_IO_CHUNK];
                let take = item_size.min(SYSCALL_IO_CHUNK);
                let timeout_ms = crate::time::ticks_to_ms(Ticks(timeout_ticks as u64)) as u32;
                if self.scheduler.queue_receive(handle, &mut buf[..take], timeout_ms) {
                    let mut out: Vec<u8, SYSCALL_IO_CHUNK> = Vec::new();
                    let _ = out.extend_from_slice(&buf[..take]);
                    Ok(Res::BytesRead(out))
                } else {
                    Err(KernelError::Recoverable(ErrorKind::Timeout))
                }
            }

            Req::ShmCreate { name, size } => {
                self.shm.create(&name, size)?;
                Ok(Res::Unit)
            }
            Req::ShmAttach { name } => {
                let (base, size) = self.shm.attach(&name, client_pid)?;
                Ok(Res::ShmView { base: base as usize, size })
            }
            Req::ShmDetach { name } => {
                self.shm.detach(&name, client_pid)?;
                Ok(Res::Unit)
            }
            Req::ShmDestroy { name } => {
                self.shm.destroy(&name)?;
                Ok(Res::Unit)
            }

            Req::TimeUptime => Ok(Res::Uptime(self.primitives.tick_count())),

            Req::SyslogRead { len } => {
                let mut buf = [0u8; SYSCALL_IO_CHUNK];
                let take = (len as usize).min(SYSCALL_IO_CHUNK);
                let n = self.klog.read(&mut buf[..take]);
                let mut out: Vec<u8, SYSCALL_IO_CHUNK> = Vec::new();
                let _ = out.extend_from_slice(&buf[..n]);
                Ok(Res::LogBytes(out))
            }
            Req::SyslogClear => {
                self.klog.clear();
                Ok(Res::Unit)
            }
            Req::KernelPanicInfo => Ok(Res::PanicInfo(panic::last_panic())),

            Req::SystemReset | Req::SystemShutdown => {
                let _ = tid;
                Err(KernelError::Recoverable(ErrorKind::NotSupported))
            }

            Req::Unsupported => Err(KernelError::Recoverable(ErrorKind::NotSupported)),
        }
    }
}

fn stats_placeholder() -> Stats {
    Stats {
        pid: 0,
        ppid: 0,
        name: String::new(),
        priority: Priority::NORMAL,
        stack_words: 0,
        free_stack_words: 0,
        thread_count: 0,
        memory_usage: 0,
        cpu_usage_fraction: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimScheduler;
    use crate::driver::ModuleEntry;
    use crate::mm::Region;
    use crate::vfs::FsDriver;
    use dnx_abi::ProgramDesc;

    struct NullFs;
    impl FsDriver for NullFs {
        fn init(&self, _source: &str, _options: &str) -> KResult<u32> { Ok(0) }
        fn release(&self, _handle: u32) -> KResult<()> { Ok(()) }
        fn open(&self, _handle: u32, _path: &str, _flags: OpenFlags) -> KResult<u32> { Ok(0) }
        fn close(&self, _handle: u32, _file: u32) -> KResult<()> { Ok(()) }
        fn read(&self, _handle: u32, _file: u32, _pos: u64, _buf: &mut [u8]) -> KResult<usize> { Ok(0) }
        fn write(&self, _handle: u32, _file: u32, _pos: u64, buf: &[u8]) -> KResult<usize> { Ok(buf.len()) }
        fn ioctl(&self, _handle: u32, _file: u32, _request: u32, _arg: usize) -> KResult<usize> { Ok(0) }
        fn fstat(&self, _handle: u32, _file: u32) -> KResult<Stat> { Ok(Stat::default()) }
        fn flush(&self, _handle: u32, _file: u32) -> KResult<()> { Ok(()) }
        fn mknod(&self, _handle: u32, _path: &str, _device: DeviceNumber) -> KResult<()> { Ok(()) }
        fn sync(&self, _handle: u32) -> KResult<()> { Ok(()) }
        fn opendir(&self, _handle: u32, _path: &str) -> KResult<u32> { Ok(0) }
        fn closedir(&self, _handle: u32, _dir: u32) -> KResult<()> { Ok(()) }
        fn readdir(&self, _handle: u32, _dir: u32, _index: usize) -> KResult<Option<DirEntry>> { Ok(None) }
    }

    struct NullBackend;
    impl crate::cache::BlockBackend for NullBackend {
        fn read_block(&self, _dev_id: u32, _block_index: u32, _buf: &mut [u8; crate::config::CACHE_BLOCK_SIZE]) -> KResult<()> { Ok(()) }
        fn write_block(&self, _dev_id: u32, _block_index: u32, _buf: &[u8; crate::config::CACHE_BLOCK_SIZE]) -> KResult<()> { Ok(()) }
    }

    static NULL_FS: NullFs = NullFs;
    static MODULES: [ModuleEntry; 0] = [];
    static INIT_PROGRAM: ProgramDesc = ProgramDesc {
        name: "init",
        globals_size: 0,
        stack_depth: 4096,
        default_priority: Priority::NORMAL,
        main: |_argc, _argv| 0,
    };

    fn backing(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn time_uptime_round_trips_through_the_queue() {
        let scheduler: &'static SimScheduler = Box::leak(Box::new(SimScheduler::new()));
        let processes: &'static Processes<'static> = Box::leak(Box::new(Processes::new(scheduler)));
        crate::process::register_trampoline_table(processes);
        let vfs: &'static Vfs = Box::leak(Box::new(Vfs::new()));
        let driver: &'static DriverRegistry = Box::leak(Box::new(DriverRegistry::new(&MODULES)));
        let bytes = backing(4096);
        let region = Region::new("heap", bytes.as_mut_ptr() as usize, bytes.len());
        let regions: &'static [Region] = Box::leak(vec![region].into_boxed_slice());
        let mm: &'static Mm<'static> = Box::leak(Box::new(Mm::new(regions)));
        let shm: &'static Shm<'static, 'static> = Box::leak(Box::new(Shm::new(mm)));
        let backend: &'static NullBackend = Box::leak(Box::new(NullBackend));
        let cache: &'static Cache<'static> = Box::leak(Box::new(Cache::new(backend)));
        let klog_backing = backing(256);
        let klog: &'static crate::klog::KernelLog<'static> =
            Box::leak(Box::new(crate::klog::KernelLog::new(klog_backing)));
        let programs: &'static ProgramRegistry = Box::leak(Box::new(ProgramRegistry::new()));
        programs.register(&INIT_PROGRAM).unwrap();
        let filesystems: &'static FsRegistry = Box::leak(Box::new(FsRegistry::new()));
        filesystems
            .register("null", dnx_abi::FS_REGISTRATION_MAGIC, &NULL_FS)
            .unwrap();

        let dispatcher: &'static Dispatcher<'static> = Box::leak(Box::new(Dispatcher::new(
            scheduler, processes, vfs, driver, mm, shm, cache, klog, programs, filesystems,
        )));

        let pid = processes
            .create(
                &INIT_PROGRAM,
                dnx_abi::INIT_PID,
                None,
                CreateAttrs {
                    cwd: String::new(),
                    stdin: None,
                    stdout: None,
                    stderr: None,
                    priority: Priority::NORMAL,
                    argv: Vec::new(),
                },
            )
            .unwrap();

        let worker_dispatcher = dispatcher;
        std::thread::spawn(move || {
            worker_dispatcher.service_one(5_000);
        });

        let response = dispatcher
            .submit_and_wait(pid, 0, SyscallRequest::TimeUptime)
            .unwrap();
        assert!(matches!(response, SyscallResponse::Uptime(_)));
    }

    #[test]
    fn decode_sysnum_rejects_out_of_range_numbers() {
        assert!(decode_sysnum(Sysnum::TimeUptime as u32).is_ok());
        assert!(decode_sysnum(0xFFFF_FFFF).is_err());
    }
}
