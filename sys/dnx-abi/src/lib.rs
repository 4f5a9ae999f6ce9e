// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel core and the programs,
//! filesystems and modules it hosts.
//!
//! Nothing in this crate is architecture-specific. It describes the wire
//! shape of the syscall boundary and the static registration tables the
//! kernel reads at startup; `dnx-kern` is the only crate that gives these
//! types behavior.

#![no_std]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Closed error taxonomy returned by every fallible kernel operation.
///
/// This is the "names indicative, not literal" taxonomy from the error
/// handling design: every syscall that can fail returns one of these, never
/// a raw OS-specific code. `Fatal` is special: the kernel itself may use it
/// internally to mark an invariant violation, but it is never written into a
/// process's errno slot or returned across the syscall boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorKind {
    InvalidArgument = 0,
    NoMemory = 1,
    NoSuchEntry = 2,
    AlreadyExists = 3,
    Busy = 4,
    PermissionDenied = 5,
    NoSpace = 6,
    IoError = 7,
    Timeout = 8,
    Interrupted = 9,
    NotSupported = 10,
    Range = 11,
    Overflow = 12,
    NameTooLong = 13,
    BadFileDescriptor = 14,
    NotADirectory = 15,
    IsADirectory = 16,
    CrossDeviceLink = 17,
    BrokenPipe = 18,
    ConnectionReset = 19,
    ConnectionRefused = 20,
    ConnectionAborted = 21,
    NotConnected = 22,
    /// Never returned to user space. Dispatchers that observe an internal
    /// operation producing this convert it into a call to `fail::die`
    /// instead of propagating it.
    Fatal = 255,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Fatal)
    }
}

/// Budgeted category of an allocation, used by the memory manager for
/// per-purpose accounting and bulk reclamation (e.g. "free every `Program`
/// allocation this process made" at exit).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum PurposeTag {
    Kernel = 0,
    Fs = 1,
    Net = 2,
    Program = 3,
    Shared = 4,
    Cache = 5,
    Module = 6,
}

pub const PURPOSE_COUNT: usize = 7;

impl PurposeTag {
    pub const ALL: [PurposeTag; PURPOSE_COUNT] = [
        PurposeTag::Kernel,
        PurposeTag::Fs,
        PurposeTag::Net,
        PurposeTag::Program,
        PurposeTag::Shared,
        PurposeTag::Cache,
        PurposeTag::Module,
    ];

    pub fn index(self) -> usize {
        self as u8 as usize
    }
}

/// Type tag carried by the resource header of every kernel-visible object.
/// This is the Rust discriminant standing in for the original C resource
/// header's 32-bit type-tag constant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ResourceTag {
    Process = 0,
    Mutex = 1,
    Sem = 2,
    Queue = 3,
    File = 4,
    Dir = 5,
    Memory = 6,
    Socket = 7,
    Flag = 8,
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// This type deliberately does not implement `PartialOrd`/`Ord`, to keep us
/// from confusing ourselves on whether `>` means numerically greater, or
/// more important.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const NORMAL: Priority = Priority(0);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Monotonic scheduler tick count since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Ticks(pub u64);

/// In-kernel timestamp, currently measured in whole milliseconds since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Reserved value meaning "block forever" for any timeout-accepting
/// primitive in the kernel primitives facade.
pub const TIMEOUT_FOREVER: u32 = u32::MAX;

/// Exit status recorded when a process is killed rather than exiting on its
/// own. 32-bit signed, like any other exit status; this is the
/// "implementation-defined distinguished value" the external interface
/// section leaves open.
pub const KILLED_EXIT_CODE: i32 = -1;

/// The single process that may not be killed.
pub const INIT_PID: u32 = 1;

bitflags! {
    /// Flag bits a file handle carries, derived from the mode string passed
    /// to `open` plus runtime state (`eof`, `error`) set during I/O.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct OpenFlags: u32 {
        const READ              = 1 << 0;
        const WRITE             = 1 << 1;
        const CREATE             = 1 << 2;
        const TRUNCATE            = 1 << 3;
        const APPEND              = 1 << 4;
        const EOF                 = 1 << 5;
        const ERROR               = 1 << 6;
        const SEEK_MODIFIED       = 1 << 7;
        const NON_BLOCKING_READ   = 1 << 8;
        const NON_BLOCKING_WRITE  = 1 << 9;
    }
}

/// Origin for a seek operation, analogous to `std::io::SeekFrom` but
/// `no_std` and without pulling in `std`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Enumeration of syscall numbers dispatched by the kworker's function
/// table. Grouped by subsystem in the order the dispatcher's table is laid
/// out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    // Process / thread lifecycle.
    ProcessCreate = 0,
    ProcessWait = 1,
    ProcessKill = 2,
    ProcessAbort = 3,
    ProcessExit = 4,
    ProcessStat = 5,
    ThreadCreate = 6,
    ThreadJoin = 7,

    // VFS.
    Mount = 10,
    Umount = 11,
    Open = 12,
    Close = 13,
    Read = 14,
    Write = 15,
    Seek = 16,
    Opendir = 17,
    Readdir = 18,
    Closedir = 19,
    Mkdir = 20,
    Mkfifo = 21,
    Mknod = 22,
    Remove = 23,
    Rename = 24,
    Chmod = 25,
    Chown = 26,
    Stat = 27,
    Statfs = 28,

    // Driver / module registry.
    DriverInit = 30,
    DriverRelease = 31,

    // Memory.
    Malloc = 40,
    Zalloc = 41,
    Free = 42,

    // IPC-by-fd primitives (open sem/mutex/queue by fd, per the kernel
    // primitives facade).
    SemOpen = 50,
    SemWait = 51,
    SemSignal = 52,
    MutexOpen = 53,
    MutexLock = 54,
    MutexUnlock = 55,
    QueueOpen = 56,
    QueueSend = 57,
    QueueReceive = 58,

    // Shared memory.
    ShmCreate = 60,
    ShmAttach = 61,
    ShmDetach = 62,
    ShmDestroy = 63,

    // Network stack. Reserved but unimplemented: this core has no TCP/IP or
    // SIPC stack; the dispatcher routes these straight to
    // `ErrorKind::NotSupported`.
    NetSocket = 70,
    NetConnect = 71,
    NetSend = 72,
    NetRecv = 73,

    // Time.
    TimeUptime = 80,
    TimeWallClock = 81,

    // Diagnostics.
    SyslogRead = 90,
    SyslogClear = 91,
    KernelPanicInfo = 92,

    // System.
    SystemReset = 99,
    SystemShutdown = 100,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        use Sysnum::*;
        Ok(match x {
            0 => ProcessCreate,
            1 => ProcessWait,
            2 => ProcessKill,
            3 => ProcessAbort,
            4 => ProcessExit,
            5 => ProcessStat,
            6 => ThreadCreate,
            7 => ThreadJoin,
            10 => Mount,
            11 => Umount,
            12 => Open,
            13 => Close,
            14 => Read,
            15 => Write,
            16 => Seek,
            17 => Opendir,
            18 => Readdir,
            19 => Closedir,
            20 => Mkdir,
            21 => Mkfifo,
            22 => Mknod,
            23 => Remove,
            24 => Rename,
            25 => Chmod,
            26 => Chown,
            27 => Stat,
            28 => Statfs,
            30 => DriverInit,
            31 => DriverRelease,
            40 => Malloc,
            41 => Zalloc,
            42 => Free,
            50 => SemOpen,
            51 => SemWait,
            52 => SemSignal,
            53 => MutexOpen,
            54 => MutexLock,
            55 => MutexUnlock,
            56 => QueueOpen,
            57 => QueueSend,
            58 => QueueReceive,
            60 => ShmCreate,
            61 => ShmAttach,
            62 => ShmDetach,
            63 => ShmDestroy,
            70 => NetSocket,
            71 => NetConnect,
            72 => NetSend,
            73 => NetRecv,
            80 => TimeUptime,
            81 => TimeWallClock,
            90 => SyslogRead,
            91 => SyslogClear,
            92 => KernelPanicInfo,
            99 => SystemReset,
            100 => SystemShutdown,
            _ => return Err(()),
        })
    }
}

/// Record describing one program in the static program table: `{name,
/// globals-size, stack-depth, main}`. The process spawner resolves
/// `argv[0]` against this table by name.
pub struct ProgramDesc {
    pub name: &'static str,
    /// Size in bytes of the `.bss`-like globals blob allocated at spawn.
    pub globals_size: usize,
    pub stack_depth: usize,
    pub default_priority: Priority,
    pub main: fn(argc: usize, argv: *const *const u8) -> i32,
}

/// Magic number a filesystem registration must report back so `mount` can
/// tell it is looking at a real registration and not uninitialized memory.
pub const FS_REGISTRATION_MAGIC: u32 = 0x00F5_0001;

/// Entry in the static filesystem registration table: `{name, vtable,
/// magic}`. The `vtable` half lives in `dnx-kern` (it is a `&'static dyn
/// FsDriver`, and `dyn` trait objects cannot be named from this `no_std`,
/// dependency-free crate), so this struct only carries the name and magic;
/// `dnx_kern::app` pairs each one with its driver object.
#[derive(Copy, Clone, Debug)]
pub struct FsRegistration {
    pub name: &'static str,
    pub magic: u32,
}

/// Entry in the static module registration table: `{name}` (the vtable
/// again lives in `dnx-kern`, see `FsRegistration`).
#[derive(Copy, Clone, Debug)]
pub struct ModuleRegistration {
    pub name: &'static str,
}

/// Major/minor pair identifying a device node, analogous to a Unix device
/// number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceNumber {
    pub major: u16,
    pub minor: u16,
}

/// Entry in the default device node table: `{driver-name, module-name,
/// major, minor}`.
#[derive(Copy, Clone, Debug)]
pub struct DeviceNodeDesc {
    pub node_path: &'static str,
    pub module_name: &'static str,
    pub device: DeviceNumber,
}

/// Optional MPU region guard, attached to a process descriptor when address
/// space isolation beyond the default is desired. Unused by VFS/MM logic;
/// validated at process-creation time when present. This is the "optional
/// MPU region guard" the purpose/scope non-goals explicitly allow.
#[derive(Copy, Clone, Debug)]
pub struct RegionDesc {
    pub base: u32,
    pub size: u32,
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    pub fn contains(&self, addr: usize) -> bool {
        let addr = addr as u32;
        addr >= self.base && addr.wrapping_sub(self.base) < self.size
    }

    pub fn end_addr(&self) -> u32 {
        self.base.wrapping_add(self.size)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default)]
    pub struct RegionAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DEVICE = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn priority_ordering() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(0)));
    }

    #[test]
    fn sysnum_round_trips() {
        for raw in [0u32, 1, 14, 63, 92, 100] {
            let sysnum = Sysnum::try_from(raw).expect("known syscall number");
            assert_eq!(sysnum as u32, raw);
        }
        assert!(Sysnum::try_from(9999).is_err());
    }

    #[test]
    fn region_contains_is_half_open() {
        let region = RegionDesc {
            base: 0x1000,
            size: 0x100,
            attributes: RegionAttributes::READ,
        };
        assert!(region.contains(0x1000));
        assert!(region.contains(0x10FF));
        assert!(!region.contains(0x1100));
    }
}
