// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel tunables.
//!
//! The original C sources gate this kind of thing behind `__OS_...__`
//! macros pulled from a generated `config.h`. We have no preprocessor, and
//! no per-board build step in this core, so the knobs live here as ordinary
//! `const`s. A concrete board port picks its own values by editing this
//! file (or, eventually, by making it a `build.rs`-generated module again).

/// Maximum number of simultaneously live processes, including `init`.
pub const MAX_PROCESSES: usize = 32;

/// Maximum number of threads a single process may spawn in addition to its
/// main thread.
pub const MAX_THREADS_PER_PROCESS: usize = 8;

/// Maximum number of simultaneously open file handles, system-wide.
pub const MAX_OPEN_FILES: usize = 64;

/// Maximum number of simultaneously open directory handles, system-wide.
pub const MAX_OPEN_DIRS: usize = 16;

/// Maximum number of mount points, including the root mount.
pub const MAX_MOUNTS: usize = 8;

/// Maximum number of registered device nodes.
pub const MAX_DEVICE_NODES: usize = 16;

/// Maximum number of named shared-memory regions live at once.
pub const MAX_SHM_REGIONS: usize = 8;

/// Maximum number of PIDs attached to a single shared-memory region.
pub const MAX_SHM_ATTACHMENTS: usize = MAX_PROCESSES;

/// Depth of the syscall request queue. A full queue causes the enqueuing
/// task to observe `ErrorKind::Busy` rather than block forever; see
/// `syscall::Dispatcher::submit`.
pub const SYSCALL_QUEUE_DEPTH: usize = 16;

/// Size, in bytes, of one FS cache block.
pub const CACHE_BLOCK_SIZE: usize = 512;

/// Maximum number of cache blocks held at once, across all devices.
pub const CACHE_MAX_BLOCKS: usize = 32;

/// Default interval, in milliseconds, between kworker-driven cache
/// write-back sweeps.
pub const CACHE_SYNC_PERIOD_MS: u64 = 5_000;

/// Size, in bytes, of the kernel log ring buffer.
pub const KLOG_SIZE: usize = 4096;

/// Maximum length of a single kernel log line, including timestamp prefix
/// and trailing newline.
pub const KLOG_MAX_LINE: usize = 256;

/// Maximum length of a path, in bytes, accepted anywhere in the VFS.
pub const MAX_PATH_LEN: usize = 128;

/// Maximum length of a name (process, device, shm region, mount-option
/// key/value), in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum number of tokens `process_create`'s argv tokenizer will produce.
pub const MAX_ARGV: usize = 16;

/// CPU-usage sampling window, per `process::Stats`, in milliseconds.
pub const CPU_USAGE_WINDOW_MS: u64 = 1_000;
