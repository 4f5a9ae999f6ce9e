// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static registration tables: programs, filesystems, and the pairing of
//! `dnx_abi`'s name-only registration records with the `&'static dyn`
//! vtables that live in this crate.
//!
//! `dnx_abi::FsRegistration`/`ModuleRegistration` can only carry a name (and
//! for filesystems, a magic number) because that crate is `dyn`-free by
//! design; a board integration pairs each one with its actual
//! [`crate::vfs::FsDriver`]/[`crate::driver::ModuleDriver`] object here, at
//! boot, before the kernel singletons it feeds are used. Both registries
//! are runtime-populated rather than literally `const`, since this crate
//! links no concrete board — but once boot-time registration is done they
//! are never mutated again, which is exactly the case [`crate::btree::SortedMap`]
//! is built for.

use dnx_abi::{ErrorKind, ProgramDesc, FS_REGISTRATION_MAGIC};

use crate::btree::SortedMap;
use crate::err::{KResult, KernelError};
use crate::vfs::FsDriver;

const MAX_PROGRAMS: usize = 16;
const MAX_FILESYSTEMS: usize = 4;

/// The statically-linked program table: every program a board's image
/// includes, keyed by name for `process_create`'s name resolution step.
pub struct ProgramRegistry {
    programs: spin::Mutex<SortedMap<&'static str, &'static ProgramDesc, MAX_PROGRAMS>>,
}

impl ProgramRegistry {
    pub const fn new() -> Self {
        ProgramRegistry {
            programs: spin::Mutex::new(SortedMap::new()),
        }
    }

    pub fn register(&self, program: &'static ProgramDesc) -> KResult<()> {
        self.programs
            .lock()
            .insert(program.name, program)
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))
    }

    pub fn find(&self, name: &str) -> Option<&'static ProgramDesc> {
        self.programs.lock().search(&name).copied()
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The statically-linked filesystem table: `{name, vtable, magic}`. `magic`
/// is checked on every `find` so a registration built against a mismatched
/// `FsDriver` ABI version is rejected rather than dispatched into.
pub struct FsRegistry {
    filesystems: spin::Mutex<SortedMap<&'static str, (&'static dyn FsDriver, u32), MAX_FILESYSTEMS>>,
}

impl FsRegistry {
    pub const fn new() -> Self {
        FsRegistry {
            filesystems: spin::Mutex::new(SortedMap::new()),
        }
    }

    pub fn register(&self, name: &'static str, magic: u32, driver: &'static dyn FsDriver) -> KResult<()> {
        self.filesystems
            .lock()
            .insert(name, (driver, magic))
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))
    }

    /// Resolves `name`, refusing if its stored magic does not match
    /// [`dnx_abi::FS_REGISTRATION_MAGIC`].
    pub fn find(&self, name: &str) -> KResult<&'static dyn FsDriver> {
        let filesystems = self.filesystems.lock();
        let (driver, magic) = filesystems
            .search(&name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if *magic != FS_REGISTRATION_MAGIC {
            return Err(KernelError::Fatal("fs registry: magic mismatch"));
        }
        Ok(*driver)
    }
}

impl Default for FsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnx_abi::Priority;

    struct NullFs;
    impl FsDriver for NullFs {
        fn init(&self, _source: &str, _options: &str) -> KResult<u32> {
            Ok(0)
        }
        fn release(&self, _handle: u32) -> KResult<()> {
            Ok(())
        }
        fn open(&self, _handle: u32, _path: &str, _flags: dnx_abi::OpenFlags) -> KResult<u32> {
            Ok(0)
        }
        fn close(&self, _handle: u32, _file: u32) -> KResult<()> {
            Ok(())
        }
        fn read(&self, _handle: u32, _file: u32, _pos: u64, _buf: &mut [u8]) -> KResult<usize> {
            Ok(0)
        }
        fn write(&self, _handle: u32, _file: u32, _pos: u64, _buf: &[u8]) -> KResult<usize> {
            Ok(0)
        }
        fn ioctl(&self, _handle: u32, _file: u32, _request: u32, _arg: usize) -> KResult<usize> {
            Ok(0)
        }
        fn fstat(&self, _handle: u32, _file: u32) -> KResult<crate::vfs::Stat> {
            Ok(crate::vfs::Stat::default())
        }
        fn flush(&self, _handle: u32, _file: u32) -> KResult<()> {
            Ok(())
        }
        fn mknod(&self, _handle: u32, _path: &str, _device: dnx_abi::DeviceNumber) -> KResult<()> {
            Ok(())
        }
        fn sync(&self, _handle: u32) -> KResult<()> {
            Ok(())
        }
        fn opendir(&self, _handle: u32, _path: &str) -> KResult<u32> {
            Ok(0)
        }
        fn closedir(&self, _handle: u32, _dir: u32) -> KResult<()> {
            Ok(())
        }
        fn readdir(&self, _handle: u32, _dir: u32, _index: usize) -> KResult<Option<crate::vfs::DirEntry>> {
            Ok(None)
        }
    }

    static NULL_FS: NullFs = NullFs;
    static INIT_PROGRAM: ProgramDesc = ProgramDesc {
        name: "init",
        globals_size: 0,
        stack_depth: 256,
        default_priority: Priority::NORMAL,
        main: |_argc, _argv| 0,
    };

    #[test]
    fn program_registry_finds_by_name() {
        let registry = ProgramRegistry::new();
        registry.register(&INIT_PROGRAM).unwrap();
        assert!(registry.find("init").is_some());
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn fs_registry_rejects_mismatched_magic() {
        let registry = FsRegistry::new();
        registry.register("ramfs", FS_REGISTRATION_MAGIC, &NULL_FS).unwrap();
        assert!(registry.find("ramfs").is_ok());

        registry.register("bad", 0xdead_beef, &NULL_FS).unwrap();
        assert!(matches!(registry.find("bad"), Err(KernelError::Fatal(_))));
    }
}
