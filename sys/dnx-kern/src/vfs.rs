// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual file system: mount tree, path resolution, file and
//! directory handles.
//!
//! The original "FS interface vtable" — a struct of function pointers plus
//! a magic number used to validate it — becomes [`FsDriver`], a trait every
//! concrete filesystem implements and registers by `&'static dyn` reference;
//! the magic-number check disappears because Rust's vtable is already
//! typed. Optional operations (`stat`, `statfs`, `mkdir`, `mkfifo`,
//! `remove`, `rename`, `chmod`, `chown`) get default implementations that
//! return [`dnx_abi::ErrorKind::NotSupported`], so a filesystem only
//! implements what it actually offers.
//!
//! A filesystem's internal notion of "this open file" or "this mounted
//! instance" is opaque to the VFS — it is handed back exactly the
//! [`FsHandleId`]/[`FileHandleId`]/[`DirHandleId`] it returned from
//! `init`/`open`/`opendir`, the same way the original vtable calls passed
//! back a filesystem-private `void*`.

use heapless::{String, Vec};

use dnx_abi::{DeviceNumber, ErrorKind, OpenFlags, SeekFrom};

use crate::config::{MAX_MOUNTS, MAX_NAME_LEN, MAX_OPEN_DIRS, MAX_OPEN_FILES, MAX_PATH_LEN};
use crate::err::{KResult, KernelError};
use crate::resource::{ResourceId, ResourceTag, Slab};

pub type FsHandleId = u32;
pub type FileHandleId = u32;
pub type DirHandleId = u32;

#[derive(Copy, Clone, Debug, Default)]
pub struct Stat {
    pub size: u64,
    pub is_directory: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String<MAX_NAME_LEN>,
    pub is_directory: bool,
    pub size: u64,
}

fn not_supported<T>() -> KResult<T> {
    Err(KernelError::Recoverable(ErrorKind::NotSupported))
}

/// A concrete filesystem, reached only through this trait — the module
/// never depends on FAT, ramfs, devfs or procfs directly.
pub trait FsDriver: Send + Sync {
    fn init(&self, source: &str, options: &str) -> KResult<FsHandleId>;
    fn release(&self, handle: FsHandleId) -> KResult<()>;

    fn open(&self, handle: FsHandleId, path: &str, flags: OpenFlags) -> KResult<FileHandleId>;
    fn close(&self, handle: FsHandleId, file: FileHandleId) -> KResult<()>;
    fn read(&self, handle: FsHandleId, file: FileHandleId, pos: u64, buf: &mut [u8]) -> KResult<usize>;
    fn write(&self, handle: FsHandleId, file: FileHandleId, pos: u64, buf: &[u8]) -> KResult<usize>;
    fn ioctl(&self, handle: FsHandleId, file: FileHandleId, request: u32, arg: usize) -> KResult<usize>;
    fn fstat(&self, handle: FsHandleId, file: FileHandleId) -> KResult<Stat>;
    fn flush(&self, handle: FsHandleId, file: FileHandleId) -> KResult<()>;
    fn mknod(&self, handle: FsHandleId, path: &str, device: DeviceNumber) -> KResult<()>;
    fn sync(&self, handle: FsHandleId) -> KResult<()>;

    fn opendir(&self, handle: FsHandleId, path: &str) -> KResult<DirHandleId>;
    fn closedir(&self, handle: FsHandleId, dir: DirHandleId) -> KResult<()>;
    fn readdir(&self, handle: FsHandleId, dir: DirHandleId, index: usize) -> KResult<Option<DirEntry>>;

    fn stat(&self, _handle: FsHandleId, _path: &str) -> KResult<Stat> {
        not_supported()
    }
    fn statfs(&self, _handle: FsHandleId) -> KResult<FsStat> {
        not_supported()
    }
    fn mkdir(&self, _handle: FsHandleId, _path: &str) -> KResult<()> {
        not_supported()
    }
    fn mkfifo(&self, _handle: FsHandleId, _path: &str) -> KResult<()> {
        not_supported()
    }
    fn remove(&self, _handle: FsHandleId, _path: &str) -> KResult<()> {
        not_supported()
    }
    fn rename(&self, _handle: FsHandleId, _old: &str, _new: &str) -> KResult<()> {
        not_supported()
    }
    fn chmod(&self, _handle: FsHandleId, _path: &str, _mode: u32) -> KResult<()> {
        not_supported()
    }
    fn chown(&self, _handle: FsHandleId, _path: &str, _uid: u32, _gid: u32) -> KResult<()> {
        not_supported()
    }
}

struct Mount {
    mount_point: String<MAX_PATH_LEN>,
    parent: Option<usize>,
    fs: &'static dyn FsDriver,
    fs_handle: FsHandleId,
    child_count: u32,
}

#[derive(Copy, Clone)]
pub struct FileHandle {
    pub fs: &'static dyn FsDriver,
    pub fs_mount_handle: FsHandleId,
    pub fs_file: FileHandleId,
    pub position: u64,
    pub flags: OpenFlags,
}

#[derive(Copy, Clone)]
pub struct DirHandle {
    pub fs: &'static dyn FsDriver,
    pub fs_mount_handle: FsHandleId,
    pub fs_dir: DirHandleId,
    pub index: usize,
}

struct Inner {
    mounts: Vec<Mount, MAX_MOUNTS>,
    files: Slab<FileHandle, MAX_OPEN_FILES>,
    dirs: Slab<DirHandle, MAX_OPEN_DIRS>,
}

/// The VFS singleton: mount tree plus the open file/dir handle tables.
pub struct Vfs {
    inner: spin::Mutex<Inner>,
}

/// Collapses `.`/`..`/repeated `/` in `path`, resolved against `cwd` if
/// `path` is not itself absolute. A `..` at the root is absorbed rather
/// than escaping it, since nothing exists above `/` to traverse into.
/// The result is always absolute and, unless it is exactly `/`, does not
/// end with `/`.
pub fn normalize_path(cwd: &str, path: &str) -> String<MAX_PATH_LEN> {
    let mut stack: Vec<&str, 32> = Vec::new();
    let absolute = path.starts_with('/');
    let base_components = if absolute { "" } else { cwd };

    for component in base_components.split('/').chain(path.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                let _ = stack.pop();
            }
            other => {
                let _ = stack.push(other);
            }
        }
    }

    let mut out: String<MAX_PATH_LEN> = String::new();
    if stack.is_empty() {
        let _ = out.push('/');
        return out;
    }
    for component in &stack {
        let _ = out.push('/');
        let _ = out.push_str(component);
    }
    out
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            inner: spin::Mutex::new(Inner {
                mounts: Vec::new(),
                files: Slab::new(ResourceTag::File),
                dirs: Slab::new(ResourceTag::Dir),
            }),
        }
    }

    /// Mounts `fs` at `mount_point` (must be absolute and end with `/`).
    /// The first mount must be `/`. Resolves the longest existing
    /// mount-point prefix of `mount_point` as the new mount's parent and
    /// increments its child count.
    pub fn mount(
        &self,
        fs: &'static dyn FsDriver,
        source: &str,
        mount_point: &str,
        options: &str,
    ) -> KResult<()> {
        if !mount_point.starts_with('/') || !mount_point.ends_with('/') {
            return Err(KernelError::Recoverable(ErrorKind::InvalidArgument));
        }
        let mut inner = self.inner.lock();
        if inner.mounts.is_empty() && mount_point != "/" {
            return Err(KernelError::Recoverable(ErrorKind::InvalidArgument));
        }

        let parent = longest_prefix_mount(&inner.mounts, mount_point);
        let fs_handle = fs.init(source, options)?;

        let mut mount_point_buf: String<MAX_PATH_LEN> = String::new();
        let _ = mount_point_buf.push_str(mount_point);
        inner
            .mounts
            .push(Mount {
                mount_point: mount_point_buf,
                parent,
                fs,
                fs_handle,
                child_count: 0,
            })
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;

        if let Some(parent_index) = parent {
            inner.mounts[parent_index].child_count += 1;
        }
        Ok(())
    }

    /// Unmounts `mount_point`, refusing if it has children, any file or
    /// directory under it is still open, or the filesystem itself reports
    /// busy.
    pub fn unmount(&self, mount_point: &str) -> KResult<()> {
        let mut inner = self.inner.lock();
        let index = inner
            .mounts
            .iter()
            .position(|m| m.mount_point == mount_point)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;

        if inner.mounts[index].child_count != 0 {
            return Err(KernelError::Recoverable(ErrorKind::Busy));
        }
        let still_open = inner
            .files
            .iter()
            .any(|(_, f)| core::ptr::eq(f.fs, inner.mounts[index].fs) && f.fs_mount_handle == inner.mounts[index].fs_handle)
            || inner
                .dirs
                .iter()
                .any(|(_, d)| core::ptr::eq(d.fs, inner.mounts[index].fs) && d.fs_mount_handle == inner.mounts[index].fs_handle);
        if still_open {
            return Err(KernelError::Recoverable(ErrorKind::Busy));
        }

        let mount = &inner.mounts[index];
        mount.fs.release(mount.fs_handle)?;
        let parent = mount.parent;
        inner.mounts.swap_remove(index);
        if let Some(parent_index) = parent {
            if let Some(parent_mount) = inner.mounts.get_mut(parent_index) {
                parent_mount.child_count = parent_mount.child_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Resolves `path` (already normalized and absolute) against the
    /// mount list, returning the mount index and the residual path to hand
    /// to that filesystem.
    fn resolve<'a>(&self, inner: &Inner, path: &'a str) -> KResult<(usize, &'a str)> {
        let index = longest_prefix_mount(&inner.mounts, path)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        let residual = path
            .strip_prefix(inner.mounts[index].mount_point.as_str())
            .unwrap_or(path);
        Ok((index, residual))
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> KResult<ResourceId> {
        let mut inner = self.inner.lock();
        let (mount_index, residual) = self.resolve(&inner, path)?;
        let mount_fs = inner.mounts[mount_index].fs;
        let mount_handle = inner.mounts[mount_index].fs_handle;
        let fs_file = mount_fs.open(mount_handle, residual, flags)?;
        let position = if flags.contains(OpenFlags::APPEND) {
            mount_fs.fstat(mount_handle, fs_file).map(|s| s.size).unwrap_or(0)
        } else {
            0
        };
        inner
            .files
            .insert(FileHandle {
                fs: mount_fs,
                fs_mount_handle: mount_handle,
                fs_file,
                position,
                flags,
            })
            .ok_or(KernelError::Recoverable(ErrorKind::NoMemory))
    }

    pub fn read(&self, id: ResourceId, buf: &mut [u8]) -> KResult<usize> {
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .get_mut(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let n = file.fs.read(file.fs_mount_handle, file.fs_file, file.position, buf)?;
        file.position += n as u64;
        if n < buf.len() {
            file.flags |= OpenFlags::EOF;
        }
        Ok(n)
    }

    pub fn write(&self, id: ResourceId, buf: &[u8]) -> KResult<usize> {
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .get_mut(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let n = file.fs.write(file.fs_mount_handle, file.fs_file, file.position, buf)?;
        file.position += n as u64;
        Ok(n)
    }

    pub fn seek(&self, id: ResourceId, from: SeekFrom) -> KResult<u64> {
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .get_mut(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let size = file.fs.fstat(file.fs_mount_handle, file.fs_file)?.size;
        let new_pos = match from {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => file.position as i128 + delta as i128,
            SeekFrom::End(delta) => size as i128 + delta as i128,
        };
        file.position = new_pos.max(0) as u64;
        file.flags |= OpenFlags::SEEK_MODIFIED;
        Ok(file.position)
    }

    /// Closes `id`. When `forced` (process exit), errors from the
    /// underlying filesystem's `close` are swallowed rather than
    /// propagated, matching the "closes may not fail" requirement on
    /// forced cleanup.
    pub fn close(&self, id: ResourceId, forced: bool) -> KResult<()> {
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .remove(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let result = file.fs.close(file.fs_mount_handle, file.fs_file);
        if forced {
            Ok(())
        } else {
            result
        }
    }

    pub fn opendir(&self, path: &str) -> KResult<ResourceId> {
        let mut inner = self.inner.lock();
        let (mount_index, residual) = self.resolve(&inner, path)?;
        let mount_fs = inner.mounts[mount_index].fs;
        let mount_handle = inner.mounts[mount_index].fs_handle;
        let fs_dir = mount_fs.opendir(mount_handle, residual)?;
        inner
            .dirs
            .insert(DirHandle {
                fs: mount_fs,
                fs_mount_handle: mount_handle,
                fs_dir,
                index: 0,
            })
            .ok_or(KernelError::Recoverable(ErrorKind::NoMemory))
    }

    pub fn readdir(&self, id: ResourceId) -> KResult<Option<DirEntry>> {
        let mut inner = self.inner.lock();
        let dir = inner
            .dirs
            .get_mut(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let entry = dir.fs.readdir(dir.fs_mount_handle, dir.fs_dir, dir.index)?;
        if entry.is_some() {
            dir.index += 1;
        }
        Ok(entry)
    }

    pub fn closedir(&self, id: ResourceId, forced: bool) -> KResult<()> {
        let mut inner = self.inner.lock();
        let dir = inner
            .dirs
            .remove(id)
            .ok_or(KernelError::Recoverable(ErrorKind::BadFileDescriptor))?;
        let result = dir.fs.closedir(dir.fs_mount_handle, dir.fs_dir);
        if forced {
            Ok(())
        } else {
            result
        }
    }

    pub fn mkdir(&self, path: &str) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.mkdir(handle, residual))
    }

    pub fn mkfifo(&self, path: &str) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.mkfifo(handle, residual))
    }

    pub fn mknod(&self, path: &str, device: DeviceNumber) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.mknod(handle, residual, device))
    }

    pub fn remove(&self, path: &str) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.remove(handle, residual))
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> KResult<()> {
        let inner = self.inner.lock();
        let (old_mount, old_residual) = self.resolve(&inner, old_path)?;
        let (new_mount, new_residual) = self.resolve(&inner, new_path)?;
        if old_mount != new_mount {
            return Err(KernelError::Recoverable(ErrorKind::CrossDeviceLink));
        }
        let mount = &inner.mounts[old_mount];
        mount.fs.rename(mount.fs_handle, old_residual, new_residual)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.chmod(handle, residual, mode))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> KResult<()> {
        self.passthrough(path, |fs, handle, residual| fs.chown(handle, residual, uid, gid))
    }

    pub fn stat(&self, path: &str) -> KResult<Stat> {
        let inner = self.inner.lock();
        let (mount_index, residual) = self.resolve(&inner, path)?;
        let mount = &inner.mounts[mount_index];
        mount.fs.stat(mount.fs_handle, residual)
    }

    pub fn statfs(&self, path: &str) -> KResult<FsStat> {
        let inner = self.inner.lock();
        let (mount_index, _residual) = self.resolve(&inner, path)?;
        let mount = &inner.mounts[mount_index];
        mount.fs.statfs(mount.fs_handle)
    }

    fn passthrough(
        &self,
        path: &str,
        op: impl FnOnce(&'static dyn FsDriver, FsHandleId, &str) -> KResult<()>,
    ) -> KResult<()> {
        let inner = self.inner.lock();
        let (mount_index, residual) = self.resolve(&inner, path)?;
        let mount = &inner.mounts[mount_index];
        op(mount.fs, mount.fs_handle, residual)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

fn longest_prefix_mount(mounts: &[Mount], path: &str) -> Option<usize> {
    mounts
        .iter()
        .enumerate()
        .filter(|(_, m)| path.starts_with(m.mount_point.as_str()) || m.mount_point == "/")
        .max_by_key(|(_, m)| m.mount_point.len())
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;
    use std::string::String as StdString;

    struct MemFs {
        files: StdMutex<StdVec<StdString>>,
    }

    impl FsDriver for MemFs {
        fn init(&self, _source: &str, _options: &str) -> KResult<FsHandleId> {
            Ok(0)
        }
        fn release(&self, _handle: FsHandleId) -> KResult<()> {
            Ok(())
        }
        fn open(&self, _handle: FsHandleId, path: &str, _flags: OpenFlags) -> KResult<FileHandleId> {
            let mut files = self.files.lock().unwrap();
            files.push(path.into());
            Ok((files.len() - 1) as u32)
        }
        fn close(&self, _handle: FsHandleId, _file: FileHandleId) -> KResult<()> {
            Ok(())
        }
        fn read(&self, _handle: FsHandleId, _file: FileHandleId, _pos: u64, buf: &mut [u8]) -> KResult<usize> {
            let n = buf.len().min(4);
            buf[..n].fill(b'x');
            Ok(n)
        }
        fn write(&self, _handle: FsHandleId, _file: FileHandleId, _pos: u64, buf: &[u8]) -> KResult<usize> {
            Ok(buf.len())
        }
        fn ioctl(&self, _handle: FsHandleId, _file: FileHandleId, _request: u32, _arg: usize) -> KResult<usize> {
            Ok(0)
        }
        fn fstat(&self, _handle: FsHandleId, _file: FileHandleId) -> KResult<Stat> {
            Ok(Stat::default())
        }
        fn flush(&self, _handle: FsHandleId, _file: FileHandleId) -> KResult<()> {
            Ok(())
        }
        fn mknod(&self, _handle: FsHandleId, _path: &str, _device: DeviceNumber) -> KResult<()> {
            Ok(())
        }
        fn sync(&self, _handle: FsHandleId) -> KResult<()> {
            Ok(())
        }
        fn opendir(&self, _handle: FsHandleId, _path: &str) -> KResult<DirHandleId> {
            Ok(0)
        }
        fn closedir(&self, _handle: FsHandleId, _dir: DirHandleId) -> KResult<()> {
            Ok(())
        }
        fn readdir(&self, _handle: FsHandleId, _dir: DirHandleId, _index: usize) -> KResult<Option<DirEntry>> {
            Ok(None)
        }
    }

    #[test]
    fn normalize_path_collapses_dot_and_dotdot() {
        assert_eq!(normalize_path("/", "/a/./b/../c").as_str(), "/a/c");
        assert_eq!(normalize_path("/home/user", "../x").as_str(), "/home/x");
        assert_eq!(normalize_path("/", "/../../x").as_str(), "/x");
    }

    #[test]
    fn mount_requires_root_first_and_longest_prefix_wins() {
        let root: &'static MemFs = Box::leak(Box::new(MemFs {
            files: StdMutex::new(StdVec::new()),
        }));
        let sub: &'static MemFs = Box::leak(Box::new(MemFs {
            files: StdMutex::new(StdVec::new()),
        }));
        let vfs = Vfs::new();
        assert!(vfs.mount(sub, "", "/mnt/", "").is_err());
        vfs.mount(root, "", "/", "").unwrap();
        vfs.mount(sub, "", "/mnt/", "").unwrap();

        let id = vfs.open("/mnt/file.txt", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(id, &mut buf).unwrap(), 4);
        vfs.close(id, false).unwrap();
    }

    #[test]
    fn unmount_refuses_while_children_or_open_handles_exist() {
        let root: &'static MemFs = Box::leak(Box::new(MemFs {
            files: StdMutex::new(StdVec::new()),
        }));
        let sub: &'static MemFs = Box::leak(Box::new(MemFs {
            files: StdMutex::new(StdVec::new()),
        }));
        let vfs = Vfs::new();
        vfs.mount(root, "", "/", "").unwrap();
        vfs.mount(sub, "", "/mnt/", "").unwrap();
        assert!(vfs.unmount("/").is_err());

        let id = vfs.open("/mnt/file.txt", OpenFlags::READ).unwrap();
        assert!(vfs.unmount("/mnt/").is_err());
        vfs.close(id, false).unwrap();
        assert!(vfs.unmount("/mnt/").is_ok());
    }
}
