// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver/module registry and device locking.
//!
//! A compile-time table lists every linked module by name plus its
//! interface vtable — here, a `&'static dyn ModuleDriver`. A run-time table
//! of device nodes maps a name to `(major, minor, driver handle, device
//! lock slot)`, populated by [`Registry::driver_init`] and torn down by
//! [`Registry::driver_release`].
//!
//! The device lock gives one process at a time exclusive ownership of a
//! device — enforced by [`DeviceLock`], not merely advisory.

use heapless::{String, Vec};

use dnx_abi::{DeviceNumber, ErrorKind};

use crate::config::{MAX_DEVICE_NODES, MAX_NAME_LEN};
use crate::err::{KResult, KernelError};

/// A concrete device driver, reached only through this trait the way the
/// original module interface vtable reached `drv_init`/`drv_release`/etc.
/// through function pointers.
pub trait ModuleDriver: Send + Sync {
    fn init(&self, minor: u8, config: &str) -> KResult<u32>;
    fn release(&self, handle: u32) -> KResult<()>;
    fn open(&self, handle: u32, flags: u32) -> KResult<()>;
    fn close(&self, handle: u32) -> KResult<()>;
    fn read(&self, handle: u32, pos: u64, buf: &mut [u8]) -> KResult<usize>;
    fn write(&self, handle: u32, pos: u64, buf: &[u8]) -> KResult<usize>;
    fn ioctl(&self, handle: u32, request: u32, arg: usize) -> KResult<usize>;
    fn flush(&self, handle: u32) -> KResult<()>;
    fn stat(&self, handle: u32) -> KResult<u64>;
}

/// One compile-time module table entry.
pub struct ModuleEntry {
    pub name: &'static str,
    pub driver: &'static dyn ModuleDriver,
}

/// `lock`/`access`/`unlock` on a single device's ownership slot. Zero means
/// unowned; a nonzero value is the owning process id.
#[derive(Default)]
pub struct DeviceLock {
    owner: spin::Mutex<u32>,
}

impl DeviceLock {
    pub const fn new() -> Self {
        DeviceLock {
            owner: spin::Mutex::new(0),
        }
    }

    /// Succeeds iff the slot is currently unowned, storing `pid`.
    pub fn lock(&self, pid: u32) -> KResult<()> {
        let mut owner = self.owner.lock();
        if *owner != 0 {
            return Err(KernelError::Recoverable(ErrorKind::Busy));
        }
        *owner = pid;
        Ok(())
    }

    /// Succeeds only if `pid` is the current owner.
    pub fn access(&self, pid: u32) -> KResult<()> {
        let owner = self.owner.lock();
        if *owner == pid {
            Ok(())
        } else {
            Err(KernelError::Recoverable(ErrorKind::PermissionDenied))
        }
    }

    /// Clears the slot. `force` bypasses the ownership check, used when a
    /// process exits (normally or abnormally) while still holding the lock.
    pub fn unlock(&self, pid: u32, force: bool) -> KResult<()> {
        let mut owner = self.owner.lock();
        if !force && *owner != pid {
            return Err(KernelError::Recoverable(ErrorKind::PermissionDenied));
        }
        *owner = 0;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        *self.owner.lock() != 0
    }

    /// Current owner, or 0 if unowned.
    pub fn owner(&self) -> u32 {
        *self.owner.lock()
    }
}

struct DeviceNode {
    name: String<MAX_NAME_LEN>,
    device: DeviceNumber,
    driver: &'static dyn ModuleDriver,
    driver_handle: u32,
    lock: DeviceLock,
}

/// The driver/module registry singleton: the compile-time module table plus
/// the run-time device node table.
pub struct Registry {
    modules: &'static [ModuleEntry],
    nodes: spin::Mutex<Vec<DeviceNode, MAX_DEVICE_NODES>>,
}

impl Registry {
    pub const fn new(modules: &'static [ModuleEntry]) -> Self {
        Registry {
            modules,
            nodes: spin::Mutex::new(Vec::new()),
        }
    }

    fn find_module(&self, name: &str) -> Option<&'static dyn ModuleDriver> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.driver)
    }

    /// Locates `module_name`, allocates a device id, and calls the module's
    /// `init`. On failure, no device node is recorded.
    pub fn driver_init(
        &self,
        module_name: &str,
        major: u16,
        minor: u16,
        node_name: &str,
        config: &str,
    ) -> KResult<DeviceNumber> {
        let driver = self
            .find_module(module_name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;

        let mut nodes = self.nodes.lock();
        if nodes.iter().any(|n| n.name == node_name) {
            return Err(KernelError::Recoverable(ErrorKind::AlreadyExists));
        }

        let driver_handle = driver.init(minor as u8, config)?;
        let mut name: String<MAX_NAME_LEN> = String::new();
        let _ = name.push_str(node_name);
        let device = DeviceNumber { major, minor };

        nodes
            .push(DeviceNode {
                name,
                device,
                driver,
                driver_handle,
                lock: DeviceLock::new(),
            })
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        Ok(device)
    }

    /// Refuses if the device is currently locked by a process. Otherwise
    /// calls the module's `release` and drops the device node.
    pub fn driver_release(&self, node_name: &str) -> KResult<()> {
        let mut nodes = self.nodes.lock();
        let index = nodes
            .iter()
            .position(|n| n.name == node_name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if nodes[index].lock.is_locked() {
            return Err(KernelError::Recoverable(ErrorKind::Busy));
        }
        let node = &nodes[index];
        node.driver.release(node.driver_handle)?;
        nodes.swap_remove(index);
        Ok(())
    }

    fn with_node<R>(&self, node_name: &str, op: impl FnOnce(&DeviceNode) -> KResult<R>) -> KResult<R> {
        let nodes = self.nodes.lock();
        let node = nodes
            .iter()
            .find(|n| n.name == node_name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        op(node)
    }

    pub fn lock(&self, node_name: &str, pid: u32) -> KResult<()> {
        self.with_node(node_name, |node| node.lock.lock(pid))
    }

    pub fn access(&self, node_name: &str, pid: u32) -> KResult<()> {
        self.with_node(node_name, |node| node.lock.access(pid))
    }

    pub fn unlock(&self, node_name: &str, pid: u32, force: bool) -> KResult<()> {
        self.with_node(node_name, |node| node.lock.unlock(pid, force))
    }

    /// Force-unlocks every device node currently held by `pid`. Called when
    /// a process exits or is killed while still holding a device lock, so
    /// the next `lock` on that node by another process succeeds.
    pub fn unlock_all_owned_by(&self, pid: u32) {
        let nodes = self.nodes.lock();
        for node in nodes.iter() {
            if node.lock.owner() == pid {
                let _ = node.lock.unlock(pid, true);
            }
        }
    }

    pub fn driver_open(&self, node_name: &str, flags: u32) -> KResult<()> {
        self.with_node(node_name, |node| node.driver.open(node.driver_handle, flags))
    }

    pub fn driver_close(&self, node_name: &str) -> KResult<()> {
        self.with_node(node_name, |node| node.driver.close(node.driver_handle))
    }

    pub fn driver_read(&self, node_name: &str, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.with_node(node_name, |node| node.driver.read(node.driver_handle, pos, buf))
    }

    pub fn driver_write(&self, node_name: &str, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.with_node(node_name, |node| node.driver.write(node.driver_handle, pos, buf))
    }

    pub fn driver_ioctl(&self, node_name: &str, request: u32, arg: usize) -> KResult<usize> {
        self.with_node(node_name, |node| node.driver.ioctl(node.driver_handle, request, arg))
    }

    pub fn driver_flush(&self, node_name: &str) -> KResult<()> {
        self.with_node(node_name, |node| node.driver.flush(node.driver_handle))
    }

    pub fn driver_stat(&self, node_name: &str) -> KResult<u64> {
        self.with_node(node_name, |node| node.driver.stat(node.driver_handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDriver {
        released: spin::Mutex<bool>,
    }

    impl ModuleDriver for CountingDriver {
        fn init(&self, _minor: u8, _config: &str) -> KResult<u32> {
            Ok(7)
        }
        fn release(&self, _handle: u32) -> KResult<()> {
            *self.released.lock() = true;
            Ok(())
        }
        fn open(&self, _handle: u32, _flags: u32) -> KResult<()> {
            Ok(())
        }
        fn close(&self, _handle: u32) -> KResult<()> {
            Ok(())
        }
        fn read(&self, _handle: u32, _pos: u64, buf: &mut [u8]) -> KResult<usize> {
            let n = buf.len().min(2);
            buf[..n].fill(7);
            Ok(n)
        }
        fn write(&self, _handle: u32, _pos: u64, buf: &[u8]) -> KResult<usize> {
            Ok(buf.len())
        }
        fn ioctl(&self, _handle: u32, _request: u32, _arg: usize) -> KResult<usize> {
            Ok(0)
        }
        fn flush(&self, _handle: u32) -> KResult<()> {
            Ok(())
        }
        fn stat(&self, _handle: u32) -> KResult<u64> {
            Ok(0)
        }
    }

    static DRIVER: CountingDriver = CountingDriver {
        released: spin::Mutex::new(false),
    };
    static MODULES: [ModuleEntry; 1] = [ModuleEntry {
        name: "gpio",
        driver: &DRIVER,
    }];

    #[test]
    fn driver_init_then_release_round_trips() {
        let registry = Registry::new(&MODULES);
        registry.driver_init("gpio", 90, 0, "/dev/gpio0", "").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(registry.driver_read("/dev/gpio0", 0, &mut buf).unwrap(), 2);
        registry.driver_release("/dev/gpio0").unwrap();
        assert!(*DRIVER.released.lock());
    }

    #[test]
    fn device_lock_is_exclusive_and_force_unlock_bypasses_owner() {
        let registry = Registry::new(&MODULES);
        registry.driver_init("gpio", 90, 0, "/dev/gpio0", "").unwrap();
        registry.lock("/dev/gpio0", 1).unwrap();
        assert!(registry.lock("/dev/gpio0", 2).is_err());
        assert!(registry.access("/dev/gpio0", 2).is_err());
        assert!(registry.access("/dev/gpio0", 1).is_ok());

        assert!(registry.driver_release("/dev/gpio0").is_err());
        assert!(registry.unlock("/dev/gpio0", 2, false).is_err());
        registry.unlock("/dev/gpio0", 2, true).unwrap();
        assert!(registry.driver_release("/dev/gpio0").is_ok());
    }

    #[test]
    fn unlock_all_owned_by_only_clears_matching_nodes() {
        let registry = Registry::new(&MODULES);
        registry.driver_init("gpio", 90, 0, "/dev/gpio0", "").unwrap();
        registry.driver_init("gpio", 90, 1, "/dev/gpio1", "").unwrap();
        registry.lock("/dev/gpio0", 1).unwrap();
        registry.lock("/dev/gpio1", 2).unwrap();

        registry.unlock_all_owned_by(1);

        assert!(registry.lock("/dev/gpio0", 3).is_ok());
        assert!(registry.lock("/dev/gpio1", 3).is_err());
    }
}
