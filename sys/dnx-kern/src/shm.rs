// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inter-process shared memory.
//!
//! A named region, allocated once from [`crate::mm::Mm`] under
//! `PurposeTag::Shared`, that any number of processes can attach to get the
//! same base address and size back. The region outlives every individual
//! attach/detach: it is only actually freed once a `destroy` has been
//! requested *and* the attached-process list has emptied, whichever order
//! those two things happen in.

use heapless::{String, Vec};

use dnx_abi::{ErrorKind, PurposeTag};

use crate::config::{MAX_NAME_LEN, MAX_SHM_ATTACHMENTS, MAX_SHM_REGIONS};
use crate::err::{KResult, KernelError};
use crate::mm::Mm;

struct Region {
    name: String<MAX_NAME_LEN>,
    base: *mut u8,
    size: usize,
    attached: Vec<u32, MAX_SHM_ATTACHMENTS>,
    destroy_pending: bool,
}

// SAFETY: `base` is a pointer into a statically sized MM region shared
// deliberately across processes; shm's entire purpose is letting multiple
// threads/processes read and write through it.
unsafe impl Send for Region {}

/// The shared-memory registry singleton.
pub struct Shm<'m, 'r> {
    mm: &'m Mm<'r>,
    regions: spin::Mutex<Vec<Region, MAX_SHM_REGIONS>>,
}

impl<'m, 'r> Shm<'m, 'r> {
    pub fn new(mm: &'m Mm<'r>) -> Self {
        Shm {
            mm,
            regions: spin::Mutex::new(Vec::new()),
        }
    }

    /// Allocates a new zero-filled, named region. Fails with `AlreadyExists`
    /// if the name is taken.
    pub fn create(&self, name: &str, size: usize) -> KResult<()> {
        let mut regions = self.regions.lock();
        if regions.iter().any(|r| r.name == name) {
            return Err(KernelError::Recoverable(ErrorKind::AlreadyExists));
        }
        let base = self.mm.kzalloc(PurposeTag::Shared, size, None)?;
        let mut stored_name: String<MAX_NAME_LEN> = String::new();
        let _ = stored_name.push_str(name);
        regions
            .push(Region {
                name: stored_name,
                base,
                size,
                attached: Vec::new(),
                destroy_pending: false,
            })
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        Ok(())
    }

    /// Adds `pid` to the region's attached-process list if it isn't
    /// already there (idempotent per process), returning the region's base
    /// address and size.
    pub fn attach(&self, name: &str, pid: u32) -> KResult<(*mut u8, usize)> {
        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if !region.attached.contains(&pid) {
            region
                .attached
                .push(pid)
                .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        }
        Ok((region.base, region.size))
    }

    /// Removes `pid` from the attached-process list. If the list becomes
    /// empty and a destroy was requested while attachments remained, the
    /// region is freed now.
    pub fn detach(&self, name: &str, pid: u32) -> KResult<()> {
        let mut regions = self.regions.lock();
        let index = regions
            .iter()
            .position(|r| r.name == name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if let Some(pos) = regions[index].attached.iter().position(|p| *p == pid) {
            regions[index].attached.swap_remove(pos);
        }
        if regions[index].destroy_pending && regions[index].attached.is_empty() {
            self.free_region(&mut regions, index)?;
        }
        Ok(())
    }

    /// Marks the region for destruction. If nothing is attached, it is
    /// freed immediately; otherwise the actual free happens on the last
    /// `detach`.
    pub fn destroy(&self, name: &str) -> KResult<()> {
        let mut regions = self.regions.lock();
        let index = regions
            .iter()
            .position(|r| r.name == name)
            .ok_or(KernelError::Recoverable(ErrorKind::NoSuchEntry))?;
        if regions[index].attached.is_empty() {
            self.free_region(&mut regions, index)?;
        } else {
            regions[index].destroy_pending = true;
        }
        Ok(())
    }

    /// Detaches `pid` from every region it is attached to. Called on
    /// process exit so shared memory never outlives the processes that
    /// asked for it.
    pub fn detach_all(&self, pid: u32) {
        let names: Vec<String<MAX_NAME_LEN>, MAX_SHM_REGIONS> = {
            let regions = self.regions.lock();
            regions
                .iter()
                .filter(|r| r.attached.contains(&pid))
                .map(|r| r.name.clone())
                .collect()
        };
        for name in &names {
            let _ = self.detach(name, pid);
        }
    }

    fn free_region(&self, regions: &mut Vec<Region, MAX_SHM_REGIONS>, index: usize) -> KResult<()> {
        let region = regions.swap_remove(index);
        self.mm.kfree(PurposeTag::Shared, region.base, None)
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::Region as MmRegion;

    fn backing(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn attach_is_idempotent_and_detach_frees_once_unattached_and_destroyed() {
        let bytes = backing(4096);
        let base = bytes.as_mut_ptr() as usize;
        let region = MmRegion::new("shm", base, bytes.len());
        let regions = [region];
        let mm = Mm::new(&regions);
        let shm = Shm::new(&mm);

        shm.create("fb", 256).unwrap();
        assert!(shm.create("fb", 256).is_err());

        let (addr1, size1) = shm.attach("fb", 1).unwrap();
        let (addr2, size2) = shm.attach("fb", 2).unwrap();
        assert_eq!(addr1, addr2);
        assert_eq!(size1, size2);
        let (addr3, _) = shm.attach("fb", 1).unwrap();
        assert_eq!(addr1, addr3);

        shm.destroy("fb").unwrap();
        assert_eq!(shm.region_count(), 1);
        shm.detach("fb", 1).unwrap();
        assert_eq!(shm.region_count(), 1);
        shm.detach("fb", 2).unwrap();
        assert_eq!(shm.region_count(), 0);
    }

    #[test]
    fn detach_all_clears_every_attachment_for_a_process() {
        let bytes = backing(4096);
        let base = bytes.as_mut_ptr() as usize;
        let region = MmRegion::new("shm", base, bytes.len());
        let regions = [region];
        let mm = Mm::new(&regions);
        let shm = Shm::new(&mm);

        shm.create("a", 64).unwrap();
        shm.create("b", 64).unwrap();
        shm.attach("a", 9).unwrap();
        shm.attach("b", 9).unwrap();
        shm.destroy("a").unwrap();
        shm.destroy("b").unwrap();

        shm.detach_all(9);
        assert_eq!(shm.region_count(), 0);
    }
}
