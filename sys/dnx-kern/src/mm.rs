// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory manager.
//!
//! All kernel allocation — cache block data, shared-memory payloads, a
//! program's globals blob, argv — goes through here. It is deliberately the
//! one subsystem in this crate that cannot avoid raw pointers: its entire
//! job is handing out addressable memory to callers who are going to read
//! and write through it directly.
//!
//! A [`Mm`] owns one or more physically disjoint backing [`Region`]s, tried
//! in order on allocation; within a region, free space is tracked as a
//! sorted list of `(offset, len)` spans rather than as an intrusive list
//! threaded through the backing memory itself — simpler to get right, at
//! the cost of a bounded number of simultaneously free spans, which
//! `MAX_FREE_SPANS` budgets for. Every live allocation is recorded
//! alongside the free list it came from, which is what lets [`Mm::kfree`]
//! catch a mismatched purpose tag or a double free as the fatal accounting
//! bugs the original memory manager treats them as.

use dnx_abi::PurposeTag;
use dnx_kerncore::MemoryRegion;

use crate::config::MAX_DEVICE_NODES;
use crate::err::{KResult, KernelError};

const ALIGN: usize = core::mem::size_of::<usize>();
const MAX_FREE_SPANS: usize = 16;
const MAX_ACTIVE_ALLOCS: usize = 64;

fn align_up(value: usize) -> usize {
    (value + ALIGN - 1) & !(ALIGN - 1)
}

#[derive(Copy, Clone)]
struct FreeSpan {
    offset: usize,
    len: usize,
}

#[derive(Copy, Clone)]
struct Allocation {
    offset: usize,
    len: usize,
    purpose: PurposeTag,
    module: Option<u16>,
}

struct RegionInner {
    free: heapless::Vec<FreeSpan, MAX_FREE_SPANS>,
    active: heapless::Vec<Allocation, MAX_ACTIVE_ALLOCS>,
}

/// One physically disjoint block of addressable memory the manager may
/// allocate from, e.g. internal SRAM versus an external CCM bank on a real
/// board. On the host, `base` is simply the address of a `'static` buffer.
pub struct Region {
    name: &'static str,
    base: usize,
    len: usize,
    inner: spin::Mutex<RegionInner>,
}

impl Region {
    /// `base`/`len` describe the backing storage; the caller is
    /// responsible for ensuring nothing else in the program touches this
    /// range for as long as the region is in use — ordinarily satisfied by
    /// handing the manager a `'static mut [u8]`'s address and length and
    /// never using the slice directly again.
    pub fn new(name: &'static str, base: usize, len: usize) -> Self {
        let mut free = heapless::Vec::new();
        let _ = free.push(FreeSpan { offset: 0, len });
        Region {
            name,
            base,
            len,
            inner: spin::Mutex::new(RegionInner {
                free,
                active: heapless::Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn try_alloc(
        &self,
        size: usize,
        purpose: PurposeTag,
        module: Option<u16>,
    ) -> Option<*mut u8> {
        let size = align_up(size.max(1));
        let mut inner = self.inner.lock();
        let span_index = inner
            .free
            .iter()
            .position(|span| span.len >= size)?;
        let span = inner.free[span_index];
        if span.len == size {
            inner.free.swap_remove(span_index);
        } else {
            inner.free[span_index] = FreeSpan {
                offset: span.offset + size,
                len: span.len - size,
            };
        }
        inner
            .active
            .push(Allocation {
                offset: span.offset,
                len: size,
                purpose,
                module,
            })
            .ok()?;
        Some((self.base + span.offset) as *mut u8)
    }

    fn try_free(
        &self,
        ptr: *mut u8,
        purpose: PurposeTag,
        module: Option<u16>,
    ) -> KResult<usize> {
        let addr = ptr as usize;
        if addr < self.base || addr >= self.base + self.len {
            return Err(KernelError::Fatal("kfree: pointer outside owning region"));
        }
        let offset = addr - self.base;
        let mut inner = self.inner.lock();
        let alloc_index = inner
            .active
            .iter()
            .position(|a| a.offset == offset)
            .ok_or(KernelError::Fatal("kfree: no live allocation at this address"))?;
        let alloc = inner.active[alloc_index];
        if alloc.purpose != purpose || alloc.module != module {
            return Err(KernelError::Fatal(
                "kfree: purpose/module tag does not match the allocation",
            ));
        }
        inner.active.swap_remove(alloc_index);
        insert_free_span(
            &mut inner.free,
            FreeSpan {
                offset: alloc.offset,
                len: alloc.len,
            },
        );
        Ok(alloc.len)
    }
}

impl MemoryRegion for Region {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.base + self.len
    }
}

/// Inserts `span` into `free`, sorted by offset, coalescing with an
/// adjacent span on either side. Silently drops the span if the list is
/// already full and no coalescing is possible — this can only happen if
/// `MAX_FREE_SPANS` is undersized for the fragmentation pattern in use,
/// which is a configuration bug, not a runtime one a caller can act on.
fn insert_free_span(free: &mut heapless::Vec<FreeSpan, MAX_FREE_SPANS>, span: FreeSpan) {
    let mut merged = span;
    let mut i = 0;
    while i < free.len() {
        let existing = free[i];
        if existing.offset + existing.len == merged.offset {
            merged = FreeSpan {
                offset: existing.offset,
                len: existing.len + merged.len,
            };
            free.swap_remove(i);
            continue;
        }
        if merged.offset + merged.len == existing.offset {
            merged = FreeSpan {
                offset: merged.offset,
                len: merged.len + existing.len,
            };
            free.swap_remove(i);
            continue;
        }
        i += 1;
    }
    let pos = free.iter().position(|s| s.offset > merged.offset).unwrap_or(free.len());
    let _ = free.insert(pos, merged);
}

/// Per-purpose and per-module allocation accounting plus the ordered list
/// of backing regions tried on every allocation.
pub struct Mm<'r> {
    regions: &'r [Region],
    purpose_bytes: spin::Mutex<[i64; dnx_abi::PURPOSE_COUNT]>,
    module_bytes: spin::Mutex<heapless::Vec<(u16, i64), MAX_DEVICE_NODES>>,
}

impl<'r> Mm<'r> {
    pub fn new(regions: &'r [Region]) -> Self {
        Mm {
            regions,
            purpose_bytes: spin::Mutex::new([0; dnx_abi::PURPOSE_COUNT]),
            module_bytes: spin::Mutex::new(heapless::Vec::new()),
        }
    }

    /// Allocates at least `size` bytes tagged with `purpose` (and, for
    /// `PurposeTag::Module` callers, a module id so its own counter stays
    /// consistent). Tries each backing region in order; "no memory" is
    /// returned only once every region has refused.
    pub fn kalloc(
        &self,
        purpose: PurposeTag,
        size: usize,
        module: Option<u16>,
    ) -> KResult<*mut u8> {
        let aligned = align_up(size.max(1));
        for region in self.regions {
            if let Some(ptr) = region.try_alloc(size, purpose, module) {
                self.account(purpose, module, aligned as i64);
                return Ok(ptr);
            }
        }
        Err(KernelError::Recoverable(dnx_abi::ErrorKind::NoMemory))
    }

    /// As [`Mm::kalloc`], but zero-fills the returned memory before handing
    /// it back.
    pub fn kzalloc(
        &self,
        purpose: PurposeTag,
        size: usize,
        module: Option<u16>,
    ) -> KResult<*mut u8> {
        let ptr = self.kalloc(purpose, size, module)?;
        // SAFETY: `ptr` was just handed back by `kalloc` as the start of a
        // freshly reserved `size`-byte span within one of `self.regions`'s
        // backing storage, which the caller guaranteed is valid for
        // writes for the region's lifetime.
        unsafe {
            core::ptr::write_bytes(ptr, 0, size);
        }
        Ok(ptr)
    }

    /// Frees a pointer previously returned by `kalloc`/`kzalloc`. `purpose`
    /// and `module` must match what was passed at allocation time exactly;
    /// a mismatch (or a double free) is an accounting bug the kernel cannot
    /// recover from and is reported as [`KernelError::Fatal`], which the
    /// syscall dispatcher turns into [`crate::panic::die`].
    pub fn kfree(
        &self,
        purpose: PurposeTag,
        ptr: *mut u8,
        module: Option<u16>,
    ) -> KResult<()> {
        for region in self.regions {
            if region.contains(ptr as usize) {
                let freed = region.try_free(ptr, purpose, module)?;
                self.account(purpose, module, -(freed as i64));
                return Ok(());
            }
        }
        Err(KernelError::Fatal("kfree: pointer not owned by any region"))
    }

    fn account(&self, purpose: PurposeTag, module: Option<u16>, delta: i64) {
        self.purpose_bytes.lock()[purpose.index()] += delta;
        if let Some(module_id) = module {
            let mut modules = self.module_bytes.lock();
            if let Some(entry) = modules.iter_mut().find(|(id, _)| *id == module_id) {
                entry.1 += delta;
            } else {
                let _ = modules.push((module_id, delta));
            }
        }
    }

    /// Current outstanding byte count for `purpose`, for the memory-usage
    /// stats surface.
    pub fn purpose_usage(&self, purpose: PurposeTag) -> i64 {
        self.purpose_bytes.lock()[purpose.index()]
    }

    pub fn module_usage(&self, module: u16) -> i64 {
        self.module_bytes
            .lock()
            .iter()
            .find(|(id, _)| *id == module)
            .map(|(_, bytes)| *bytes)
            .unwrap_or(0)
    }

    /// Frees every outstanding allocation tagged `PurposeTag::Program` for
    /// `module`-less process memory. Used by `process_exit` to reclaim a
    /// program's globals blob and argv in one pass without the caller
    /// needing to remember every pointer it handed out.
    pub fn reclaim_program_memory(&self, pointers: &[*mut u8]) {
        for &ptr in pointers {
            let _ = self.kfree(PurposeTag::Program, ptr, None);
        }
    }

    /// True if `addr` falls within any backing region — the syscall
    /// dispatcher's "is this user pointer actually on the heap" check.
    pub fn is_on_heap(&self, addr: usize) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(len: usize) -> Region {
        let storage: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Region::new("test", storage.as_ptr() as usize, len)
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let r = region(4096);
        let regions = [r];
        let mm = Mm::new(&regions);
        let ptr = mm.kalloc(PurposeTag::Kernel, 64, None).unwrap();
        assert_eq!(mm.purpose_usage(PurposeTag::Kernel), 64);
        mm.kfree(PurposeTag::Kernel, ptr, None).unwrap();
        assert_eq!(mm.purpose_usage(PurposeTag::Kernel), 0);
    }

    #[test]
    fn mismatched_purpose_is_fatal() {
        let r = region(4096);
        let regions = [r];
        let mm = Mm::new(&regions);
        let ptr = mm.kalloc(PurposeTag::Fs, 32, None).unwrap();
        let err = mm.kfree(PurposeTag::Net, ptr, None).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn kzalloc_zero_fills() {
        let r = region(4096);
        let regions = [r];
        let mm = Mm::new(&regions);
        let ptr = mm.kzalloc(PurposeTag::Cache, 16, None).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(ptr, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhausted_region_reports_no_memory() {
        let r = region(64);
        let regions = [r];
        let mm = Mm::new(&regions);
        assert!(mm.kalloc(PurposeTag::Kernel, 32, None).is_ok());
        assert!(mm.kalloc(PurposeTag::Kernel, 64, None).is_err());
    }

    #[test]
    fn unaligned_request_is_accounted_and_freed_as_the_same_aligned_size() {
        let r = region(4096);
        let regions = [r];
        let mm = Mm::new(&regions);
        let ptr = mm.kalloc(PurposeTag::Kernel, 5, None).unwrap();
        assert_eq!(mm.purpose_usage(PurposeTag::Kernel), ALIGN as i64);
        mm.kfree(PurposeTag::Kernel, ptr, None).unwrap();
        assert_eq!(mm.purpose_usage(PurposeTag::Kernel), 0);
    }

    #[test]
    fn module_accounting_tracks_per_module_totals() {
        let r = region(4096);
        let regions = [r];
        let mm = Mm::new(&regions);
        let ptr = mm.kalloc(PurposeTag::Module, 48, Some(3)).unwrap();
        assert_eq!(mm.module_usage(3), 48);
        mm.kfree(PurposeTag::Module, ptr, Some(3)).unwrap();
        assert_eq!(mm.module_usage(3), 0);
    }
}
