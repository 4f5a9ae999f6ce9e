// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-level FS cache with write-back.
//!
//! One global list of cache blocks under one mutex, each keyed by
//! `(dev_id, block_index)`. Two write modes are offered per call: write
//! through (block marked clean, driver write completes before the call
//! returns) and write back (block marked dirty, write deferred to
//! [`Cache::sync`]). A `temperature` counter per block stands in for LRU:
//! every access bumps it, eviction always takes the coldest *clean* block
//! first so a dirty block is never silently dropped.

use heapless::Vec;

use dnx_abi::ErrorKind;

use crate::config::{CACHE_BLOCK_SIZE, CACHE_MAX_BLOCKS};
use crate::err::{KResult, KernelError};

/// The driver-facing side of a cache block: reads/writes one fixed-size
/// block of a backing device. A concrete block device (SD card, flash
/// translation layer) implements this and is handed to [`Cache::new`].
pub trait BlockBackend: Send + Sync {
    fn read_block(&self, dev_id: u32, block_index: u32, buf: &mut [u8; CACHE_BLOCK_SIZE]) -> KResult<()>;
    fn write_block(&self, dev_id: u32, block_index: u32, buf: &[u8; CACHE_BLOCK_SIZE]) -> KResult<()>;
}

struct Block {
    dev_id: u32,
    block_index: u32,
    data: [u8; CACHE_BLOCK_SIZE],
    dirty: bool,
    temperature: i32,
}

struct Inner {
    blocks: Vec<Block, CACHE_MAX_BLOCKS>,
    decay: i32,
}

/// The cache singleton.
pub struct Cache<'b> {
    backend: &'b dyn BlockBackend,
    inner: spin::Mutex<Inner>,
}

impl<'b> Cache<'b> {
    pub fn new(backend: &'b dyn BlockBackend) -> Self {
        Cache {
            backend,
            inner: spin::Mutex::new(Inner {
                blocks: Vec::new(),
                decay: 0,
            }),
        }
    }

    fn touch(inner: &mut Inner, index: usize) {
        inner.decay = inner.decay.saturating_sub(1);
        inner.blocks[index].temperature = inner.blocks[index].temperature.saturating_add(1) - inner.decay;
    }

    fn find(inner: &Inner, dev_id: u32, block_index: u32) -> Option<usize> {
        inner
            .blocks
            .iter()
            .position(|b| b.dev_id == dev_id && b.block_index == block_index)
    }

    /// Makes room for one more block by evicting the coldest clean block.
    /// Fails with `Busy` if every block is dirty — the caller is expected
    /// to schedule a sync and retry, or bypass the cache for this access.
    fn evict_one(&self, inner: &mut Inner) -> KResult<()> {
        let victim = inner
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.dirty)
            .min_by_key(|(_, b)| b.temperature)
            .map(|(i, _)| i);
        match victim {
            Some(index) => {
                inner.blocks.swap_remove(index);
                Ok(())
            }
            None => Err(KernelError::Recoverable(ErrorKind::Busy)),
        }
    }

    fn ensure_loaded(&self, inner: &mut Inner, dev_id: u32, block_index: u32) -> KResult<usize> {
        if let Some(index) = Self::find(inner, dev_id, block_index) {
            return Ok(index);
        }
        if inner.blocks.len() == CACHE_MAX_BLOCKS {
            self.evict_one(inner)?;
        }
        let mut data = [0u8; CACHE_BLOCK_SIZE];
        self.backend.read_block(dev_id, block_index, &mut data)?;
        inner
            .blocks
            .push(Block {
                dev_id,
                block_index,
                data,
                dirty: false,
                temperature: 0,
            })
            .map_err(|_| KernelError::Recoverable(ErrorKind::NoMemory))?;
        Ok(inner.blocks.len() - 1)
    }

    /// Reads `block_index` of `dev_id` into `out`, populating the cache on
    /// a miss.
    pub fn read(&self, dev_id: u32, block_index: u32, out: &mut [u8; CACHE_BLOCK_SIZE]) -> KResult<()> {
        let mut inner = self.inner.lock();
        let index = self.ensure_loaded(&mut inner, dev_id, block_index)?;
        *out = inner.blocks[index].data;
        Self::touch(&mut inner, index);
        Ok(())
    }

    /// Write-through: the driver write completes before this returns, and
    /// the block is left clean.
    pub fn write_through(&self, dev_id: u32, block_index: u32, data: &[u8; CACHE_BLOCK_SIZE]) -> KResult<()> {
        let mut inner = self.inner.lock();
        let index = self.ensure_loaded(&mut inner, dev_id, block_index)?;
        self.backend.write_block(dev_id, block_index, data)?;
        inner.blocks[index].data = *data;
        inner.blocks[index].dirty = false;
        Self::touch(&mut inner, index);
        Ok(())
    }

    /// Write-back: marks the block dirty and returns immediately. The
    /// driver write happens later, in [`Cache::sync`].
    pub fn write_back(&self, dev_id: u32, block_index: u32, data: &[u8; CACHE_BLOCK_SIZE]) -> KResult<()> {
        let mut inner = self.inner.lock();
        let index = self.ensure_loaded(&mut inner, dev_id, block_index)?;
        inner.blocks[index].data = *data;
        inner.blocks[index].dirty = true;
        Self::touch(&mut inner, index);
        Ok(())
    }

    /// Writes every dirty block back through the driver, clearing its
    /// dirty bit only once the driver acknowledges the write. A block
    /// whose write fails stays dirty and is retried on the next sync. The
    /// cache mutex is released between individual block writes so readers
    /// are never blocked for the whole sync. Returns how many blocks were
    /// written back successfully.
    pub fn sync(&self) -> usize {
        let mut index = 0;
        let mut written = 0;
        loop {
            let (dev_id, block_index, data) = {
                let inner = self.inner.lock();
                match inner.blocks.iter().skip(index).position(|b| b.dirty) {
                    Some(offset) => {
                        let block = &inner.blocks[index + offset];
                        index += offset;
                        (block.dev_id, block.block_index, block.data)
                    }
                    None => break,
                }
            };
            if self.backend.write_block(dev_id, block_index, &data).is_ok() {
                let mut inner = self.inner.lock();
                if let Some(found) = Self::find(&inner, dev_id, block_index) {
                    inner.blocks[found].dirty = false;
                }
                written += 1;
            }
            index += 1;
        }
        written
    }

    /// Discards every cached block without writing anything back. Used on
    /// panic/shutdown paths where the backing media may already be gone.
    pub fn drop_all(&self) {
        self.inner.lock().blocks.clear();
    }

    /// Evicts cold clean blocks until approximately `bytes` worth of cache
    /// space has been freed, or only dirty/warm blocks remain.
    pub fn reduce(&self, bytes: usize) {
        let target_blocks = bytes / CACHE_BLOCK_SIZE.max(1);
        let mut inner = self.inner.lock();
        for _ in 0..target_blocks {
            if self.evict_one(&mut inner).is_err() {
                break;
            }
        }
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::collections::BTreeMap;

    struct MemBackend {
        written: StdMutex<BTreeMap<(u32, u32), [u8; CACHE_BLOCK_SIZE]>>,
    }

    impl BlockBackend for MemBackend {
        fn read_block(&self, dev_id: u32, block_index: u32, buf: &mut [u8; CACHE_BLOCK_SIZE]) -> KResult<()> {
            if let Some(data) = self.written.lock().unwrap().get(&(dev_id, block_index)) {
                *buf = *data;
            } else {
                *buf = [0u8; CACHE_BLOCK_SIZE];
            }
            Ok(())
        }
        fn write_block(&self, dev_id: u32, block_index: u32, buf: &[u8; CACHE_BLOCK_SIZE]) -> KResult<()> {
            self.written.lock().unwrap().insert((dev_id, block_index), *buf);
            Ok(())
        }
    }

    #[test]
    fn write_back_defers_the_driver_write_until_sync() {
        let backend = MemBackend {
            written: StdMutex::new(BTreeMap::new()),
        };
        let cache = Cache::new(&backend);
        let data = [7u8; CACHE_BLOCK_SIZE];
        cache.write_back(0, 0, &data).unwrap();
        assert!(backend.written.lock().unwrap().get(&(0, 0)).is_none());
        cache.sync();
        assert_eq!(backend.written.lock().unwrap().get(&(0, 0)), Some(&data));
    }

    #[test]
    fn write_through_writes_immediately_and_read_hits_cache() {
        let backend = MemBackend {
            written: StdMutex::new(BTreeMap::new()),
        };
        let cache = Cache::new(&backend);
        let data = [3u8; CACHE_BLOCK_SIZE];
        cache.write_through(1, 5, &data).unwrap();
        assert_eq!(backend.written.lock().unwrap().get(&(1, 5)), Some(&data));

        let mut out = [0u8; CACHE_BLOCK_SIZE];
        cache.read(1, 5, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn eviction_never_drops_a_dirty_block() {
        let backend = MemBackend {
            written: StdMutex::new(BTreeMap::new()),
        };
        let cache = Cache::new(&backend);
        let data = [1u8; CACHE_BLOCK_SIZE];
        for i in 0..CACHE_MAX_BLOCKS as u32 {
            cache.write_back(0, i, &data).unwrap();
        }
        assert_eq!(cache.block_count(), CACHE_MAX_BLOCKS);

        let mut out = [0u8; CACHE_BLOCK_SIZE];
        assert!(cache.read(0, CACHE_MAX_BLOCKS as u32, &mut out).is_err());
        cache.sync();
        assert!(cache.read(0, CACHE_MAX_BLOCKS as u32, &mut out).is_ok());
    }
}
