//! Block cache
//!
//! Fixed-capacity, write-back cache of filesystem blocks sitting between the
//! ext2 engine and the [`BlockAdapter`].
//!
//! ```text
//! CacheInner
//!   ├── lines: Vec<CacheLine>   (at most `capacity`, linear lookup)
//!   ├── clock: u64              (logical LRU clock)
//!   └── stats: CacheStats
//! ```
//!
//! `get` copies a line out; `put` replaces a line and marks it dirty. A
//! dirty line reaches the device only when it is chosen as an eviction
//! victim or on [`BlockCache::flush_all`]. The victim is a free slot while
//! the cache is not full, otherwise the line with the lowest `last_use`.

use alloc::vec;
use alloc::vec::Vec;
use block::{BlockAdapter, BlockError};
use core::fmt;
use log::trace;
use spin::Mutex;

/// Cache failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Reading a missing block from the device failed
    Read(BlockError),
    /// Writing a dirty line back to the device failed
    WriteBack { block: u32, err: BlockError },
    /// Device cache flush failed after all lines were written
    Flush(BlockError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Read(e) => write!(f, "block read failed: {}", e),
            CacheError::WriteBack { block, err } => {
                write!(f, "write-back of block {} failed: {}", block, err)
            }
            CacheError::Flush(e) => write!(f, "device flush failed: {}", e),
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

struct CacheLine {
    block: u32,
    last_use: u64,
    dirty: bool,
    data: Vec<u8>,
}

struct CacheInner {
    lines: Vec<CacheLine>,
    clock: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&self, block: u32) -> Option<usize> {
        self.lines.iter().position(|l| l.block == block)
    }
}

pub struct BlockCache {
    adapter: BlockAdapter,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(adapter: BlockAdapter, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            adapter,
            capacity,
            inner: Mutex::new(CacheInner {
                lines: Vec::with_capacity(capacity),
                clock: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.adapter.block_size() as usize
    }

    pub fn adapter(&self) -> &BlockAdapter {
        &self.adapter
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Number of dirty lines.
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().lines.iter().filter(|l| l.dirty).count()
    }

    /// Copy block `block` into `buf` (one block long).
    pub fn get(&self, block: u32, buf: &mut [u8]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let now = inner.tick();

        if let Some(idx) = inner.lookup(block) {
            inner.stats.hits += 1;
            let line = &mut inner.lines[idx];
            line.last_use = now;
            buf.copy_from_slice(&line.data);
            return Ok(());
        }

        inner.stats.misses += 1;
        self.adapter
            .read_block(block as u64, buf)
            .map_err(CacheError::Read)?;
        let idx = self.claim_slot(&mut inner)?;
        let line = &mut inner.lines[idx];
        line.block = block;
        line.last_use = now;
        line.dirty = false;
        line.data.copy_from_slice(buf);
        Ok(())
    }

    /// Convenience wrapper around [`BlockCache::get`] returning a fresh buffer.
    pub fn read(&self, block: u32) -> Result<Vec<u8>, CacheError> {
        let mut buf = vec![0u8; self.block_size()];
        self.get(block, &mut buf)?;
        Ok(buf)
    }

    /// Replace the contents of `block` and mark it dirty.
    pub fn put(&self, block: u32, data: &[u8]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let now = inner.tick();

        let idx = match inner.lookup(block) {
            Some(idx) => idx,
            None => self.claim_slot(&mut inner)?,
        };
        let line = &mut inner.lines[idx];
        line.block = block;
        line.last_use = now;
        line.dirty = true;
        line.data.copy_from_slice(data);
        Ok(())
    }

    /// Write every dirty line back, then flush the device. Returns the
    /// number of lines written.
    pub fn flush_all(&self) -> Result<usize, CacheError> {
        let mut inner = self.inner.lock();
        let mut order: Vec<usize> = (0..inner.lines.len())
            .filter(|&i| inner.lines[i].dirty)
            .collect();
        order.sort_by_key(|&i| inner.lines[i].block);

        for &idx in &order {
            let line = &inner.lines[idx];
            self.adapter
                .write_block(line.block as u64, &line.data)
                .map_err(|err| CacheError::WriteBack {
                    block: line.block,
                    err,
                })?;
            inner.lines[idx].dirty = false;
            inner.stats.writebacks += 1;
        }

        self.adapter.flush().map_err(CacheError::Flush)?;
        Ok(order.len())
    }

    /// Slot for a new block: a fresh line while below capacity, otherwise
    /// the least recently used line, written back first if dirty.
    fn claim_slot(&self, inner: &mut CacheInner) -> Result<usize, CacheError> {
        if inner.lines.len() < self.capacity {
            inner.lines.push(CacheLine {
                block: 0,
                last_use: 0,
                dirty: false,
                data: vec![0u8; self.block_size()],
            });
            return Ok(inner.lines.len() - 1);
        }

        let victim = inner
            .lines
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| l.last_use)
            .map(|(i, _)| i)
            .unwrap_or(0);

        let line = &inner.lines[victim];
        if line.dirty {
            trace!("ext2: cache: writing back block {} on eviction", line.block);
            self.adapter
                .write_block(line.block as u64, &line.data)
                .map_err(|err| CacheError::WriteBack {
                    block: line.block,
                    err,
                })?;
            inner.stats.writebacks += 1;
            inner.lines[victim].dirty = false;
        }
        inner.stats.evictions += 1;
        Ok(victim)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::sync::Arc;
    use block::{BlockDevice, RamDisk};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Device wrapper counting transfers and optionally failing writes.
    pub(crate) struct Probe {
        pub inner: Arc<RamDisk>,
        pub reads: AtomicUsize,
        pub writes: AtomicUsize,
        pub fail_writes: AtomicBool,
    }

    impl Probe {
        pub fn new(inner: Arc<RamDisk>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
            })
        }
    }

    impl BlockDevice for Probe {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn sector_size(&self) -> u32 {
            self.inner.sector_size()
        }
        fn capacity_sectors(&self) -> u64 {
            self.inner.capacity_sectors()
        }
        fn read_sync(&self, sector: u64, buf: &mut [u8]) -> Result<usize, BlockError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_sync(sector, buf)
        }
        fn write_sync(&self, sector: u64, buf: &[u8]) -> Result<usize, BlockError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BlockError::Io);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write_sync(sector, buf)
        }
        fn flush(&self) -> Result<(), BlockError> {
            Ok(())
        }
    }

    fn cache(capacity: usize) -> (BlockCache, Arc<Probe>) {
        let probe = Probe::new(Arc::new(RamDisk::zeroed("cache0", 64 * 1024)));
        let adapter = BlockAdapter::new(probe.clone(), 1024, 0).unwrap();
        (BlockCache::new(adapter, capacity), probe)
    }

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; 1024]
    }

    #[test]
    fn test_get_after_put_returns_last_put() {
        let (cache, probe) = cache(4);
        cache.put(3, &block(0x11)).unwrap();
        cache.get(1, &mut block(0)).unwrap();
        cache.get(2, &mut block(0)).unwrap();
        cache.put(3, &block(0x22)).unwrap();
        cache.get(4, &mut block(0)).unwrap();

        assert_eq!(cache.read(3).unwrap(), block(0x22));
        assert_eq!(probe.writes.load(Ordering::SeqCst), 0);
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn test_hits_do_not_touch_device() {
        let (cache, probe) = cache(2);
        cache.read(5).unwrap();
        cache.read(5).unwrap();
        cache.read(5).unwrap();
        assert_eq!(probe.reads.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (cache, probe) = cache(2);
        cache.read(1).unwrap();
        cache.read(2).unwrap();
        cache.read(1).unwrap(); // 2 is now the LRU line
        cache.read(3).unwrap();
        assert_eq!(cache.stats().evictions, 1);

        let before = probe.reads.load(Ordering::SeqCst);
        cache.read(1).unwrap();
        assert_eq!(probe.reads.load(Ordering::SeqCst), before);
        cache.read(2).unwrap();
        assert_eq!(probe.reads.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_dirty_victim_written_back() {
        let (cache, probe) = cache(1);
        cache.put(7, &block(0x77)).unwrap();
        assert_eq!(probe.inner.snapshot()[7 * 1024], 0);

        cache.read(8).unwrap();
        assert_eq!(probe.writes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.inner.snapshot()[7 * 1024], 0x77);
        assert_eq!(cache.read(7).unwrap(), block(0x77));
    }

    #[test]
    fn test_flush_all_writes_dirty_lines_once() {
        let (cache, probe) = cache(8);
        cache.put(1, &block(1)).unwrap();
        cache.put(2, &block(2)).unwrap();
        cache.read(3).unwrap();
        assert_eq!(cache.flush_all().unwrap(), 2);
        assert_eq!(cache.flush_all().unwrap(), 0);
        assert_eq!(probe.writes.load(Ordering::SeqCst), 2);
        assert_eq!(probe.inner.snapshot()[2 * 1024], 2);
    }

    #[test]
    fn test_write_back_failure_keeps_line_dirty() {
        let (cache, probe) = cache(1);
        cache.put(4, &block(0x44)).unwrap();
        probe.fail_writes.store(true, Ordering::SeqCst);

        let err = cache.read(5).unwrap_err();
        assert!(matches!(err, CacheError::WriteBack { block: 4, .. }));
        assert_eq!(cache.dirty_count(), 1);

        probe.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(cache.flush_all().unwrap(), 1);
        assert_eq!(probe.inner.snapshot()[4 * 1024], 0x44);
    }

    #[test]
    fn test_read_error_reported() {
        let (cache, _) = cache(2);
        let err = cache.read(1000).unwrap_err();
        assert!(matches!(err, CacheError::Read(_)));
    }
}
