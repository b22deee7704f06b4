//! C7: segment allocator.
//!
//! The allocation kernel: routes a request to the bin manager for sizing,
//! then to the per-CPU cache (small, cacheable bins), the bin/chunk
//! directories (small, non-cacheable or cache-miss bins), or straight to
//! the chunk directory (large bins spanning whole chunks).
//!
//! Lock ordering is fixed and never reversed: `bin_dir` before `chunk_dir`.
//! `storage`'s lock is independent and only taken to grow or sync the
//! backing mapping, never while holding either directory lock.

use crate::bin_directory::BinDirectory;
use crate::bin_manager::{BinManager, BinNo};
use crate::chunk_directory::{ChunkDirectory, ChunkType};
use crate::config::{RuntimeConfig, CHUNK_SIZE, FREE_HINT_MIN_OBJECT_SIZE_PAGES};
use crate::error::{Error, Result};
use crate::object_cache::ObjectCache;
use crate::offset_ptr::{Offset, NULL_OFFSET};
use crate::os;
use crate::segment_storage::SegmentStorage;
use log::warn;
use parking_lot::Mutex;
use std::path::Path;

pub struct SegmentAllocator {
    bins: BinManager,
    storage: Mutex<SegmentStorage>,
    base: *mut u8,
    chunk_dir: Mutex<ChunkDirectory>,
    bin_dir: Mutex<BinDirectory>,
    cache: ObjectCache,
    config: RuntimeConfig,
}

// `base` is fixed for the lifetime of the mapping (extending the segment
// maps further blocks at higher addresses within the same reservation, it
// never remaps the base); every mutable access beyond that goes through
// one of the three mutexes above.
unsafe impl Send for SegmentAllocator {}
unsafe impl Sync for SegmentAllocator {}

impl SegmentAllocator {
    pub fn create(core_path: &Path, capacity: usize, config: RuntimeConfig) -> Result<Self> {
        let storage = SegmentStorage::create(&core_path.join("segment"), capacity)?;
        Ok(Self::from_parts(storage, BinManager::new(), ChunkDirectory::new(), config))
    }

    pub fn open(core_path: &Path, capacity_hint: usize, read_only: bool, config: RuntimeConfig) -> Result<Self> {
        let storage = SegmentStorage::open(&core_path.join("segment"), capacity_hint, read_only)?;
        let bins = BinManager::new();
        let chunk_dir_path = core_path.join("chunk_directory");
        let bin_dir_path = core_path.join("non_full_chunk_bin");
        let chunk_dir = if chunk_dir_path.exists() {
            ChunkDirectory::deserialize(&chunk_dir_path, &bins)?
        } else {
            ChunkDirectory::new()
        };
        let mut allocator = Self::from_parts(storage, bins, chunk_dir, config.clone());
        if bin_dir_path.exists() {
            let bin_dir = BinDirectory::deserialize(&bin_dir_path, allocator.bins.num_small_bins(), config.sorted_bin)?;
            allocator.bin_dir = Mutex::new(bin_dir);
        }
        Ok(allocator)
    }

    fn from_parts(storage: SegmentStorage, bins: BinManager, chunk_dir: ChunkDirectory, config: RuntimeConfig) -> Self {
        let base = storage.segment_base();
        let cache = ObjectCache::new(&bins, config.caches_per_cpu);
        let bin_dir = BinDirectory::new(bins.num_small_bins(), config.sorted_bin);
        SegmentAllocator { bins, storage: Mutex::new(storage), base, chunk_dir: Mutex::new(chunk_dir), bin_dir: Mutex::new(bin_dir), cache, config }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn bins(&self) -> &BinManager {
        &self.bins
    }

    /// Best-effort allocation; returns `NULL_OFFSET` on failure rather than
    /// an `Err` (§D: matches the source's sentinel-return contract so
    /// callers can test-and-branch without unwrapping a `Result` on the hot
    /// path). Failures are still logged.
    pub fn allocate(&self, nbytes: usize) -> Offset {
        match self.try_allocate(nbytes) {
            Ok(offset) => offset,
            Err(e) => {
                warn!("allocate({}) failed: {}", nbytes, e);
                NULL_OFFSET
            }
        }
    }

    pub fn allocate_aligned(&self, nbytes: usize, alignment: usize) -> Offset {
        match self.try_allocate_aligned(nbytes, alignment) {
            Ok(offset) => offset,
            Err(e) => {
                warn!("allocate_aligned({}, {}) failed: {}", nbytes, alignment, e);
                NULL_OFFSET
            }
        }
    }

    fn try_allocate(&self, nbytes: usize) -> Result<Offset> {
        if nbytes == 0 {
            return Err(Error::InvalidArgument("allocate(0)".into()));
        }
        let bin_no = self.bins.to_bin_no(nbytes);
        self.allocate_bin(bin_no)
    }

    fn try_allocate_aligned(&self, nbytes: usize, alignment: usize) -> Result<Offset> {
        if nbytes == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!("allocate_aligned({}, {})", nbytes, alignment)));
        }
        let bin_no = self
            .pick_aligned_bin(nbytes, alignment)
            .ok_or_else(|| Error::InvalidArgument(format!("no bin satisfies alignment {}", alignment)))?;
        self.allocate_bin(bin_no)
    }

    fn pick_aligned_bin(&self, nbytes: usize, alignment: usize) -> Option<BinNo> {
        let start = self.bins.to_bin_no(nbytes.max(alignment));
        for b in start..self.bins.num_bins() as BinNo {
            if self.bins.to_object_size(b) % alignment == 0 {
                return Some(b);
            }
        }
        None
    }

    fn allocate_bin(&self, bin_no: BinNo) -> Result<Offset> {
        if !self.bins.is_small_bin(bin_no) {
            return self.allocate_large(bin_no);
        }
        if self.config.disable_concurrency || !self.cache.is_cacheable(bin_no) {
            return self.allocate_small_direct(bin_no);
        }
        let object_size = self.bins.to_object_size(bin_no);
        let object_size_of = |b: BinNo| self.bins.to_object_size(b);
        let offset = self.cache.pop(
            bin_no,
            object_size,
            crate::config::CACHE_BLOCK_CAPACITY,
            object_size_of,
            || self.allocate_small_direct(bin_no).ok(),
            |o| self.deallocate_small_direct(o),
        );
        offset.ok_or(Error::OutOfSpace { requested: object_size, available: 0 })
    }

    fn allocate_small_direct(&self, bin_no: BinNo) -> Result<Offset> {
        loop {
            let mut bin_dir = self.bin_dir.lock();
            let mut chunk_dir = self.chunk_dir.lock();

            if let Some(chunk_no) = bin_dir.front(bin_no) {
                match chunk_dir.find_and_mark_slot(chunk_no) {
                    Some(slot_no) => {
                        if chunk_dir.all_slots_marked(chunk_no) {
                            bin_dir.pop(bin_no);
                        }
                        let size = self.bins.to_object_size(bin_no);
                        return Ok((chunk_no * CHUNK_SIZE) as Offset + (slot_no * size) as Offset);
                    }
                    None => {
                        // stale: bin_dir said non-full but the chunk has no
                        // free slots left (can happen after a crash-free
                        // path inconsistency never occurs in practice, but
                        // keep this defensive drop for safety).
                        bin_dir.pop(bin_no);
                        continue;
                    }
                }
            }

            let chunk_no = chunk_dir.insert_small(bin_no, &self.bins)?;
            bin_dir.insert(bin_no, chunk_no);
            drop(chunk_dir);
            drop(bin_dir);

            if let Err(e) = self.ensure_backed(chunk_no, 1) {
                let mut bin_dir = self.bin_dir.lock();
                let mut chunk_dir = self.chunk_dir.lock();
                chunk_dir.erase(chunk_no);
                bin_dir.erase(bin_no, chunk_no);
                return Err(e);
            }
        }
    }

    fn allocate_large(&self, bin_no: BinNo) -> Result<Offset> {
        let n = self.bins.chunks_per_large_bin(bin_no);
        let head = {
            let mut chunk_dir = self.chunk_dir.lock();
            chunk_dir.insert_large(bin_no, &self.bins)?
        };

        if let Err(e) = self.ensure_backed(head, n) {
            self.chunk_dir.lock().erase(head);
            return Err(e);
        }
        Ok((head * CHUNK_SIZE) as Offset)
    }

    /// Ensures storage is mapped far enough to cover chunks
    /// `[chunk_no, chunk_no + n)`, growing it if necessary. Must run with
    /// neither directory lock held (`storage`'s lock is independent, see
    /// the module docs). `extend`'s argument is header-inclusive, same as
    /// `mapped_size`/`reserved`; `header = reserved - capacity` recovers
    /// that offset without needing `HEADER_SIZE` itself public.
    fn ensure_backed(&self, chunk_no: usize, n: usize) -> Result<()> {
        let mut storage = self.storage.lock();
        let header = storage.reserved() - storage.capacity();
        let needed = header + (chunk_no + n) * CHUNK_SIZE;
        if needed <= storage.mapped_size() {
            return Ok(());
        }
        storage.extend(needed)
    }

    pub fn deallocate(&self, offset: Offset) {
        if offset == NULL_OFFSET {
            return;
        }
        let chunk_no = offset as usize / CHUNK_SIZE;
        let bin_no = {
            let chunk_dir = self.chunk_dir.lock();
            chunk_dir.bin_no(chunk_no)
        };
        if self.bins.is_small_bin(bin_no) && !self.config.disable_concurrency && self.cache.is_cacheable(bin_no) {
            let object_size = self.bins.to_object_size(bin_no);
            let object_size_of = |b: BinNo| self.bins.to_object_size(b);
            self.cache.push(bin_no, offset, object_size, object_size_of, |o| self.deallocate_small_direct(o));
        } else if self.bins.is_small_bin(bin_no) {
            self.deallocate_small_direct(offset);
        } else {
            self.deallocate_large(offset, chunk_no);
        }
    }

    fn deallocate_small_direct(&self, offset: Offset) {
        let chunk_no = offset as usize / CHUNK_SIZE;
        let within = offset as usize % CHUNK_SIZE;
        let mut bin_dir = self.bin_dir.lock();
        let mut chunk_dir = self.chunk_dir.lock();
        debug_assert_eq!(chunk_dir.kind(chunk_no), ChunkType::Small);
        let bin_no = chunk_dir.bin_no(chunk_no);
        let object_size = self.bins.to_object_size(bin_no);
        let slot_no = within / object_size;
        let was_full = chunk_dir.all_slots_marked(chunk_no);
        chunk_dir.unmark_slot(chunk_no, slot_no);
        let became_empty = chunk_dir.all_slots_unmarked(chunk_no);

        if became_empty {
            chunk_dir.erase(chunk_no);
            bin_dir.erase(bin_no, chunk_no);
        } else if was_full {
            bin_dir.insert(bin_no, chunk_no);
        }
        drop(chunk_dir);
        drop(bin_dir);

        if self.config.disable_free_file_space {
            return;
        }
        if became_empty {
            // Baseline reclaim (§4.7): a chunk with no live slots always
            // hands its pages back, regardless of the per-slot hint below.
            self.storage.lock().free_region((chunk_no * CHUNK_SIZE) as i64, CHUNK_SIZE);
        } else if self.config.free_small_object_size_hint {
            let pages = object_size / os::page_size().max(1);
            if pages >= FREE_HINT_MIN_OBJECT_SIZE_PAGES {
                let slot_offset = (chunk_no * CHUNK_SIZE + slot_no * object_size) as i64;
                self.storage.lock().free_region(slot_offset, object_size);
            }
        }
    }

    fn deallocate_large(&self, offset: Offset, chunk_no: usize) {
        let freed_bytes = {
            let mut chunk_dir = self.chunk_dir.lock();
            debug_assert_eq!(chunk_dir.kind(chunk_no), ChunkType::LargeHead);
            let (_bin_no, n) = chunk_dir.erase(chunk_no);
            n * CHUNK_SIZE
        };
        if !self.config.disable_free_file_space {
            self.storage.lock().free_region(offset, freed_bytes);
        }
    }

    /// Flushes every per-CPU cache back through the direct deallocation
    /// path so `chunk_dir`/`bin_dir` reflect every free object before
    /// persisting them. Must be called before `serialize`.
    pub fn drain_caches(&self) {
        let object_size_of = |b: BinNo| self.bins.to_object_size(b);
        self.cache.clear(object_size_of, |o| self.deallocate_small_direct(o));
    }

    pub fn sync(&self, durable: bool) -> Result<()> {
        self.storage.lock().sync(durable)
    }

    pub fn size(&self) -> usize {
        self.storage.lock().size()
    }

    pub fn capacity(&self) -> usize {
        self.storage.lock().capacity()
    }

    pub fn is_read_only(&self) -> bool {
        self.storage.lock().is_read_only()
    }

    pub fn serialize(&self, core_path: &Path) -> Result<()> {
        self.drain_caches();
        let chunk_dir = self.chunk_dir.lock();
        let bin_dir = self.bin_dir.lock();
        chunk_dir.serialize(&core_path.join("chunk_directory"))?;
        bin_dir.serialize(&core_path.join("non_full_chunk_bin"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_deallocate_small_object_reuses_offset() {
        let dir = tempdir().unwrap();
        let alloc = SegmentAllocator::create(dir.path(), 64 * 1024 * 1024, RuntimeConfig { disable_concurrency: true, ..Default::default() }).unwrap();
        let a = alloc.allocate(32);
        assert_ne!(a, NULL_OFFSET);
        alloc.deallocate(a);
        let b = alloc.allocate(32);
        assert_ne!(b, NULL_OFFSET);
    }

    #[test]
    fn allocate_large_spans_whole_chunks() {
        let dir = tempdir().unwrap();
        let alloc = SegmentAllocator::create(dir.path(), 64 * 1024 * 1024, RuntimeConfig::default()).unwrap();
        let big = alloc.allocate(CHUNK_SIZE * 2);
        assert_ne!(big, NULL_OFFSET);
        assert_eq!(big as usize % CHUNK_SIZE, 0);
        alloc.deallocate(big);
    }

    #[test]
    fn allocate_aligned_respects_alignment() {
        let dir = tempdir().unwrap();
        let alloc = SegmentAllocator::create(dir.path(), 64 * 1024 * 1024, RuntimeConfig::default()).unwrap();
        let offset = alloc.allocate_aligned(100, 256);
        assert_ne!(offset, NULL_OFFSET);
        assert_eq!(offset as usize % 256, 0);
    }

    #[test]
    fn allocations_beyond_the_first_block_are_backed_by_mapped_storage() {
        // BLOCK_SIZE is 256 MiB; drive the allocator well past it and write
        // through every returned offset. A chunk handed out without storage
        // grown to cover it would fault here instead of merely returning a
        // bad-looking offset.
        let dir = tempdir().unwrap();
        let alloc = SegmentAllocator::create(
            dir.path(),
            1024 * 1024 * 1024,
            RuntimeConfig { disable_concurrency: true, ..Default::default() },
        )
        .unwrap();

        let mut offsets = Vec::new();
        for _ in 0..600 {
            let offset = alloc.allocate(CHUNK_SIZE);
            assert_ne!(offset, NULL_OFFSET);
            let ptr = unsafe { alloc.base().offset(offset as isize) as *mut u64 };
            unsafe { ptr.write(offset as u64) };
            offsets.push(offset);
        }
        for &offset in &offsets {
            let ptr = unsafe { alloc.base().offset(offset as isize) as *const u64 };
            assert_eq!(unsafe { ptr.read() }, offset as u64);
        }
        assert!(alloc.size() > 256 * 1024 * 1024, "storage should have grown past the first block");
    }

    #[test]
    fn serialize_after_drain_reflects_live_allocations() {
        let dir = tempdir().unwrap();
        let alloc = SegmentAllocator::create(dir.path(), 64 * 1024 * 1024, RuntimeConfig::default()).unwrap();
        let _live = alloc.allocate(32);
        alloc.serialize(dir.path()).unwrap();
        assert!(dir.path().join("chunk_directory").exists());
        assert!(dir.path().join("non_full_chunk_bin").exists());
    }
}
