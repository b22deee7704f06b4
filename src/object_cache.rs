//! C6: per-CPU object cache.
//!
//! Fronts small-object allocation with a bounded, per-CPU, bin-indexed LIFO
//! stash of free offsets, batching refills from (and drains to) the global
//! segment allocator. Cache blocks are stored in a flat arena indexed by
//! `BlockId` rather than linked via raw pointers (§9 design note): eviction
//! and the free-block pool become index bookkeeping instead of pointer
//! surgery, and nothing is touched until a block is actually claimed.

use crate::bin_manager::BinNo;
use crate::config::{CACHE_BLOCK_CAPACITY, CPU_NUM_CACHE_TTL, MAX_PER_CPU_CACHE_SIZE};
use crate::offset_ptr::Offset;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A bin above this size bypasses the cache entirely and goes straight to
/// the global allocator; caching large batches of big objects would blow
/// the per-cache byte budget for no benefit.
const MIN_BLOCKS_PER_BIN: usize = 4;

pub fn max_cacheable_bin(bins: &crate::bin_manager::BinManager) -> BinNo {
    let mut best: BinNo = 0;
    for b in 0..bins.num_small_bins() as BinNo {
        let size = bins.to_object_size(b);
        if CACHE_BLOCK_CAPACITY * size * MIN_BLOCKS_PER_BIN <= MAX_PER_CPU_CACHE_SIZE {
            best = b;
        }
    }
    best
}

type BlockId = usize;

struct CacheBlock {
    bin_no: BinNo,
    items: [Offset; CACHE_BLOCK_CAPACITY],
    count: usize,
    age_prev: Option<BlockId>,
    age_next: Option<BlockId>,
    bin_prev: Option<BlockId>,
    bin_next: Option<BlockId>,
}

impl CacheBlock {
    fn new() -> Self {
        CacheBlock {
            bin_no: 0,
            items: [0; CACHE_BLOCK_CAPACITY],
            count: 0,
            age_prev: None,
            age_next: None,
            bin_prev: None,
            bin_next: None,
        }
    }
}

struct PerCache {
    blocks: Vec<CacheBlock>,
    free_list: Vec<BlockId>,
    /// Head of each bin's chain: the active (possibly partial) block.
    active: Vec<Option<BlockId>>,
    age_head: Option<BlockId>, // newest
    age_tail: Option<BlockId>, // oldest
    total_bytes: usize,
}

impl PerCache {
    fn new(num_cacheable_bins: usize) -> Self {
        PerCache {
            blocks: Vec::new(),
            free_list: Vec::new(),
            active: vec![None; num_cacheable_bins],
            age_head: None,
            age_tail: None,
            total_bytes: 0,
        }
    }

    fn claim_block(&mut self) -> BlockId {
        if let Some(id) = self.free_list.pop() {
            id
        } else {
            self.blocks.push(CacheBlock::new());
            self.blocks.len() - 1
        }
    }

    fn age_link_front(&mut self, id: BlockId) {
        self.blocks[id].age_prev = None;
        self.blocks[id].age_next = self.age_head;
        if let Some(head) = self.age_head {
            self.blocks[head].age_prev = Some(id);
        }
        self.age_head = Some(id);
        if self.age_tail.is_none() {
            self.age_tail = Some(id);
        }
    }

    fn age_unlink(&mut self, id: BlockId) {
        let (prev, next) = (self.blocks[id].age_prev, self.blocks[id].age_next);
        match prev {
            Some(p) => self.blocks[p].age_next = next,
            None => self.age_head = next,
        }
        match next {
            Some(n) => self.blocks[n].age_prev = prev,
            None => self.age_tail = prev,
        }
        self.blocks[id].age_prev = None;
        self.blocks[id].age_next = None;
    }

    /// Makes a freshly claimed block the new active block for `bin_no`,
    /// pushing the previous active block (now necessarily full, or there
    /// was none) one step back in the bin chain.
    fn install_active(&mut self, bin_no: BinNo, id: BlockId) {
        let prev_active = self.active[bin_no as usize];
        self.blocks[id].bin_no = bin_no;
        self.blocks[id].bin_prev = None;
        self.blocks[id].bin_next = prev_active;
        if let Some(p) = prev_active {
            self.blocks[p].bin_prev = Some(id);
        }
        self.active[bin_no as usize] = Some(id);
        self.age_link_front(id);
    }

    fn evict_oldest(&mut self, object_size_of: impl Fn(BinNo) -> usize, mut dealloc: impl FnMut(Offset)) -> bool {
        let id = match self.age_tail {
            Some(id) => id,
            None => return false,
        };
        self.age_unlink(id);
        let bin_no = self.blocks[id].bin_no;
        if self.active[bin_no as usize] == Some(id) {
            self.active[bin_no as usize] = self.blocks[id].bin_next;
        }
        // unlink from bin chain
        let (bp, bn) = (self.blocks[id].bin_prev, self.blocks[id].bin_next);
        if let Some(p) = bp {
            self.blocks[p].bin_next = bn;
        }
        if let Some(n) = bn {
            self.blocks[n].bin_prev = bp;
        }
        let count = self.blocks[id].count;
        let size = object_size_of(bin_no);
        for i in 0..count {
            dealloc(self.blocks[id].items[i]);
        }
        self.total_bytes = self.total_bytes.saturating_sub(count * size);
        self.blocks[id].count = 0;
        self.blocks[id].bin_prev = None;
        self.blocks[id].bin_next = None;
        self.free_list.push(id);
        true
    }

    fn make_room(
        &mut self,
        additional_bytes: usize,
        object_size_of: impl Fn(BinNo) -> usize + Copy,
        mut dealloc: impl FnMut(Offset),
    ) {
        while self.total_bytes + additional_bytes > MAX_PER_CPU_CACHE_SIZE {
            if !self.evict_oldest(object_size_of, &mut dealloc) {
                break;
            }
        }
    }
}

pub struct ObjectCache {
    caches: Vec<Mutex<PerCache>>,
    num_cacheable_bins: usize,
    caches_per_cpu: usize,
}

thread_local! {
    static CPU_HINT: Cell<(usize, u32)> = Cell::new((0, 0));
}

fn current_cpu_no() -> usize {
    CPU_HINT.with(|hint| {
        let (cpu, ttl) = hint.get();
        if ttl > 0 {
            hint.set((cpu, ttl - 1));
            return cpu;
        }
        let fresh = read_cpu_no();
        hint.set((fresh, CPU_NUM_CACHE_TTL));
        fresh
    })
}

#[cfg(target_os = "linux")]
fn read_cpu_no() -> usize {
    let rc = unsafe { libc::sched_getcpu() };
    if rc < 0 {
        thread_hash()
    } else {
        rc as usize
    }
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_no() -> usize {
    thread_hash()
}

fn thread_hash() -> usize {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

impl ObjectCache {
    pub fn new(bins: &crate::bin_manager::BinManager, caches_per_cpu: usize) -> Self {
        let num_cpus = num_cpus::get().max(1);
        let num_caches = num_cpus * caches_per_cpu.max(1);
        let num_cacheable_bins = max_cacheable_bin(bins) as usize + 1;
        ObjectCache {
            caches: (0..num_caches).map(|_| Mutex::new(PerCache::new(num_cacheable_bins))).collect(),
            num_cacheable_bins,
            caches_per_cpu: caches_per_cpu.max(1),
        }
    }

    pub fn is_cacheable(&self, bin_no: BinNo) -> bool {
        (bin_no as usize) < self.num_cacheable_bins
    }

    fn cache_no(&self) -> usize {
        let cpu = current_cpu_no();
        let t = thread_hash() % self.caches_per_cpu;
        (cpu * self.caches_per_cpu + t) % self.caches.len()
    }

    /// Pops a free offset for `bin_no`, refilling from the global
    /// allocator (via `alloc_one`, called up to `batch_size` times) on a
    /// miss. `object_size` is `bin`'s canonical size, used for budget
    /// accounting.
    pub fn pop(
        &self,
        bin_no: BinNo,
        object_size: usize,
        batch_size: usize,
        object_size_of: impl Fn(BinNo) -> usize + Copy,
        mut alloc_one: impl FnMut() -> Option<Offset>,
        mut dealloc_one: impl FnMut(Offset),
    ) -> Option<Offset> {
        debug_assert!(self.is_cacheable(bin_no));
        let mut cache = self.caches[self.cache_no()].lock();

        loop {
            if let Some(active_id) = cache.active[bin_no as usize] {
                if cache.blocks[active_id].count > 0 {
                    let c = &mut cache.blocks[active_id];
                    c.count -= 1;
                    let offset = c.items[c.count];
                    cache.total_bytes = cache.total_bytes.saturating_sub(object_size);
                    return Some(offset);
                }
                // active is drained: drop it and fall through to the next
                // older block of this bin, or a refill.
                let next = cache.blocks[active_id].bin_next;
                cache.age_unlink(active_id);
                cache.blocks[active_id].bin_prev = None;
                cache.blocks[active_id].bin_next = None;
                cache.free_list.push(active_id);
                cache.active[bin_no as usize] = next;
                if let Some(n) = next {
                    cache.blocks[n].bin_prev = None;
                }
                if next.is_some() {
                    continue;
                }
            }

            // No block at all for this bin: refill from the global allocator.
            let batch_bytes = batch_size * object_size;
            cache.make_room(batch_bytes, object_size_of, &mut dealloc_one);
            let id = cache.claim_block();
            cache.install_active(bin_no, id);
            let mut filled = 0;
            for _ in 0..batch_size.min(CACHE_BLOCK_CAPACITY) {
                match alloc_one() {
                    Some(off) => {
                        cache.blocks[id].items[filled] = off;
                        filled += 1;
                    }
                    None => break,
                }
            }
            cache.blocks[id].count = filled;
            cache.total_bytes += filled * object_size;
            if filled == 0 {
                return None;
            }
            continue;
        }
    }

    pub fn push(
        &self,
        bin_no: BinNo,
        offset: Offset,
        object_size: usize,
        object_size_of: impl Fn(BinNo) -> usize + Copy,
        mut dealloc_one: impl FnMut(Offset),
    ) {
        debug_assert!(self.is_cacheable(bin_no));
        let mut cache = self.caches[self.cache_no()].lock();
        cache.make_room(object_size, object_size_of, &mut dealloc_one);

        let needs_new_block = match cache.active[bin_no as usize] {
            Some(id) => cache.blocks[id].count >= CACHE_BLOCK_CAPACITY,
            None => true,
        };
        if needs_new_block {
            let id = cache.claim_block();
            cache.install_active(bin_no, id);
        }
        let id = cache.active[bin_no as usize].unwrap();
        let count = cache.blocks[id].count;
        cache.blocks[id].items[count] = offset;
        cache.blocks[id].count += 1;
        cache.total_bytes += object_size;
    }

    /// Drains every cache, bulk-deallocating all cached offsets back to
    /// the global allocator. Called before `serialize` (§4.7) so no live
    /// allocation is hidden inside a cache at close time.
    pub fn clear(&self, object_size_of: impl Fn(BinNo) -> usize + Copy, mut dealloc_one: impl FnMut(Offset)) {
        for cache_mutex in &self.caches {
            let mut cache = cache_mutex.lock();
            while cache.evict_oldest(object_size_of, &mut dealloc_one) {}
            for slot in cache.active.iter_mut() {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_manager::BinManager;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn pop_refills_then_push_reuses() {
        let bins = BinManager::new();
        let cache = ObjectCache::new(&bins, 1);
        let bin_no = bins.to_bin_no(16);
        let size = bins.to_object_size(bin_no);
        let next_offset = AtomicI64::new(0);
        let freed: StdMutex<Vec<i64>> = StdMutex::new(Vec::new());

        let object_size_of = |_b: BinNo| size;
        let alloc_one = || Some(next_offset.fetch_add(size as i64, Ordering::Relaxed));
        let dealloc_one = |o: i64| freed.lock().unwrap().push(o);

        let a = cache.pop(bin_no, size, 8, object_size_of, alloc_one, dealloc_one).unwrap();
        let b = cache.pop(bin_no, size, 8, object_size_of, alloc_one, dealloc_one).unwrap();
        assert_ne!(a, b);

        cache.push(bin_no, a, size, object_size_of, dealloc_one);
        let c = cache.pop(bin_no, size, 8, object_size_of, alloc_one, dealloc_one).unwrap();
        assert_eq!(c, a, "pushed offset should be reused before a fresh allocation");
    }

    #[test]
    fn clear_drains_every_cached_offset() {
        let bins = BinManager::new();
        let cache = ObjectCache::new(&bins, 1);
        let bin_no = bins.to_bin_no(16);
        let size = bins.to_object_size(bin_no);
        let next_offset = AtomicI64::new(0);
        let freed: StdMutex<Vec<i64>> = StdMutex::new(Vec::new());
        let object_size_of = |_b: BinNo| size;
        let alloc_one = || Some(next_offset.fetch_add(size as i64, Ordering::Relaxed));

        for _ in 0..20 {
            cache.pop(bin_no, size, 8, object_size_of, alloc_one, |o| freed.lock().unwrap().push(o));
        }
        cache.clear(object_size_of, |o| freed.lock().unwrap().push(o));
        // every offset handed out by alloc_one that wasn't separately
        // freed by the test itself ends up back in `freed` after clear.
        assert!(!freed.lock().unwrap().is_empty());
    }
}
