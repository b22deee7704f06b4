//! Tunable constants (§6) and the small runtime configuration layer built on
//! top of them.
//!
//! The teacher (`mimalloc-rs`) picks its segment/page sizes as compile-time
//! constants derived with `<<` from a handful of shift constants; the same
//! style is kept here, just re-targeted at chunk/block sizes instead of
//! segment/page sizes.

/// Page-aligned subdivision of the segment; the smallest unit tracked by the
/// chunk directory. 2 MiB by default.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Size of one backing block file. 256 MiB by default.
pub const BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound on a datastore's virtual address reservation.
pub const MAX_CAPACITY: usize = 128usize * 1024 * 1024 * 1024 * 1024;

/// Default capacity used by `create` when the caller does not request one.
#[cfg(target_os = "linux")]
pub const DEFAULT_CAPACITY: usize = 8usize * 1024 * 1024 * 1024 * 1024;
#[cfg(not(target_os = "linux"))]
pub const DEFAULT_CAPACITY: usize = 4usize * 1024 * 1024 * 1024 * 1024;

/// Minimum allocatable object size; also the smallest bin.
pub const MIN_OBJECT_SIZE: usize = 8;

/// Absolute maximum single allocation size; bounds the bin sequence.
pub const MAX_OBJECT_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB

/// A small object is one that fits at most half a chunk; everything larger
/// is a "large" object spanning one or more whole chunks.
pub const SMALL_SIZE_MAX: usize = CHUNK_SIZE / 2;

/// Budget for each per-CPU object cache.
pub const MAX_PER_CPU_CACHE_SIZE: usize = 1024 * 1024;

/// Number of independent caches per CPU (reduces contention between
/// hyperthreads/siblings sharing a core).
pub const NUM_CACHES_PER_CPU: usize = 2;

/// Fixed capacity (offsets) of one cache block.
pub const CACHE_BLOCK_CAPACITY: usize = 64;

/// Major on-disk format version. `open` refuses a mismatched major version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of slots amortizing the CPU-number lookup in thread-local storage.
pub const CPU_NUM_CACHE_TTL: u32 = 64;

/// Skip the free-region hint below this size: punching holes for tiny slots
/// costs more syscalls than it saves.
pub const FREE_HINT_MIN_OBJECT_SIZE_PAGES: usize = 2;

/// Runtime knobs the manager derives its behavior from. Unlike the
/// compile-time constants above (which fix the on-disk layout and must
/// match between writer and reader processes), these only affect the
/// current process's behavior.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Keep each bin's non-full-chunk list sorted by ascending chunk number,
    /// biasing allocation toward low addresses at the cost of O(log n)
    /// inserts. (`USE_SORTED_BIN`)
    pub sorted_bin: bool,
    /// Compute a page-aligned free-region hint on small-object deallocation
    /// and hand it to `free_region`. (`FREE_SMALL_OBJECT_SIZE_HINT`)
    pub free_small_object_size_hint: bool,
    /// Disable returning freed pages to the OS entirely (useful on
    /// filesystems where hole punching is slow or unsupported).
    /// (`DISABLE_FREE_FILE_SPACE`)
    pub disable_free_file_space: bool,
    /// Disable all internal locking; only safe with a single thread.
    /// (`DISABLE_CONCURRENCY`)
    pub disable_concurrency: bool,
    /// Number of per-CPU cache slots; defaults to `NUM_CACHES_PER_CPU`.
    pub caches_per_cpu: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            sorted_bin: true,
            free_small_object_size_hint: false,
            disable_free_file_space: false,
            disable_concurrency: false,
            caches_per_cpu: NUM_CACHES_PER_CPU,
        }
    }
}
