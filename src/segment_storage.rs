//! C3: segment storage.
//!
//! Reserves a contiguous virtual-address region, maps fixed-size block
//! files into it in order, grows on demand by mapping additional blocks,
//! and persists everything via `msync`. This is the file-backed twin of
//! the teacher's segment allocation (`segment.rs`): where the teacher
//! `mmap`s anonymous memory aligned to `MI_SEGMENT_SIZE` and tracks it with
//! a `Segment` header, this type `mmap`s real files aligned to
//! `CHUNK_SIZE` so the bytes outlive the process.

use crate::config::{BLOCK_SIZE, CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::os;
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Reserved at the very start of the virtual address range (§4.3/§9: "the
/// segment header in the first aligned region at the top of the VM
/// range"). One whole chunk is set aside so that application-visible
/// offset 0 starts exactly on a chunk boundary, keeping
/// `chunk_no = offset / CHUNK_SIZE` valid without a further bias term.
const HEADER_SIZE: usize = CHUNK_SIZE;
const HEADER_MAGIC: u64 = 0x5045_5253_4953_5448; // "PERSISTH"

#[repr(C)]
struct RawHeader {
    magic: u64,
    format_version: u32,
}

pub struct SegmentStorage {
    base_path: PathBuf,
    vm_base: *mut u8,
    /// Total reserved VM, including the header chunk.
    vm_reserved: usize,
    /// Total bytes currently mapped from `vm_base` (header + usable).
    mapped_size: usize,
    block_files: Vec<File>,
    read_only: bool,
    broken: bool,
    hole_punch_supported: bool,
}

// Synchronization is the caller's responsibility (SegmentAllocator holds
// the locks described in §4.7); the raw pointer itself never aliases
// mutable Rust references outside of that discipline.
unsafe impl Send for SegmentStorage {}
unsafe impl Sync for SegmentStorage {}

impl SegmentStorage {
    fn block_path(base_path: &Path, block_no: usize) -> PathBuf {
        base_path.join(format!("block-{}", block_no))
    }

    /// Number of existing block files backing an (unopened) segment.
    pub fn get_size(base_path: &Path) -> usize {
        let mut n = 0usize;
        let mut total = 0u64;
        loop {
            let p = Self::block_path(base_path, n);
            match fs::metadata(&p) {
                Ok(m) => {
                    total += m.len();
                    n += 1;
                }
                Err(_) => break,
            }
        }
        total.saturating_sub(HEADER_SIZE as u64) as usize
    }

    pub fn openable(base_path: &Path) -> bool {
        Self::block_path(base_path, 0).exists()
    }

    pub fn create(base_path: &Path, capacity: usize) -> Result<Self> {
        fs::create_dir_all(base_path).map_err(|e| Error::io(base_path, e))?;
        let hole_punch_supported = os::probe_hole_punch_support(base_path);

        let vm_reserved = os::align_up(HEADER_SIZE + capacity, BLOCK_SIZE);
        let vm_base = os::reserve_vm(vm_reserved)
            .ok_or_else(|| Error::Io { path: base_path.to_path_buf(), source: std::io::Error::last_os_error() })?;

        let mut storage = SegmentStorage {
            base_path: base_path.to_path_buf(),
            vm_base,
            vm_reserved,
            mapped_size: 0,
            block_files: Vec::new(),
            read_only: false,
            broken: false,
            hole_punch_supported,
        };

        storage.map_next_block()?;
        storage.write_header();
        info!("created segment storage at {:?}, capacity {} bytes", base_path, capacity);
        Ok(storage)
    }

    pub fn open(base_path: &Path, capacity_hint: usize, read_only: bool) -> Result<Self> {
        if !Self::openable(base_path) {
            return Err(Error::Corrupt(base_path.to_path_buf(), "no block-0 file".into()));
        }
        let existing_size = Self::get_size(base_path) + HEADER_SIZE;
        let target = existing_size.max(os::align_up(HEADER_SIZE + capacity_hint, BLOCK_SIZE));
        let vm_reserved = os::align_up(target, BLOCK_SIZE).max(MAX_RESERVE_FLOOR);
        let hole_punch_supported = if read_only { false } else { os::probe_hole_punch_support(base_path) };

        let vm_base = os::reserve_vm(vm_reserved)
            .ok_or_else(|| Error::Io { path: base_path.to_path_buf(), source: std::io::Error::last_os_error() })?;

        let mut storage = SegmentStorage {
            base_path: base_path.to_path_buf(),
            vm_base,
            vm_reserved,
            mapped_size: 0,
            block_files: Vec::new(),
            read_only,
            broken: false,
            hole_punch_supported,
        };

        let mut block_no = 0;
        loop {
            let p = Self::block_path(base_path, block_no);
            if !p.exists() {
                break;
            }
            storage.map_existing_block(&p, read_only)?;
            block_no += 1;
        }
        storage.verify_header()?;

        if !read_only && existing_size < HEADER_SIZE + capacity_hint {
            storage.extend(HEADER_SIZE + capacity_hint)?;
        }

        debug!("opened segment storage at {:?}, mapped {} bytes, read_only={}", base_path, storage.mapped_size, read_only);
        Ok(storage)
    }

    fn map_next_block(&mut self) -> Result<()> {
        let block_no = self.block_files.len();
        let path = Self::block_path(&self.base_path, block_no);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).map_err(|e| Error::io(&path, e))?;
        os::ftruncate(&file, BLOCK_SIZE as u64).map_err(|e| Error::io(&path, e))?;
        let addr = unsafe { self.vm_base.add(self.mapped_size) };
        unsafe { os::map_file_fixed(&file, addr, BLOCK_SIZE, false) }
            .ok_or(Error::Broken)
            .map_err(|e| {
                self.broken = true;
                e
            })?;
        self.block_files.push(file);
        self.mapped_size += BLOCK_SIZE;
        Ok(())
    }

    fn map_existing_block(&mut self, path: &Path, read_only: bool) -> Result<()> {
        let file = OpenOptions::new().read(true).write(!read_only).open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len() as usize;
        let addr = unsafe { self.vm_base.add(self.mapped_size) };
        unsafe { os::map_file_fixed(&file, addr, len, read_only) }
            .ok_or(Error::Broken)
            .map_err(|e| {
                self.broken = true;
                e
            })?;
        self.block_files.push(file);
        self.mapped_size += len;
        Ok(())
    }

    fn write_header(&mut self) {
        let header = RawHeader { magic: HEADER_MAGIC, format_version: crate::config::FORMAT_VERSION };
        unsafe { (self.vm_base as *mut RawHeader).write(header) };
    }

    fn verify_header(&self) -> Result<()> {
        let header = unsafe { (self.vm_base as *const RawHeader).read() };
        if header.magic != HEADER_MAGIC {
            return Err(Error::Corrupt(self.base_path.clone(), "bad segment header magic".into()));
        }
        if header.format_version != crate::config::FORMAT_VERSION {
            return Err(Error::VersionMismatch { found: header.format_version, expected: crate::config::FORMAT_VERSION });
        }
        Ok(())
    }

    /// Grows the mapped segment until it is at least `total_size` bytes
    /// (header included). Idempotent if already large enough.
    pub fn extend(&mut self, total_size: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly("extend"));
        }
        if self.broken {
            return Err(Error::Broken);
        }
        if total_size > self.vm_reserved {
            return Err(Error::OutOfSpace { requested: total_size, available: self.vm_reserved });
        }
        while self.mapped_size < total_size {
            self.map_next_block()?;
        }
        Ok(())
    }

    /// Application-visible base address: offsets are relative to this.
    pub fn segment_base(&self) -> *mut u8 {
        unsafe { self.vm_base.add(HEADER_SIZE) }
    }

    /// Usable (non-header) bytes currently mapped.
    pub fn size(&self) -> usize {
        self.mapped_size.saturating_sub(HEADER_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.vm_reserved - HEADER_SIZE
    }

    /// Total bytes currently mapped, header included. Matches the units
    /// `extend`'s argument is in, unlike `size()`.
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Total reserved VM, header included. Matches the units
    /// `extend`'s argument is in, unlike `capacity()`.
    pub fn reserved(&self) -> usize {
        self.vm_reserved
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Advises the OS to reclaim pages in `[offset, offset+bytes)` and, if
    /// supported, punches a hole in the backing file. Best-effort per §4.3
    /// / §7: never fatal.
    pub fn free_region(&self, offset: i64, bytes: usize) {
        if bytes == 0 || self.read_only {
            return;
        }
        let addr = unsafe { self.segment_base().offset(offset as isize) };
        unsafe { os::madvise_dontneed(addr, bytes) };
        if !self.hole_punch_supported || self.broken {
            return;
        }
        // file offset within the whole vm range (header included)
        let vm_off = HEADER_SIZE as u64 + offset as u64;
        let mut remaining = bytes as u64;
        let mut pos = vm_off;
        while remaining > 0 {
            let block_no = (pos / BLOCK_SIZE as u64) as usize;
            let within = pos % BLOCK_SIZE as u64;
            let chunk = remaining.min(BLOCK_SIZE as u64 - within);
            if let Some(file) = self.block_files.get(block_no) {
                os::punch_hole(file, within, chunk);
            }
            pos += chunk;
            remaining -= chunk;
        }
    }

    /// Flushes every live block to disk. A no-op in read-only mode.
    /// Temporarily downgrades the segment to read-only to detect
    /// unexpected concurrent writers, per §4.3.
    pub fn sync(&mut self, durable: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.broken {
            return Err(Error::Broken);
        }
        unsafe { os::protect(self.vm_base, self.mapped_size, true) };

        let num_blocks = self.block_files.len();
        let base = self.vm_base as usize;
        let failures = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = (0..num_blocks)
                .map(|block_no| {
                    s.spawn(move |_| {
                        let addr = (base + block_no * BLOCK_SIZE) as *mut u8;
                        os::msync(addr, BLOCK_SIZE, durable)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(false)).filter(|ok| !ok).count()
        })
        .unwrap_or(num_blocks);

        unsafe { os::protect(self.vm_base, self.mapped_size, false) };

        if failures > 0 {
            self.broken = true;
            return Err(Error::Broken);
        }
        Ok(())
    }

    /// Unmaps the segment and closes all block file descriptors. Does not
    /// write the properly-closed mark — that is the manager kernel's job.
    pub fn release(&mut self) {
        if self.mapped_size > 0 {
            unsafe {
                os::protect_none(self.vm_base, self.mapped_size);
                os::unmap(self.vm_base, self.vm_reserved);
            }
            self.mapped_size = 0;
        }
        self.block_files.clear();
    }
}

const MAX_RESERVE_FLOOR: usize = BLOCK_SIZE;

impl Drop for SegmentStorage {
    fn drop(&mut self) {
        if self.mapped_size > 0 {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let seg_path = dir.path().join("segment");
        {
            let mut s = SegmentStorage::create(&seg_path, 16 * 1024 * 1024).unwrap();
            let base = s.segment_base();
            unsafe { std::ptr::write(base as *mut u64, 0xdead_beef) };
            s.sync(true).unwrap();
            s.release();
        }
        {
            let s = SegmentStorage::open(&seg_path, 16 * 1024 * 1024, false).unwrap();
            let base = s.segment_base();
            let v = unsafe { std::ptr::read(base as *const u64) };
            assert_eq!(v, 0xdead_beef);
        }
    }

    #[test]
    fn extend_grows_mapped_size() {
        let dir = tempdir().unwrap();
        let seg_path = dir.path().join("segment");
        let mut s = SegmentStorage::create(&seg_path, 1024).unwrap();
        let before = s.size();
        s.extend(HEADER_SIZE + BLOCK_SIZE * 2).unwrap();
        assert!(s.size() > before);
    }

    #[test]
    fn read_only_open_rejects_extend() {
        let dir = tempdir().unwrap();
        let seg_path = dir.path().join("segment");
        {
            let _s = SegmentStorage::create(&seg_path, 1024).unwrap();
        }
        let mut s = SegmentStorage::open(&seg_path, 1024, true).unwrap();
        assert!(s.extend(HEADER_SIZE + BLOCK_SIZE * 4).is_err());
    }
}
