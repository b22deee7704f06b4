//! Thin OS memory primitives: page size, VM reservation, file-backed
//! mmap/mprotect/madvise, `ftruncate`, and best-effort hole punching.
//!
//! This is the direct descendant of the teacher's `os.rs`: same shape
//! (`page_size`, `align_up`/`align_down`, a `mem_alloc`/`mem_free` pair, a
//! `commit`/`decommit`/`protect` trio built on `mprotect`, `warn!` on
//! best-effort failure), rewritten around file-backed mappings — the
//! teacher maps anonymous OS memory for a transient process-local heap;
//! here every mapping is backed by a block file so the bytes persist.
//! Windows/`winapi` support is dropped (see DESIGN.md) since hole punching
//! and reflink have no portable Windows equivalent this crate relies on.

use log::warn;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

pub fn page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align > 0 && align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align > 0 && align.is_power_of_two());
    size & !(align - 1)
}

/// Reserves `size` bytes of virtual address space with no backing file
/// (`PROT_NONE`, `MAP_ANONYMOUS`). Individual block files are later mapped
/// `MAP_FIXED` on top of sub-ranges of this reservation.
pub fn reserve_vm(size: usize) -> Option<*mut u8> {
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        warn!("mmap(reserve) failed: {}", errno::errno());
        None
    } else {
        Some(p as *mut u8)
    }
}

pub unsafe fn unreserve_vm(addr: *mut u8, size: usize) -> bool {
    if libc::munmap(addr as *mut _, size) == -1 {
        warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), addr, size);
        false
    } else {
        true
    }
}

/// Maps `file`'s first `len` bytes at `addr` (`MAP_FIXED`), read-write
/// unless `read_only`.
pub unsafe fn map_file_fixed(file: &File, addr: *mut u8, len: usize, read_only: bool) -> Option<*mut u8> {
    let prot = if read_only { libc::PROT_READ } else { libc::PROT_READ | libc::PROT_WRITE };
    let p = libc::mmap(addr as *mut _, len, prot, libc::MAP_SHARED | libc::MAP_FIXED, file.as_raw_fd(), 0);
    if p == libc::MAP_FAILED {
        warn!("mmap(file, fixed) failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        None
    } else {
        Some(p as *mut u8)
    }
}

pub unsafe fn unmap(addr: *mut u8, len: usize) -> bool {
    if libc::munmap(addr as *mut _, len) == -1 {
        warn!("munmap failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        false
    } else {
        true
    }
}

/// Temporarily (or permanently) flips protection on a live mapping; used by
/// `sync` to detect writes and by read-only opens.
pub unsafe fn protect(addr: *mut u8, len: usize, read_only: bool) -> bool {
    let prot = if read_only { libc::PROT_READ } else { libc::PROT_READ | libc::PROT_WRITE };
    if libc::mprotect(addr as *mut _, len, prot) == -1 {
        warn!("mprotect failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        false
    } else {
        true
    }
}

/// Drops the mapping to `PROT_NONE` right before `munmap`, so the kernel
/// can discard dirty pages cheaply instead of writing them back first.
pub unsafe fn protect_none(addr: *mut u8, len: usize) -> bool {
    if libc::mprotect(addr as *mut _, len, libc::PROT_NONE) == -1 {
        warn!("mprotect(none) failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        false
    } else {
        true
    }
}

/// Advises the OS the range is no longer needed.
pub unsafe fn madvise_dontneed(addr: *mut u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    if libc::madvise(addr as *mut _, len, libc::MADV_DONTNEED) != 0 {
        warn!("madvise(DONTNEED) failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        false
    } else {
        true
    }
}

pub fn msync(addr: *mut u8, len: usize, durable: bool) -> bool {
    let flags = if durable { libc::MS_SYNC } else { libc::MS_ASYNC };
    let rc = unsafe { libc::msync(addr as *mut _, len, flags) };
    if rc != 0 {
        warn!("msync failed: {}, addr {:p}, len {}", errno::errno(), addr, len);
        false
    } else {
        true
    }
}

pub fn ftruncate(file: &File, len: u64) -> std::io::Result<()> {
    file.set_len(len)
}

/// Probes whether the filesystem holding `dir` supports `fallocate`
/// hole-punching, by punching a hole in a throwaway temp file. Best effort:
/// any failure is treated as "unsupported".
pub fn probe_hole_punch_support(dir: &Path) -> bool {
    let probe_path = dir.join(".hole_punch_probe");
    let file = match File::create(&probe_path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let page = page_size() as u64;
    let ok = file.set_len(page * 2).is_ok() && punch_hole(&file, 0, page);
    let _ = std::fs::remove_file(&probe_path);
    ok
}

/// Punches a hole `[offset, offset+len)` in `file`, returning the disk
/// space backing it to the filesystem without changing the file's logical
/// size. Best-effort: failures are logged, never propagated (§4.3/§7 —
/// `free_region` is the sole best-effort primitive).
pub fn punch_hole(file: &File, offset: u64, len: u64) -> bool {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            warn!("fallocate(punch hole) failed: {}, offset {}, len {}", errno::errno(), offset, len);
            false
        } else {
            true
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        false
    }
}

/// Best-effort reflink (copy-on-write clone) of `src` into `dst` using
/// Linux's `FICLONE` ioctl. Returns `false` (never an error) if unsupported
/// so the caller can fall back to a byte copy.
pub fn reflink(src: &File, dst: &File) -> bool {
    #[cfg(target_os = "linux")]
    {
        const FICLONE: libc::c_ulong = 0x40049409;
        let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE, src.as_raw_fd()) };
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (src, dst);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
    }

    #[test]
    fn page_size_is_reasonable() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }
}
