//! C4: chunk directory.
//!
//! One entry per chunk, tracking whether it is empty, a small-object chunk
//! (with a per-slot occupancy bitmap), or the head/body of a multi-chunk
//! large object. Grows lazily — an entry for chunk `n` is never touched
//! until chunk `n` is first assigned — which is the practical equivalent,
//! in safe Rust, of the source's demand-paged anonymous table: nothing
//! allocates memory for chunks that were never used.

use crate::bin_manager::{BinManager, BinNo};
use crate::bitset::MultilayerBitset;
use crate::config::{CHUNK_SIZE, MAX_CAPACITY};
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Hard ceiling on the number of chunks any single directory can track,
/// derived from the largest segment a datastore is ever allowed to reserve
/// (§6 `MAX_CAPACITY`). Without this, `find_first_empty` would treat every
/// index past the end of `entries` as empty forever and never report the
/// directory full.
const MAX_CHUNKS: usize = MAX_CAPACITY / CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Empty,
    Small,
    LargeHead,
    LargeBody,
}

impl ChunkType {
    fn code(self) -> u8 {
        match self {
            ChunkType::Empty => 0,
            ChunkType::Small => 1,
            ChunkType::LargeHead => 2,
            ChunkType::LargeBody => 3,
        }
    }
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ChunkType::Small,
            2 => ChunkType::LargeHead,
            3 => ChunkType::LargeBody,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    kind: ChunkType,
    bin_no: BinNo,
    /// Only present for `Small` chunks.
    bitset: Option<MultilayerBitset>,
}

impl ChunkEntry {
    fn empty() -> Self {
        ChunkEntry { kind: ChunkType::Empty, bin_no: 0, bitset: None }
    }
}

pub struct ChunkDirectory {
    entries: Vec<ChunkEntry>,
    last_used_chunk_no: Option<usize>,
}

impl ChunkDirectory {
    pub fn new() -> Self {
        ChunkDirectory { entries: Vec::new(), last_used_chunk_no: None }
    }

    pub fn size(&self) -> usize {
        self.last_used_chunk_no.map_or(0, |n| n + 1)
    }

    fn ensure_len(&mut self, n: usize) {
        if self.entries.len() < n {
            self.entries.resize_with(n, ChunkEntry::empty);
        }
    }

    fn is_empty_at(&self, chunk_no: usize) -> bool {
        self.entries.get(chunk_no).map_or(true, |e| e.kind == ChunkType::Empty)
    }

    fn bump_last_used(&mut self, chunk_no: usize) {
        self.last_used_chunk_no = Some(self.last_used_chunk_no.map_or(chunk_no, |c| c.max(chunk_no)));
    }

    fn recompute_last_used_after_erase(&mut self, erased_up_to: usize) {
        if self.last_used_chunk_no != Some(erased_up_to) {
            return;
        }
        let mut i = erased_up_to;
        loop {
            if i == 0 {
                if self.is_empty_at(0) {
                    self.last_used_chunk_no = None;
                }
                return;
            }
            if !self.is_empty_at(i) {
                self.last_used_chunk_no = Some(i);
                return;
            }
            i -= 1;
        }
    }

    /// Allocates a fresh small-object chunk for `bin_no`. Returns the new
    /// chunk number.
    pub fn insert_small(&mut self, bin_no: BinNo, bins: &BinManager) -> Result<usize> {
        let chunk_no = self.find_first_empty(1).ok_or_else(|| Error::OutOfSpace { requested: 1, available: 0 })?;
        self.ensure_len(chunk_no + 1);
        let slots = bins.slots_per_small_bin(bin_no);
        self.entries[chunk_no] =
            ChunkEntry { kind: ChunkType::Small, bin_no, bitset: Some(MultilayerBitset::new(slots)) };
        self.bump_last_used(chunk_no);
        Ok(chunk_no)
    }

    /// Allocates a run of consecutive empty chunks for a large-object
    /// `bin_no`. Returns the head chunk number.
    pub fn insert_large(&mut self, bin_no: BinNo, bins: &BinManager) -> Result<usize> {
        let n = bins.chunks_per_large_bin(bin_no);
        let head = self.find_first_empty(n).ok_or_else(|| Error::OutOfSpace { requested: n, available: 0 })?;
        self.ensure_len(head + n);
        self.entries[head] = ChunkEntry { kind: ChunkType::LargeHead, bin_no, bitset: None };
        for body in (head + 1)..(head + n) {
            self.entries[body] = ChunkEntry { kind: ChunkType::LargeBody, bin_no, bitset: None };
        }
        self.bump_last_used(head + n - 1);
        Ok(head)
    }

    fn find_first_empty(&self, run_len: usize) -> Option<usize> {
        if run_len > MAX_CHUNKS {
            return None;
        }
        let mut start = 0usize;
        let mut run = 0usize;
        for i in 0..MAX_CHUNKS {
            if self.is_empty_at(i) {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == run_len {
                    return Some(start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Resets a chunk (and, for a large head, its bodies) back to empty,
    /// returning `(bin_no, num_chunks_freed)`.
    pub fn erase(&mut self, chunk_no: usize) -> (BinNo, usize) {
        let kind = self.entries[chunk_no].kind;
        let bin_no = self.entries[chunk_no].bin_no;
        let n = match kind {
            ChunkType::Small => {
                self.entries[chunk_no] = ChunkEntry::empty();
                1
            }
            ChunkType::LargeHead => {
                let mut count = 1;
                let mut i = chunk_no + 1;
                while i < self.entries.len() && self.entries[i].kind == ChunkType::LargeBody {
                    self.entries[i] = ChunkEntry::empty();
                    count += 1;
                    i += 1;
                }
                self.entries[chunk_no] = ChunkEntry::empty();
                count
            }
            ChunkType::LargeBody | ChunkType::Empty => {
                debug_assert!(false, "erase called on non-head chunk {}", chunk_no);
                1
            }
        };
        let erased_up_to = chunk_no + n - 1;
        self.recompute_last_used_after_erase(erased_up_to);
        (bin_no, n)
    }

    pub fn find_and_mark_slot(&mut self, chunk_no: usize) -> Option<usize> {
        let entry = self.entries.get_mut(chunk_no)?;
        debug_assert_eq!(entry.kind, ChunkType::Small);
        entry.bitset.as_mut()?.find_and_set()
    }

    pub fn unmark_slot(&mut self, chunk_no: usize, slot_no: usize) {
        let entry = &mut self.entries[chunk_no];
        debug_assert_eq!(entry.kind, ChunkType::Small);
        entry.bitset.as_mut().unwrap().free(slot_no);
    }

    pub fn slot_marked(&self, chunk_no: usize, slot_no: usize) -> bool {
        self.entries[chunk_no].bitset.as_ref().unwrap().get(slot_no)
    }

    pub fn all_slots_marked(&self, chunk_no: usize) -> bool {
        self.entries[chunk_no].bitset.as_ref().unwrap().all_set()
    }

    pub fn all_slots_unmarked(&self, chunk_no: usize) -> bool {
        self.entries[chunk_no].bitset.as_ref().unwrap().all_unset()
    }

    pub fn bin_no(&self, chunk_no: usize) -> BinNo {
        self.entries[chunk_no].bin_no
    }

    pub fn kind(&self, chunk_no: usize) -> ChunkType {
        self.entries.get(chunk_no).map_or(ChunkType::Empty, |e| e.kind)
    }

    pub fn slots(&self, chunk_no: usize) -> usize {
        self.entries[chunk_no].bitset.as_ref().map_or(0, |b| b.len())
    }

    pub fn occupied_slots(&self, chunk_no: usize) -> usize {
        self.entries[chunk_no].bitset.as_ref().map_or(0, |b| b.popcount())
    }

    pub fn serialize(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for (chunk_no, e) in self.entries.iter().enumerate() {
            if e.kind == ChunkType::Empty {
                continue;
            }
            match e.kind {
                ChunkType::Small => {
                    let bs = e.bitset.as_ref().unwrap();
                    out.push_str(&format!(
                        "{} {} {} {} {}\n",
                        chunk_no,
                        e.bin_no,
                        e.kind.code(),
                        bs.popcount(),
                        bs.serialize()
                    ));
                }
                ChunkType::LargeHead | ChunkType::LargeBody => {
                    out.push_str(&format!("{} {} {}\n", chunk_no, e.bin_no, e.kind.code()));
                }
                ChunkType::Empty => unreachable!(),
            }
        }
        fs::File::create(path)
            .and_then(|mut f| f.write_all(out.as_bytes()))
            .map_err(|err| Error::io(path, err))
    }

    pub fn deserialize(path: &Path, bins: &BinManager) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut dir = ChunkDirectory::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let chunk_no: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad chunk_no".into()))?;
            let bin_no: BinNo = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad bin_no".into()))?;
            let type_code: u8 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad type code".into()))?;
            let kind = ChunkType::from_code(type_code)
                .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "unknown type code".into()))?;
            dir.ensure_len(chunk_no + 1);
            let bitset = if kind == ChunkType::Small {
                let _num_occupied: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad occupied count".into()))?;
                let bitmap_str =
                    parts.next().ok_or_else(|| Error::Corrupt(path.to_path_buf(), "missing bitmap".into()))?;
                let slots = bins.slots_per_small_bin(bin_no);
                Some(
                    MultilayerBitset::deserialize(slots, bitmap_str)
                        .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad bitmap".into()))?,
                )
            } else {
                None
            };
            dir.entries[chunk_no] = ChunkEntry { kind, bin_no, bitset };
            dir.bump_last_used(chunk_no);
        }
        Ok(dir)
    }
}

impl Default for ChunkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_insert_erase_reuses_lowest_chunk() {
        let bins = BinManager::new();
        let mut dir = ChunkDirectory::new();
        let bin_no = bins.to_bin_no(32);
        let c0 = dir.insert_small(bin_no, &bins).unwrap();
        let c1 = dir.insert_small(bin_no, &bins).unwrap();
        assert_eq!(c0, 0);
        assert_eq!(c1, 1);
        dir.erase(c0);
        let c2 = dir.insert_small(bin_no, &bins).unwrap();
        assert_eq!(c2, 0);
    }

    #[test]
    fn large_object_spans_contiguous_chunks_and_does_not_overlap() {
        let bins = BinManager::new();
        let mut dir = ChunkDirectory::new();
        let large_bin = (bins.num_small_bins()) as BinNo; // first large bin (>=1 chunk)
        // Force a 2-chunk bin by finding one whose chunks_per_large_bin==2 if present, else use first large bin.
        let head = dir.insert_large(large_bin, &bins).unwrap();
        assert_eq!(head, 0);
        let n = bins.chunks_per_large_bin(large_bin);
        for i in 0..n {
            assert_ne!(dir.kind(i), ChunkType::Empty);
        }
        let next = dir.insert_large(large_bin, &bins).unwrap();
        assert_eq!(next, n);
    }

    #[test]
    fn serialize_roundtrip() {
        let bins = BinManager::new();
        let mut dir = ChunkDirectory::new();
        let bin_no = bins.to_bin_no(64);
        let c = dir.insert_small(bin_no, &bins).unwrap();
        dir.find_and_mark_slot(c);
        dir.find_and_mark_slot(c);

        let dir_path = std::env::temp_dir().join(format!("chunkdir_test_{}", std::process::id()));
        dir.serialize(&dir_path).unwrap();
        let restored = ChunkDirectory::deserialize(&dir_path, &bins).unwrap();
        assert_eq!(restored.size(), dir.size());
        assert_eq!(restored.occupied_slots(c), 2);
        let _ = std::fs::remove_file(&dir_path);
    }
}
