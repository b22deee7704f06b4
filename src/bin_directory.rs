//! C5: bin (non-full-chunk) directory.
//!
//! For each small bin, an ordered collection of chunk numbers that are
//! currently partially occupied. `front`/`pop` hand out a chunk to
//! allocate the next slot from; `insert`/`erase` track chunks moving in
//! and out of the "has room" state as their bitsets fill up and drain.
//!
//! When `sorted` is enabled, the per-bin collection is kept sorted by
//! ascending chunk number (`USE_SORTED_BIN`), biasing allocation toward
//! low addresses to reduce fragmentation at the cost of O(log n) inserts
//! instead of O(1).

use crate::bin_manager::BinNo;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;

pub struct BinDirectory {
    bins: Vec<VecDeque<usize>>,
    sorted: bool,
}

impl BinDirectory {
    pub fn new(num_small_bins: usize, sorted: bool) -> Self {
        BinDirectory { bins: (0..num_small_bins).map(|_| VecDeque::new()).collect(), sorted }
    }

    pub fn empty(&self, bin_no: BinNo) -> bool {
        self.bins[bin_no as usize].is_empty()
    }

    pub fn front(&self, bin_no: BinNo) -> Option<usize> {
        self.bins[bin_no as usize].front().copied()
    }

    pub fn insert(&mut self, bin_no: BinNo, chunk_no: usize) {
        let list = &mut self.bins[bin_no as usize];
        debug_assert!(!list.contains(&chunk_no));
        if self.sorted {
            let pos = list.partition_point(|&c| c < chunk_no);
            list.insert(pos, chunk_no);
        } else {
            list.push_back(chunk_no);
        }
    }

    pub fn pop(&mut self, bin_no: BinNo) -> Option<usize> {
        self.bins[bin_no as usize].pop_front()
    }

    pub fn erase(&mut self, bin_no: BinNo, chunk_no: usize) -> bool {
        let list = &mut self.bins[bin_no as usize];
        if let Some(pos) = list.iter().position(|&c| c == chunk_no) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn serialize(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for (bin_no, list) in self.bins.iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            let chunks: Vec<String> = list.iter().map(|c| c.to_string()).collect();
            out.push_str(&format!("{} {}\n", bin_no, chunks.join(",")));
        }
        fs::File::create(path).and_then(|mut f| f.write_all(out.as_bytes())).map_err(|e| Error::io(path, e))
    }

    pub fn deserialize(path: &Path, num_small_bins: usize, sorted: bool) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut dir = BinDirectory::new(num_small_bins, sorted);
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let bin_no: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt(path.to_path_buf(), "bad bin_no".into()))?;
            let rest = parts.next().unwrap_or("");
            for chunk_str in rest.split(',').filter(|s| !s.is_empty()) {
                let chunk_no: usize =
                    chunk_str.parse().map_err(|_| Error::Corrupt(path.to_path_buf(), "bad chunk_no".into()))?;
                dir.bins[bin_no].push_back(chunk_no);
            }
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert_keeps_order_and_front_is_lowest() {
        let mut dir = BinDirectory::new(4, true);
        dir.insert(0, 5);
        dir.insert(0, 1);
        dir.insert(0, 3);
        assert_eq!(dir.front(0), Some(1));
        dir.erase(0, 1);
        assert_eq!(dir.front(0), Some(3));
    }

    #[test]
    fn unsorted_is_fifo() {
        let mut dir = BinDirectory::new(4, false);
        dir.insert(0, 5);
        dir.insert(0, 1);
        assert_eq!(dir.pop(0), Some(5));
        assert_eq!(dir.pop(0), Some(1));
        assert!(dir.empty(0));
    }

    #[test]
    fn serialize_roundtrip() {
        let mut dir = BinDirectory::new(3, true);
        dir.insert(0, 10);
        dir.insert(0, 2);
        dir.insert(2, 7);
        let path = std::env::temp_dir().join(format!("bindir_test_{}", std::process::id()));
        dir.serialize(&path).unwrap();
        let restored = BinDirectory::deserialize(&path, 3, true).unwrap();
        assert_eq!(restored.front(0), Some(2));
        assert_eq!(restored.front(2), Some(7));
        assert!(restored.empty(1));
        let _ = std::fs::remove_file(&path);
    }
}
