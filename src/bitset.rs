//! C2: multilayer bitset.
//!
//! A compact occupancy bitmap over up to `CHUNK_SIZE / MIN_OBJECT_SIZE`
//! slots (many tens of thousands for the default 2 MiB chunk / 8 byte
//! minimum object). Two representations, chosen by size:
//!
//! - `Word`: a single machine word, for chunks with <= 64 slots (i.e. every
//!   large-object-adjacent small bin).
//! - `Layered`: a bottom layer of words plus a summary layer whose bit `i`
//!   is set iff bottom word `i` is entirely full (no free bit left) — the
//!   same trick the teacher uses for its `pages_free_direct` fast path,
//!   generalized into an explicit tree so `find_and_set` is O(log n)
//!   instead of O(n); a clear summary bit means "search this word".
//!
//! The caller (the chunk directory, under its chunk lock — see §4.3/§4.7)
//! is responsible for synchronization; this type itself is not thread-safe.

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
enum Repr {
    Word(u64),
    Layered {
        bottom: Vec<u64>,
        /// summary[i] has bit j set iff bottom[i * 64 + j] is entirely full
        summary: Vec<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct MultilayerBitset {
    repr: Repr,
    num_bits: usize,
}

impl MultilayerBitset {
    pub fn new(num_bits: usize) -> Self {
        assert!(num_bits > 0);
        let repr = if num_bits <= WORD_BITS {
            Repr::Word(0)
        } else {
            let num_words = (num_bits + WORD_BITS - 1) / WORD_BITS;
            let num_summary_words = (num_words + WORD_BITS - 1) / WORD_BITS;
            Repr::Layered {
                bottom: vec![0u64; num_words],
                summary: vec![0u64; num_summary_words],
            }
        };
        MultilayerBitset { repr, num_bits }
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn get(&self, n: usize) -> bool {
        assert!(n < self.num_bits);
        match &self.repr {
            Repr::Word(w) => (w >> n) & 1 != 0,
            Repr::Layered { bottom, .. } => {
                let word = n / WORD_BITS;
                let bit = n % WORD_BITS;
                (bottom[word] >> bit) & 1 != 0
            }
        }
    }

    /// Sets bit `n`. Returns `true` if it was previously unset.
    pub fn allocate(&mut self, n: usize) -> bool {
        assert!(n < self.num_bits);
        match &mut self.repr {
            Repr::Word(w) => {
                let mask = 1u64 << n;
                let was_set = *w & mask != 0;
                *w |= mask;
                !was_set
            }
            Repr::Layered { bottom, summary } => {
                let word = n / WORD_BITS;
                let bit = n % WORD_BITS;
                let mask = 1u64 << bit;
                let was_set = bottom[word] & mask != 0;
                bottom[word] |= mask;
                if bottom[word] == u64::MAX {
                    let srow = word / WORD_BITS;
                    let sbit = word % WORD_BITS;
                    summary[srow] |= 1u64 << sbit;
                }
                !was_set
            }
        }
    }

    /// Clears bit `n` ("free"). Returns `true` if it was previously set.
    pub fn free(&mut self, n: usize) -> bool {
        assert!(n < self.num_bits);
        match &mut self.repr {
            Repr::Word(w) => {
                let mask = 1u64 << n;
                let was_set = *w & mask != 0;
                *w &= !mask;
                was_set
            }
            Repr::Layered { bottom, summary } => {
                let word = n / WORD_BITS;
                let bit = n % WORD_BITS;
                let mask = 1u64 << bit;
                let was_set = bottom[word] & mask != 0;
                bottom[word] &= !mask;
                let srow = word / WORD_BITS;
                let sbit = word % WORD_BITS;
                summary[srow] &= !(1u64 << sbit);
                was_set
            }
        }
    }

    /// Equivalent to `free`, named to mirror the spec's operation list.
    pub fn reset(&mut self, n: usize) {
        self.free(n);
    }

    /// Finds the lowest unset bit, sets it, and returns its index. `None`
    /// if every bit in range is set.
    pub fn find_and_set(&mut self) -> Option<usize> {
        let slot = match &self.repr {
            Repr::Word(w) => {
                if *w == u64::MAX {
                    return None;
                }
                let inv = !*w;
                let bit = inv.trailing_zeros() as usize;
                if bit >= self.num_bits {
                    return None;
                }
                bit
            }
            Repr::Layered { bottom, summary } => {
                let num_words = bottom.len();
                let mut found = None;
                'outer: for (srow, &srow_val) in summary.iter().enumerate() {
                    if srow_val == u64::MAX {
                        continue;
                    }
                    let inv_row = !srow_val;
                    let mut remaining = inv_row;
                    while remaining != 0 {
                        let sbit = remaining.trailing_zeros() as usize;
                        remaining &= remaining - 1;
                        let word = srow * WORD_BITS + sbit;
                        if word >= num_words {
                            continue;
                        }
                        if bottom[word] != u64::MAX {
                            let bit = (!bottom[word]).trailing_zeros() as usize;
                            let n = word * WORD_BITS + bit;
                            if n < self.num_bits {
                                found = Some(n);
                                break 'outer;
                            }
                        }
                    }
                }
                found?
            }
        };
        self.allocate(slot);
        Some(slot)
    }

    pub fn popcount(&self) -> usize {
        match &self.repr {
            Repr::Word(w) => w.count_ones() as usize,
            Repr::Layered { bottom, .. } => bottom.iter().map(|w| w.count_ones() as usize).sum(),
        }
    }

    pub fn all_set(&self) -> bool {
        self.popcount() == self.num_bits
    }

    pub fn all_unset(&self) -> bool {
        self.popcount() == 0
    }

    /// Serializes to a compact hex string, one word per 16 hex digits.
    pub fn serialize(&self) -> String {
        match &self.repr {
            Repr::Word(w) => format!("{:016x}", w),
            Repr::Layered { bottom, .. } => {
                let mut s = String::with_capacity(bottom.len() * 16);
                for w in bottom {
                    s.push_str(&format!("{:016x}", w));
                }
                s
            }
        }
    }

    pub fn deserialize(num_bits: usize, s: &str) -> Option<Self> {
        let mut bs = MultilayerBitset::new(num_bits);
        let chunks: Vec<&str> = s
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).ok())
            .collect::<Option<Vec<_>>>()?;
        match &mut bs.repr {
            Repr::Word(w) => {
                if chunks.len() != 1 {
                    return None;
                }
                *w = u64::from_str_radix(chunks[0], 16).ok()?;
            }
            Repr::Layered { bottom, summary } => {
                if chunks.len() != bottom.len() {
                    return None;
                }
                for (i, c) in chunks.iter().enumerate() {
                    bottom[i] = u64::from_str_radix(c, 16).ok()?;
                    if bottom[i] == u64::MAX {
                        summary[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
                    }
                }
            }
        }
        Some(bs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_repr_roundtrip() {
        let mut bs = MultilayerBitset::new(40);
        let a = bs.find_and_set().unwrap();
        let b = bs.find_and_set().unwrap();
        assert_ne!(a, b);
        assert_eq!(bs.popcount(), 2);
        bs.free(a);
        assert_eq!(bs.popcount(), 1);
        assert!(!bs.get(a));
        assert!(bs.get(b));
    }

    #[test]
    fn layered_repr_find_and_set_fills_in_order_of_availability() {
        let mut bs = MultilayerBitset::new(1000);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let slot = bs.find_and_set().unwrap();
            assert!(seen.insert(slot));
        }
        assert!(bs.find_and_set().is_none());
        assert!(bs.all_set());
    }

    #[test]
    fn serialize_roundtrip() {
        let mut bs = MultilayerBitset::new(200);
        for _ in 0..50 {
            bs.find_and_set();
        }
        let s = bs.serialize();
        let bs2 = MultilayerBitset::deserialize(200, &s).unwrap();
        for i in 0..200 {
            assert_eq!(bs.get(i), bs2.get(i));
        }
    }

    #[test]
    fn reuse_after_free() {
        let mut bs = MultilayerBitset::new(128);
        let slots: Vec<_> = (0..128).map(|_| bs.find_and_set().unwrap()).collect();
        assert!(bs.all_set());
        for &s in &slots[..10] {
            bs.free(s);
        }
        for _ in 0..10 {
            assert!(bs.find_and_set().is_some());
        }
        assert!(bs.all_set());
    }

    proptest::proptest! {
        /// A sequence of `find_and_set`/`free` calls never hands out the same
        /// slot twice while it is still live, and a freed slot is eligible
        /// for reuse (§8 "No overlap" / "Reuse").
        #[test]
        fn alloc_free_sequence_never_double_allocates(
            num_bits in 1usize..300,
            ops in proptest::collection::vec(proptest::bool::ANY, 1..500),
        ) {
            let mut bs = MultilayerBitset::new(num_bits);
            let mut live: Vec<usize> = Vec::new();
            for alloc in ops {
                if alloc || live.is_empty() {
                    if let Some(slot) = bs.find_and_set() {
                        proptest::prop_assert!(!live.contains(&slot));
                        live.push(slot);
                    }
                } else {
                    let idx = live.len() - 1;
                    let slot = live.remove(idx);
                    proptest::prop_assert!(bs.free(slot));
                }
            }
            proptest::prop_assert_eq!(bs.popcount(), live.len());
        }
    }
}
