//! Fixed-width occupancy bitset for chunk slots

use std::ops::Range;

use super::size_class::MAX_SLOTS_PER_CHUNK;

const WORDS: usize = (MAX_SLOTS_PER_CHUNK as usize) / 64;

/// One bit per slot, set while the slot is in use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotMask {
    words: [u64; WORDS],
}

impl SlotMask {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, bit: u32) -> bool {
        let (word, shift) = Self::locate(bit);
        self.words[word] & (1 << shift) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u32) {
        let (word, shift) = Self::locate(bit);
        self.words[word] |= 1 << shift;
    }

    #[inline]
    pub fn unset(&mut self, bit: u32) {
        let (word, shift) = Self::locate(bit);
        self.words[word] &= !(1 << shift);
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest clear bit below `limit`
    pub fn first_unset(&self, limit: u32) -> Option<u32> {
        for (i, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let bit = i as u32 * 64 + (!word).trailing_zeros();
            return (bit < limit).then_some(bit);
        }
        None
    }

    /// Length of the longest run of clear bits below `limit`
    pub fn longest_unset_run(&self, limit: u32) -> u32 {
        let mut longest = 0;
        let mut current = 0;
        for bit in 0..limit.min(MAX_SLOTS_PER_CHUNK) {
            if self.get(bit) {
                current = 0;
            } else {
                current += 1;
                longest = longest.max(current);
            }
        }
        longest
    }

    /// Maximal runs of clear bits below `limit`, in ascending order
    pub fn unset_runs(&self, limit: u32) -> Vec<Range<u32>> {
        let mut runs = Vec::new();
        let mut start = None;
        let limit = limit.min(MAX_SLOTS_PER_CHUNK);
        for bit in 0..limit {
            match (self.get(bit), start) {
                (false, None) => start = Some(bit),
                (true, Some(s)) => {
                    runs.push(s..bit);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(s..limit);
        }
        runs
    }

    /// Whether any bit at or above `limit` is set
    pub fn any_set_at_or_above(&self, limit: u32) -> bool {
        (limit.min(MAX_SLOTS_PER_CHUNK)..MAX_SLOTS_PER_CHUNK).any(|bit| self.get(bit))
    }

    #[inline]
    fn locate(bit: u32) -> (usize, u32) {
        debug_assert!(bit < MAX_SLOTS_PER_CHUNK, "slot {} out of range", bit);
        ((bit / 64) as usize, bit % 64)
    }
}
