//! External port / ICMP identifier pools
//!
//! Each pool is a bitmap over an inclusive range. Allocation hands out the
//! lowest free slot (a linear scan over 64-bit words), release frees a slot
//! immediately so the next allocation may return it again.

use super::napt::MappingKind;
use crate::{Error, Result};
use tracing::warn;

const WORD_BITS: usize = u64::BITS as usize;

/// Bitmap allocator for one kind of external identifier.
#[derive(Debug, Clone)]
pub struct Pool {
    kind: MappingKind,
    min: u16,
    capacity: usize,
    /// Bit set = slot in use. Bits past `capacity` in the last word stay set.
    words: Vec<u64>,
    in_use: usize,
}

impl Pool {
    /// Create a pool covering `min..=max`. An inverted range yields an empty
    /// pool that always reports exhaustion.
    pub fn new(kind: MappingKind, min: u16, max: u16) -> Self {
        let capacity = if min <= max {
            usize::from(max - min) + 1
        } else {
            0
        };
        let mut words = vec![0u64; capacity.div_ceil(WORD_BITS)];

        let tail = capacity % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Self {
            kind,
            min,
            capacity,
            words,
            in_use: 0,
        }
    }

    /// Kind of mapping this pool serves
    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Mark and return the lowest free slot.
    pub fn allocate(&mut self) -> Result<u16> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word == !0u64 {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            *word |= 1u64 << bit;
            self.in_use += 1;

            let index = i * WORD_BITS + bit;
            // index < capacity <= 65536 - min, so this stays within u16
            return Ok(self.min + index as u16);
        }

        Err(Error::Exhausted { kind: self.kind })
    }

    /// Free a slot. Returns false (and changes nothing) if the slot was not
    /// allocated or lies outside the pool.
    pub fn release(&mut self, slot: u16) -> bool {
        let Some((word, mask)) = self.locate(slot) else {
            warn!(kind = %self.kind, slot, "release of slot outside pool ignored");
            return false;
        };

        if self.words[word] & mask == 0 {
            warn!(kind = %self.kind, slot, "double release ignored");
            return false;
        }

        self.words[word] &= !mask;
        self.in_use -= 1;
        true
    }

    /// Check whether a slot is currently allocated
    pub fn is_allocated(&self, slot: u16) -> bool {
        self.locate(slot)
            .is_some_and(|(word, mask)| self.words[word] & mask != 0)
    }

    fn locate(&self, slot: u16) -> Option<(usize, u64)> {
        let index = usize::from(slot.checked_sub(self.min)?);
        if index >= self.capacity {
            return None;
        }
        Some((index / WORD_BITS, 1u64 << (index % WORD_BITS)))
    }
}
