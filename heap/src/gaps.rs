//! The bounded table of the largest known free regions.
//!
//! Every entry points at a filler object: a byte array whose length covers
//! the rest of the free region. The table is therefore both the free list of
//! the allocator and a set of objects the next scan skips in one step.

use object::{ARRAY_LENGTH_OFFSET, ARRAY_OVERHEAD, Address, ClassId, ObjectHeader};

use crate::LinearMemory;

/// Capacity of a gap table.
pub const GAP_TABLE_SIZE: usize = 16;
/// Regions of this size or smaller are never tracked.
pub const MIN_TRACKED_GAP: u32 = ARRAY_OVERHEAD << 1;

/// Stamp of filler objects. The cycle stamp skips zero, so fillers never
/// look reached.
pub const FILLER_STAMP: u8 = 0;

/// Rewrites `[gap, gap + size)` into a single filler object.
#[inline]
pub fn write_filler(memory: &mut LinearMemory, gap: Address, size: u32) {
    debug_assert!(size >= ARRAY_OVERHEAD);
    memory.write_header(gap, ObjectHeader::new(ClassId::FILLER, FILLER_STAMP));
    memory.write_u32(gap + ARRAY_LENGTH_OFFSET, size - ARRAY_OVERHEAD);
}

/// Total size of the filler object at `gap`, header included.
#[inline(always)]
pub fn filler_size(memory: &LinearMemory, gap: Address) -> u32 {
    memory.read_u32(gap + ARRAY_LENGTH_OFFSET) + ARRAY_OVERHEAD
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapTable {
    entries: [Option<Address>; GAP_TABLE_SIZE],
}

impl GapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries = [None; GAP_TABLE_SIZE];
    }

    #[inline]
    pub fn has_gaps(&self) -> bool {
        self.entries.iter().any(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_gaps()
    }

    /// Tracked gap addresses in table order.
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.entries.iter().flatten().copied()
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.entries.contains(&Some(addr))
    }

    /// `(address, total size)` of every tracked gap, in table order.
    pub fn sizes(&self, memory: &LinearMemory) -> Vec<(Address, u32)> {
        self.iter().map(|gap| (gap, filler_size(memory, gap))).collect()
    }

    /// Slot holding the smallest gap; an empty slot counts as size zero.
    fn smallest(&self, memory: &LinearMemory) -> (usize, u32) {
        let mut smallest = (0, u32::MAX);
        for (idx, entry) in self.entries.iter().enumerate() {
            let size = entry.map_or(0, |gap| filler_size(memory, gap));
            if size < smallest.1 {
                smallest = (idx, size);
                if size == 0 {
                    break;
                }
            }
        }
        smallest
    }

    /// Offers the filler at `gap` of `size` bytes. It replaces the smallest
    /// tracked gap if it is larger than that one; returns whether it was kept.
    pub fn offer(&mut self, memory: &LinearMemory, gap: Address, size: u32) -> bool {
        if size <= MIN_TRACKED_GAP {
            return false;
        }
        let (idx, smallest) = self.smallest(memory);
        if size <= smallest {
            return false;
        }
        self.entries[idx] = Some(gap);
        true
    }

    /// First-fit lookup for an aligned allocation of `size` bytes.
    ///
    /// An exact fit consumes the whole entry. A larger gap keeps its filler at
    /// the original address, shrunk, and hands out its tail.
    pub fn take_fit(&mut self, memory: &mut LinearMemory, size: u32) -> Option<Address> {
        debug_assert!(size >= ARRAY_OVERHEAD);
        for entry in self.entries.iter_mut() {
            let Some(gap) = *entry else {
                continue;
            };
            let available = filler_size(memory, gap);
            if available == size {
                *entry = None;
                return Some(gap);
            }
            // the remainder must still hold a filler header
            if available >= size + ARRAY_OVERHEAD {
                let remaining = available - size;
                memory.write_u32(gap + ARRAY_LENGTH_OFFSET, remaining - ARRAY_OVERHEAD);
                return Some(gap + remaining);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_fillers(sizes: &[u32]) -> (LinearMemory, Vec<Address>) {
        let mut memory = LinearMemory::new(1, 1).expect("commit");
        let mut cursor = Address::new(64);
        let mut gaps = Vec::new();
        for &size in sizes {
            write_filler(&mut memory, cursor, size);
            gaps.push(cursor);
            cursor = cursor + size + 8;
        }
        (memory, gaps)
    }

    #[test]
    fn filler_describes_its_region() {
        let (memory, gaps) = memory_with_fillers(&[128]);
        let header = memory.read_header(gaps[0]);
        assert_eq!(header.class_id(), ClassId::BYTE_ARRAY);
        assert_eq!(header.stamp(), FILLER_STAMP);
        assert_eq!(filler_size(&memory, gaps[0]), 128);
    }

    #[test]
    fn small_gaps_are_not_tracked() {
        let (memory, gaps) = memory_with_fillers(&[MIN_TRACKED_GAP, MIN_TRACKED_GAP + 8]);
        let mut table = GapTable::new();
        assert!(!table.offer(&memory, gaps[0], MIN_TRACKED_GAP));
        assert!(table.offer(&memory, gaps[1], MIN_TRACKED_GAP + 8));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_table_keeps_the_largest() {
        let sizes: Vec<u32> = (1..=20).map(|i| 32 + i * 8).collect();
        let (memory, gaps) = memory_with_fillers(&sizes);
        let mut table = GapTable::new();
        for (&gap, &size) in gaps.iter().zip(&sizes) {
            table.offer(&memory, gap, size);
        }
        assert_eq!(table.len(), GAP_TABLE_SIZE);
        let mut kept: Vec<u32> = table.sizes(&memory).into_iter().map(|(_, s)| s).collect();
        kept.sort_unstable();
        assert_eq!(kept, sizes[sizes.len() - GAP_TABLE_SIZE..].to_vec());

        // not larger than the smallest tracked gap
        assert!(!table.offer(&memory, gaps[0], sizes[0]));
        assert!(!table.contains(gaps[0]));
    }

    #[test]
    fn exact_fit_consumes_the_entry() {
        let (mut memory, gaps) = memory_with_fillers(&[256]);
        let mut table = GapTable::new();
        table.offer(&memory, gaps[0], 256);
        assert_eq!(table.take_fit(&mut memory, 256), Some(gaps[0]));
        assert!(table.is_empty());
    }

    #[test]
    fn larger_gap_hands_out_its_tail() {
        let (mut memory, gaps) = memory_with_fillers(&[256]);
        let mut table = GapTable::new();
        table.offer(&memory, gaps[0], 256);

        let taken = table.take_fit(&mut memory, 64).expect("fits");
        assert_eq!(taken, gaps[0] + 192);
        assert_eq!(filler_size(&memory, gaps[0]), 192);
        assert!(table.contains(gaps[0]));

        // a remainder too small for a filler header does not fit
        assert_eq!(table.take_fit(&mut memory, 188), None);
        assert_eq!(table.take_fit(&mut memory, 184), Some(gaps[0] + 8));
        assert_eq!(filler_size(&memory, gaps[0]), 8);
    }

    #[test]
    fn first_fit_in_table_order() {
        let (mut memory, gaps) = memory_with_fillers(&[64, 512, 1024]);
        let mut table = GapTable::new();
        for (&gap, size) in gaps.iter().zip([64, 512, 1024]) {
            table.offer(&memory, gap, size);
        }
        let taken = table.take_fit(&mut memory, 128).expect("fits");
        assert_eq!(taken, gaps[1] + 384);
    }
}
