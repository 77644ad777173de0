//! Sweep: the gap finder.
//!
//! One forward walk over `[allocation_start, end)`, where `end` is the bump
//! pointer when the cycle started. Runs of objects the mark phase did not
//! reach are rewritten into single filler objects and offered to a gap
//! table; a run at the very top of the heap is handed back to the bump
//! pointer instead. The walk keeps its state between calls so it can run to
//! completion, in budgeted steps, or on a helper thread.

use object::{Address, ClassTable};

use crate::{
    GapTable, LinearMemory, MemoryLayout,
    gaps::write_filler,
    heap::Space,
    layout::{corrupt, object_size},
};

/// Counters of one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepStats {
    pub(crate) scanned_objects: usize,
    pub(crate) gaps_found: usize,
    pub(crate) freed_bytes: u64,
    pub(crate) retracted_bytes: u64,
    pub(crate) invalidated_weak: usize,
}

#[derive(Debug)]
pub(crate) struct GapFinder {
    stamp: u8,
    cursor: Address,
    end: Address,
    gap_start: Address,
    was_used: bool,
    /// Weak targets at the start of the walk, ascending.
    weak_targets: Vec<Address>,
    next_weak: usize,
    /// Set for the helper phase: gaps are collected here while the allocator
    /// keeps using the primary table, whose entries count as used.
    secondary: Option<GapTable>,
    pub(crate) stats: SweepStats,
}

impl GapFinder {
    /// Snapshots the walk bounds and the weak targets. A walk that fills the
    /// primary table starts it from scratch.
    pub(crate) fn new(space: &mut Space, layout: &MemoryLayout, concurrent: bool) -> Self {
        let weak_targets = space.weak.sorted_targets();
        if !concurrent {
            space.gaps.clear();
            space.free_memory = 0;
        }
        log::trace!(
            "gap finder {}..{}, {} weak targets",
            layout.allocation_start,
            space.next_ptr,
            weak_targets.len()
        );
        Self {
            stamp: space.stamp,
            cursor: layout.allocation_start,
            end: space.next_ptr,
            gap_start: layout.allocation_start,
            was_used: true,
            weak_targets,
            next_weak: 0,
            secondary: concurrent.then(GapTable::new),
            stats: SweepStats::default(),
        }
    }

    #[inline]
    pub(crate) fn is_concurrent(&self) -> bool {
        self.secondary.is_some()
    }

    /// Gaps found by a helper-phase walk.
    pub(crate) fn take_secondary(&mut self) -> Option<GapTable> {
        self.secondary.take()
    }

    /// Whether `addr` is a weak target at the start of the walk; advances
    /// the sorted cursor past everything below it.
    fn is_weak_target(&mut self, addr: Address) -> bool {
        while self
            .weak_targets
            .get(self.next_weak)
            .is_some_and(|&target| target < addr)
        {
            self.next_weak += 1;
        }
        if self.weak_targets.get(self.next_weak) == Some(&addr) {
            self.next_weak += 1;
            return true;
        }
        false
    }

    /// Walks at most `budget` objects. Returns `true` once the walk reached
    /// its end and finished the last run.
    pub(crate) fn step(&mut self, space: &mut Space, classes: &ClassTable, budget: usize) -> bool {
        let concurrent = self.is_concurrent();
        let mut remaining = budget;

        while self.cursor < self.end {
            if remaining == 0 {
                return false;
            }
            remaining -= 1;

            let cursor = self.cursor;
            let (_, size) = object_size(&space.memory, classes, cursor);
            let mut used = space.memory.stamp(cursor) == self.stamp;

            if !used {
                if self.is_weak_target(cursor) {
                    self.stats.invalidated_weak += space.weak.invalidate(cursor);
                }
                // a gap the allocator may be carving right now
                if concurrent && space.gaps.contains(cursor) {
                    used = true;
                }
            }

            if used != self.was_used {
                if used {
                    self.finish_run(space, cursor - self.gap_start);
                } else {
                    self.gap_start = cursor;
                }
                self.was_used = used;
            }

            self.stats.scanned_objects += 1;
            self.cursor = cursor + size;
        }

        if self.cursor != self.end {
            corrupt(self.cursor, "object walk overran the bump pointer");
        }

        if !self.was_used {
            let run = self.end - self.gap_start;
            if space.next_ptr == self.end {
                space.next_ptr = self.gap_start;
                self.stats.retracted_bytes += run as u64;
                log::debug!("retracted bump pointer to {} by {}", self.gap_start, run);
            } else {
                // allocation moved the bump pointer meanwhile
                self.finish_run(space, run);
            }
            self.was_used = true;
        }
        true
    }

    /// Rewrites the run `[gap_start, gap_start + size)` into one filler and
    /// offers it to the target table.
    fn finish_run(&mut self, space: &mut Space, size: u32) {
        let gap = self.gap_start;
        write_filler(&mut space.memory, gap, size);
        self.stats.gaps_found += 1;
        self.stats.freed_bytes += size as u64;

        let Space { memory, gaps, free_memory, .. } = space;
        match self.secondary.as_mut() {
            Some(table) => {
                offer(memory, table, gap, size);
            }
            None => {
                *free_memory += size as u64;
                offer(memory, gaps, gap, size);
            }
        }
    }

    /// Runs the walk to its end.
    pub(crate) fn run(&mut self, space: &mut Space, classes: &ClassTable) {
        while !self.step(space, classes, usize::MAX) {}
    }
}

#[inline]
fn offer(memory: &LinearMemory, table: &mut GapTable, gap: Address, size: u32) {
    if table.offer(memory, gap, size) {
        log::trace!("tracking gap of {} bytes at {}", size, gap);
    }
}
