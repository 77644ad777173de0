//! Collection cycles.
//!
//! A cycle is mark, then the gap finder, then publishing the found gaps. It
//! runs in one of three ways:
//!
//! - [`run_gc`](HeapInner::run_gc) does everything in one call;
//! - [`begin_gc`](HeapInner::begin_gc) marks, and every
//!   [`step_gc`](HeapInner::step_gc) walks one budget of objects;
//! - [`begin_concurrent_gc`](HeapInner::begin_concurrent_gc) marks on the
//!   owner thread and hands out a [`MarkToken`]. A helper thread turns it
//!   into a [`HelperOutcome`] with
//!   [`run_helper_phase`](HeapInner::run_helper_phase) while the owner keeps
//!   allocating from the old gaps, and the owner installs the new gaps with
//!   [`publish`](HeapInner::publish).

use std::{
    fmt, mem,
    time::{Duration, Instant},
};

use object::Address;
use parking_lot::MutexGuard;

use crate::{
    HeapError, HeapInner, HeapResult, RootProvider,
    heap::Space,
    sweep::{GapFinder, SweepStats},
};

// ── Phases ────────────────────────────────────────────────────────────

/// Where the heap is in its collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    /// Incremental sweep in progress.
    Sweeping,
    /// Marked, the token has not reached a helper yet.
    MarkDone,
    HelperRunning,
    /// The helper finished; waiting for `publish`.
    HelperDone,
}

#[derive(Debug)]
pub(crate) struct IncrementalCycle {
    mark: MarkStats,
    finder: GapFinder,
    sweep_time: Duration,
}

#[derive(Debug, Default)]
pub(crate) enum CyclePhase {
    #[default]
    Idle,
    Incremental(Box<IncrementalCycle>),
    MarkDone { generation: u32 },
    HelperRunning { generation: u32 },
    HelperDone { generation: u32 },
}

impl CyclePhase {
    fn public(&self) -> GcPhase {
        match self {
            CyclePhase::Idle => GcPhase::Idle,
            CyclePhase::Incremental(_) => GcPhase::Sweeping,
            CyclePhase::MarkDone { .. } => GcPhase::MarkDone,
            CyclePhase::HelperRunning { .. } => GcPhase::HelperRunning,
            CyclePhase::HelperDone { .. } => GcPhase::HelperDone,
        }
    }

    /// Between the mark phase and the end of the walk of the same cycle.
    #[inline]
    pub(crate) fn is_sweeping(&self) -> bool {
        !matches!(self, CyclePhase::Idle)
    }
}

// ── Statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct MarkStats {
    generation: u32,
    marked_objects: usize,
    mark_time: Duration,
}

/// Result of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub generation: u32,
    pub marked_objects: usize,
    /// Dead runs rewritten into fillers, tracked or not.
    pub gaps_found: usize,
    pub freed_bytes: u64,
    /// Bytes handed back to the bump pointer.
    pub retracted_bytes: u64,
    pub invalidated_weak: usize,
    pub mark_time: Duration,
    pub sweep_time: Duration,
}

impl GcStats {
    fn new(mark: MarkStats, sweep: SweepStats, sweep_time: Duration) -> Self {
        Self {
            generation: mark.generation,
            marked_objects: mark.marked_objects,
            gaps_found: sweep.gaps_found,
            freed_bytes: sweep.freed_bytes,
            retracted_bytes: sweep.retracted_bytes,
            invalidated_weak: sweep.invalidated_weak,
            mark_time: mark.mark_time,
            sweep_time,
        }
    }
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gc #{}: {} marked in {:?}, {} gaps ({} bytes) and {} bytes retracted in {:?}",
            self.generation,
            self.marked_objects,
            self.mark_time,
            self.gaps_found,
            self.freed_bytes,
            self.retracted_bytes,
            self.sweep_time
        )?;
        if self.invalidated_weak > 0 {
            write!(f, ", {} weak handles cleared", self.invalidated_weak)?;
        }
        Ok(())
    }
}

// ── Two-phase tokens ──────────────────────────────────────────────────

/// Proof that the mark phase of a two-phase cycle completed. Consumed by
/// the helper phase.
#[must_use = "the heap stays in the marked phase until the token is swept and published"]
#[derive(Debug)]
pub struct MarkToken {
    mark: MarkStats,
    finder: GapFinder,
}

impl MarkToken {
    pub fn generation(&self) -> u32 {
        self.mark.generation
    }
}

/// Gaps found by the helper phase, ready to be published by the owner.
#[must_use = "the found gaps are only used once published"]
#[derive(Debug)]
pub struct HelperOutcome {
    mark: MarkStats,
    finder: GapFinder,
    sweep_time: Duration,
}

impl HelperOutcome {
    pub fn generation(&self) -> u32 {
        self.mark.generation
    }
}

fn collect_roots(roots: &mut dyn RootProvider) -> Vec<Address> {
    let mut out = Vec::new();
    roots.visit_roots(&mut |addr| out.push(addr));
    out
}

// ── Cycle API ─────────────────────────────────────────────────────────

impl HeapInner {
    pub fn phase(&self) -> GcPhase {
        self.lock().phase.public()
    }

    /// Gathers the host roots and locks the heap for a new cycle.
    fn lock_idle(&self, roots: &mut dyn RootProvider) -> HeapResult<(MutexGuard<'_, Space>, Vec<Address>)> {
        // the provider may read the heap, so it runs before locking
        let host_roots = collect_roots(roots);
        let space = self.lock();
        if space.phase.is_sweeping() {
            return Err(HeapError::CollectionInProgress);
        }
        Ok((space, host_roots))
    }

    fn mark_phase(&self, space: &mut Space, host_roots: &[Address]) -> MarkStats {
        let start = Instant::now();
        space.advance_generation();
        let marked_objects = space.mark(&self.classes, &self.layout, host_roots);
        let mark = MarkStats {
            generation: space.generation,
            marked_objects,
            mark_time: start.elapsed(),
        };
        log::debug!(
            "gc #{}: marked {} objects in {:?}",
            mark.generation,
            marked_objects,
            mark.mark_time
        );
        mark
    }

    fn finish_cycle(
        &self,
        space: &mut Space,
        mark: MarkStats,
        sweep: SweepStats,
        sweep_time: Duration,
    ) -> GcStats {
        let stats = GcStats::new(mark, sweep, sweep_time);
        log::info!("{}", stats);
        log::debug!(
            "heap top {}, {} pages committed, {} gaps tracked",
            space.next_ptr,
            space.memory.pages(),
            space.gaps.len()
        );
        space.phase = CyclePhase::Idle;
        space.last_stats = Some(stats.clone());
        stats
    }

    /// Runs a whole cycle.
    pub fn run_gc(&self, roots: &mut dyn RootProvider) -> HeapResult<GcStats> {
        let (mut space, host_roots) = self.lock_idle(roots)?;
        let mark = self.mark_phase(&mut space, &host_roots);

        let start = Instant::now();
        let mut finder = GapFinder::new(&mut space, &self.layout, false);
        finder.run(&mut space, &self.classes);
        Ok(self.finish_cycle(&mut space, mark, finder.stats, start.elapsed()))
    }

    /// Marks and prepares an incremental sweep. Until it is done, the
    /// allocator only reuses gaps the sweep has found so far.
    pub fn begin_gc(&self, roots: &mut dyn RootProvider) -> HeapResult<()> {
        let (mut space, host_roots) = self.lock_idle(roots)?;
        let mark = self.mark_phase(&mut space, &host_roots);

        let start = Instant::now();
        let finder = GapFinder::new(&mut space, &self.layout, false);
        space.phase = CyclePhase::Incremental(Box::new(IncrementalCycle {
            mark,
            finder,
            sweep_time: start.elapsed(),
        }));
        Ok(())
    }

    /// Walks one budget of objects. Returns `true` when the cycle completed.
    pub fn step_gc(&self) -> HeapResult<bool> {
        let mut space = self.lock();
        let mut cycle = match mem::take(&mut space.phase) {
            CyclePhase::Incremental(cycle) => cycle,
            other => {
                space.phase = other;
                return Err(HeapError::NoCollectionInProgress);
            }
        };

        let start = Instant::now();
        let done = cycle
            .finder
            .step(&mut space, &self.classes, self.settings.sweep_budget);
        cycle.sweep_time += start.elapsed();

        if done {
            let IncrementalCycle {
                mark,
                finder,
                sweep_time,
            } = *cycle;
            self.finish_cycle(&mut space, mark, finder.stats, sweep_time);
        } else {
            log::trace!(
                "gc #{}: {} objects scanned",
                cycle.mark.generation,
                cycle.finder.stats.scanned_objects
            );
            space.phase = CyclePhase::Incremental(cycle);
        }
        Ok(done)
    }

    /// Runs an incremental sweep to its end, if one is in progress.
    pub fn finish_gc(&self) -> HeapResult<Option<GcStats>> {
        if self.phase() != GcPhase::Sweeping {
            return Ok(None);
        }
        while !self.step_gc()? {}
        Ok(self.last_stats())
    }

    /// Mark phase of a two-phase cycle, on the owner thread.
    pub fn begin_concurrent_gc(&self, roots: &mut dyn RootProvider) -> HeapResult<MarkToken> {
        let (mut space, host_roots) = self.lock_idle(roots)?;
        let mark = self.mark_phase(&mut space, &host_roots);
        let finder = GapFinder::new(&mut space, &self.layout, true);
        space.phase = CyclePhase::MarkDone {
            generation: mark.generation,
        };
        Ok(MarkToken { mark, finder })
    }

    /// Gap finding of a two-phase cycle. Meant for a helper thread: the
    /// heap is locked one budget at a time, and released fairly in between
    /// so the owner can allocate.
    pub fn run_helper_phase(&self, token: MarkToken) -> HeapResult<HelperOutcome> {
        let MarkToken { mark, mut finder } = token;
        let generation = mark.generation;
        {
            let mut space = self.lock();
            match space.phase {
                CyclePhase::MarkDone { generation: current } if current == generation => {}
                _ => return Err(HeapError::NoCollectionInProgress),
            }
            space.phase = CyclePhase::HelperRunning { generation };
        }

        let start = Instant::now();
        let mut steps = 0usize;
        loop {
            let mut space = self.lock();
            match space.phase {
                CyclePhase::HelperRunning { generation: current } if current == generation => {}
                _ => return Err(HeapError::NoCollectionInProgress),
            }
            steps += 1;
            if finder.step(&mut space, &self.classes, self.settings.sweep_budget) {
                space.phase = CyclePhase::HelperDone { generation };
                break;
            }
            MutexGuard::unlock_fair(space);
        }
        let sweep_time = start.elapsed();
        log::debug!(
            "gc #{}: helper phase done in {} steps, {:?}",
            generation,
            steps,
            sweep_time
        );

        Ok(HelperOutcome {
            mark,
            finder,
            sweep_time,
        })
    }

    /// Installs the helper's gaps as the allocator's table and ends the
    /// cycle.
    pub fn publish(&self, outcome: HelperOutcome) -> HeapResult<GcStats> {
        let HelperOutcome {
            mark,
            mut finder,
            sweep_time,
        } = outcome;

        let mut space = self.lock();
        match space.phase {
            CyclePhase::HelperDone { generation } if generation == mark.generation => {}
            _ => return Err(HeapError::NoCollectionInProgress),
        }
        if let Some(gaps) = finder.take_secondary() {
            space.gaps = gaps;
        }
        space.free_memory = finder.stats.freed_bytes;
        Ok(self.finish_cycle(&mut space, mark, finder.stats, sweep_time))
    }
}
