//! A linear-memory heap with a mark and sweep collector.
//!
//! Objects live in one growable, 32-bit addressed [`LinearMemory`] and are
//! placed by bump allocation or in gaps left by earlier cycles. Collection
//! never moves objects: the mark phase stamps everything reachable, and the
//! gap finder turns dead runs into fillers the allocator can reuse.

mod alloc;
mod collector;
mod error;
mod gaps;
mod heap;
mod layout;
mod mark;
mod memory;
mod roots;
mod scheduler;
mod sweep;
mod verify;
mod weak;

pub use collector::{GcPhase, GcStats, HelperOutcome, MarkToken};
pub use error::{HeapError, HeapResult};
pub use gaps::{FILLER_STAMP, GAP_TABLE_SIZE, GapTable, MIN_TRACKED_GAP};
pub use heap::*;
pub use layout::{MemoryLayout, NULL_GUARD, array_size};
pub use memory::{LinearMemory, MAX_PAGES, PAGE_SHIFT, PAGE_SIZE};
pub use roots::{CallSite, CallSiteTable, NoRoots, RootProvider, ShadowStack};
pub use scheduler::{CollectorMode, GcScheduler, HelperThread, SchedulerSettings};
pub use verify::{ClassUsage, HeapReport};
pub use weak::{WeakHandle, WeakRegistry};
