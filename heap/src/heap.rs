//! The heap handle and the state behind its lock.
//!
//! All heap bytes, the bump pointer, both gap tables, the weak registry and
//! the collector's cycle state live in one [`Space`] behind a single mutex,
//! the malloc lock. The owner thread takes it for every access; the helper
//! thread of the two-phase collector takes it once per sweep budget, so the
//! owner can keep allocating between two helper steps.

use std::{ops::Deref, sync::Arc};

use object::{
    ARRAY_LENGTH_OFFSET, ARRAY_OVERHEAD, Address, ArrayKind, ClassId, ClassTable, ObjectHeader,
    REFERENCE_SIZE,
};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    CallSite, CallSiteTable, GapTable, GcStats, LinearMemory, MemoryLayout, ShadowStack,
    WeakHandle, WeakRegistry,
    collector::CyclePhase,
    layout,
    memory::{MAX_PAGES, PAGE_SHIFT},
};

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration of the linear heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// 64 KiB pages committed at start. Raised if the static area and the
    /// shadow stack need more.
    pub initial_pages: u32,
    /// Hard maximum of committed pages. 65 536 pages cover the whole 32-bit
    /// address space.
    pub max_pages: u32,
    /// Bytes reserved for the shadow stack.
    pub stack_size: u32,
    /// Objects scanned per incremental step, and per lock acquisition of the
    /// helper phase.
    pub sweep_budget: usize,
    /// Pages ordinary allocation leaves untouched, so that a critical
    /// allocation can still succeed after running out of memory.
    pub critical_reserve_pages: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_pages: 16,    // 1 MiB
            max_pages: MAX_PAGES, // 4 GiB
            stack_size: 65_536,   // 16k entries
            sweep_budget: 20_000,
            critical_reserve_pages: 1,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_pages == 0 || self.max_pages == 0 {
            return Err("page counts must be > 0");
        }
        if self.max_pages > MAX_PAGES {
            return Err("max_pages exceeds the 32-bit address space");
        }
        if self.initial_pages > self.max_pages {
            return Err("initial_pages must not exceed max_pages");
        }
        if self.stack_size % REFERENCE_SIZE != 0 {
            return Err("stack_size must be a multiple of the reference size");
        }
        if self.sweep_budget == 0 {
            return Err("sweep_budget must be > 0");
        }
        if self.critical_reserve_pages >= self.max_pages {
            return Err("critical reserve must leave pages for allocation");
        }
        Ok(())
    }
}

// ── Space ─────────────────────────────────────────────────────────────

/// Everything guarded by the malloc lock.
#[derive(Debug)]
pub(crate) struct Space {
    pub(crate) memory: LinearMemory,
    /// Bump pointer; `[allocation_start, next_ptr)` is a walkable sequence of
    /// objects.
    pub(crate) next_ptr: Address,
    /// Gaps the allocator reuses.
    pub(crate) gaps: GapTable,
    pub(crate) weak: WeakRegistry,
    pub(crate) stack: ShadowStack,
    /// Cycle counter; increases by one per collection.
    pub(crate) generation: u32,
    /// Mark stamp of the current cycle. Never zero, fillers carry zero.
    pub(crate) stamp: u8,
    pub(crate) phase: CyclePhase,
    /// Bytes known free in gaps.
    pub(crate) free_memory: u64,
    pub(crate) critical: bool,
    pub(crate) reserve_pages: u32,
    pub(crate) last_stats: Option<GcStats>,
}

impl Space {
    fn new(memory: LinearMemory, layout: &MemoryLayout, reserve_pages: u32) -> Self {
        Self {
            memory,
            next_ptr: layout.allocation_start,
            gaps: GapTable::new(),
            weak: WeakRegistry::new(),
            stack: ShadowStack::new(layout),
            generation: 0,
            stamp: 1,
            phase: CyclePhase::Idle,
            free_memory: 0,
            critical: false,
            reserve_pages,
            last_stats: None,
        }
    }

    /// Starts a new cycle: bumps the generation and picks the next stamp,
    /// skipping the filler stamp.
    pub(crate) fn advance_generation(&mut self) -> u8 {
        self.generation = self.generation.wrapping_add(1);
        let mut next = self.stamp.wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.stamp = next;
        next
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Shared heap state. Settings, class metadata and the memory layout are
/// fixed at construction; everything mutable is behind the malloc lock.
#[derive(Debug)]
pub struct HeapInner {
    pub settings: HeapSettings,
    pub classes: ClassTable,
    pub layout: MemoryLayout,
    pub call_sites: CallSiteTable,
    pub(crate) space: Mutex<Space>,
}

impl HeapInner {
    pub fn new(settings: HeapSettings, classes: ClassTable, call_sites: CallSiteTable) -> Self {
        settings.validate().expect("Invalid Heap Settings");

        let layout = MemoryLayout::new(classes.static_area_size(), settings.stack_size)
            .expect("static area and shadow stack exceed the address space");
        assert!(
            (call_sites.len() as u64) < layout.allocation_start.get() as u64,
            "call-site markers must stay below the heap"
        );

        // at least one page of dynamic heap above the fixed regions
        let fixed_pages = (layout.allocation_start.get() >> PAGE_SHIFT) + 1;
        assert!(
            fixed_pages <= settings.max_pages,
            "Invalid Heap Settings: statics and shadow stack need {} pages, max_pages is {}",
            fixed_pages,
            settings.max_pages
        );
        let pages = settings.initial_pages.max(fixed_pages);
        let memory = LinearMemory::new(pages, settings.max_pages).expect("commit initial memory");

        log::debug!(
            "heap: {} pages committed, statics {}..{}, stack {}..{}, heap from {}",
            pages,
            layout.static_start,
            layout.static_end,
            layout.stack_limit,
            layout.stack_start,
            layout.allocation_start
        );

        let space = Space::new(memory, &layout, settings.critical_reserve_pages);
        Self {
            settings,
            classes,
            layout,
            call_sites,
            space: Mutex::new(space),
        }
    }

    #[inline(always)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Space> {
        self.space.lock()
    }

    /// Current cycle counter.
    pub fn generation(&self) -> u32 {
        self.lock().generation
    }

    /// Stamp reached objects carry after the current cycle's mark.
    pub fn stamp(&self) -> u8 {
        self.lock().stamp
    }

    /// Top of the allocated region.
    pub fn next_ptr(&self) -> Address {
        self.lock().next_ptr
    }

    pub fn committed_pages(&self) -> u32 {
        self.lock().memory.pages()
    }

    /// Bytes the gap tables know to be free.
    pub fn free_memory(&self) -> u64 {
        self.lock().free_memory
    }

    /// Statistics of the last completed cycle.
    pub fn last_stats(&self) -> Option<GcStats> {
        self.lock().last_stats.clone()
    }

    /// `(address, size)` of every gap the allocator can reuse.
    pub fn gaps(&self) -> Vec<(Address, u32)> {
        let space = self.lock();
        space.gaps.sizes(&space.memory)
    }

    /// Lets allocations use the critical reserve while set.
    pub fn set_critical_alloc(&self, critical: bool) {
        self.lock().critical = critical;
    }

    // ── Object access ─────────────────────────────────────────────────

    pub fn read_header(&self, addr: Address) -> ObjectHeader {
        self.lock().memory.read_header(addr)
    }

    pub fn write_header(&self, addr: Address, header: ObjectHeader) {
        self.lock().memory.write_header(addr, header);
    }

    #[inline]
    pub fn class_of(&self, addr: Address) -> ClassId {
        self.read_header(addr).class_id()
    }

    /// Total aligned size of the object at `addr`, header included.
    pub fn object_size(&self, addr: Address) -> u32 {
        let space = self.lock();
        layout::object_size(&space.memory, &self.classes, addr).1
    }

    pub fn array_length(&self, array: Address) -> u32 {
        self.lock().memory.read_u32(array + ARRAY_LENGTH_OFFSET)
    }

    /// Address of element `index` of an array of `kind`. Bounds are the
    /// caller's business.
    #[inline]
    pub fn element_address(&self, array: Address, kind: ArrayKind, index: u32) -> Address {
        array + ARRAY_OVERHEAD + (index << kind.element_shift())
    }

    pub fn read_u8(&self, addr: Address) -> u8 {
        self.lock().memory.read_u8(addr)
    }

    pub fn write_u8(&self, addr: Address, value: u8) {
        self.lock().memory.write_u8(addr, value);
    }

    pub fn read_u16(&self, addr: Address) -> u16 {
        self.lock().memory.read_u16(addr)
    }

    pub fn write_u16(&self, addr: Address, value: u16) {
        self.lock().memory.write_u16(addr, value);
    }

    pub fn read_u32(&self, addr: Address) -> u32 {
        self.lock().memory.read_u32(addr)
    }

    pub fn write_u32(&self, addr: Address, value: u32) {
        self.lock().memory.write_u32(addr, value);
    }

    pub fn read_u64(&self, addr: Address) -> u64 {
        self.lock().memory.read_u64(addr)
    }

    pub fn write_u64(&self, addr: Address, value: u64) {
        self.lock().memory.write_u64(addr, value);
    }

    pub fn read_bytes(&self, addr: Address, out: &mut [u8]) {
        self.lock().memory.read_bytes(addr, out);
    }

    pub fn write_bytes(&self, addr: Address, data: &[u8]) {
        self.lock().memory.write_bytes(addr, data);
    }

    /// Reads the reference stored at `slot`.
    pub fn read_ref(&self, slot: Address) -> Address {
        self.lock().memory.read_address(slot)
    }

    pub fn write_ref(&self, slot: Address, value: Address) {
        self.lock().memory.write_address(slot, value);
    }

    /// Reference field at byte `offset` of `obj`.
    #[inline]
    pub fn read_field(&self, obj: Address, offset: u32) -> Address {
        self.read_ref(obj + offset)
    }

    #[inline]
    pub fn write_field(&self, obj: Address, offset: u32, value: Address) {
        self.write_ref(obj + offset, value);
    }

    pub fn read_element(&self, array: Address, index: u32) -> Address {
        self.read_ref(self.element_address(array, ArrayKind::Object, index))
    }

    pub fn write_element(&self, array: Address, index: u32, value: Address) {
        self.write_ref(self.element_address(array, ArrayKind::Object, index), value);
    }

    // ── Statics ───────────────────────────────────────────────────────

    /// Address of the static slot at `offset` of the static area.
    #[inline]
    pub fn static_address(&self, offset: u32) -> Address {
        debug_assert!(offset < self.classes.static_area_size());
        self.layout.static_slot(offset)
    }

    pub fn read_static(&self, offset: u32) -> Address {
        self.read_ref(self.static_address(offset))
    }

    pub fn write_static(&self, offset: u32, value: Address) {
        self.write_ref(self.static_address(offset), value);
    }

    // ── Shadow stack ──────────────────────────────────────────────────

    /// Enters a frame by pushing its call-site marker.
    pub fn push_call_site(&self, marker: u32) {
        debug_assert!(self.call_sites.get(marker).is_some());
        let space = &mut *self.lock();
        space.stack.push(&mut space.memory, marker);
    }

    /// Pushes a reference the collector must keep alive while it is on the
    /// stack.
    pub fn push_ref(&self, obj: Address) {
        let space = &mut *self.lock();
        space.stack.push(&mut space.memory, obj.get());
    }

    /// Pops one stack entry. Returns `false` if the stack was empty.
    pub fn pop_stack(&self) -> bool {
        self.lock().stack.pop()
    }

    /// `(tracked entries, untracked overflow pushes)`.
    pub fn stack_depth(&self) -> (u32, u32) {
        let space = self.lock();
        (space.stack.depth(), space.stack.untracked())
    }

    /// Call sites on the tracked stack, innermost first. Reference entries
    /// are skipped.
    pub fn stack_trace(&self) -> Vec<&CallSite> {
        let space = self.lock();
        let trace = space
            .stack
            .entries(&space.memory)
            .filter(|&value| !self.layout.is_dynamic(Address::new(value)))
            .filter_map(|marker| self.call_sites.get(marker))
            .collect();
        trace
    }

    // ── Weak references ───────────────────────────────────────────────

    /// Creates a weak handle to `target`. Only targets inside the allocated
    /// heap can be invalidated by the collector.
    pub fn register_weak(&self, target: Address) -> WeakHandle {
        let mut space = self.lock();
        let tracked = self.layout.is_dynamic(target) && target < space.next_ptr;
        space.weak.register(target, tracked)
    }

    /// Target of `handle`, `None` once its target was found dead.
    ///
    /// While a sweep is in flight, a target the mark phase did not reach is
    /// reported as dead already, so it cannot be revived before the sweep
    /// frees it.
    pub fn resolve_weak(&self, handle: WeakHandle) -> Option<Address> {
        let space = self.lock();
        let target = space.weak.resolve(handle)?;
        if space.phase.is_sweeping()
            && space.weak.is_registered(target)
            && space.memory.stamp(target) != space.stamp
        {
            return None;
        }
        Some(target)
    }

    /// Drops `handle`. Returns `false` if it was already released.
    pub fn release_weak(&self, handle: WeakHandle) -> bool {
        self.lock().weak.release(handle)
    }

    /// Weak handles that still resolve.
    pub fn live_weak_handles(&self) -> usize {
        self.lock().weak.live_handles()
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings, classes: ClassTable) -> Self {
        Self::with_call_sites(settings, classes, CallSiteTable::default())
    }

    #[must_use]
    pub fn with_call_sites(
        settings: HeapSettings,
        classes: ClassTable,
        call_sites: CallSiteTable,
    ) -> Self {
        Self(Arc::new(HeapInner::new(settings, classes, call_sites)))
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ClassDef, ClassTableBuilder, FieldKind};

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            initial_pages: 2,
            max_pages: 64,
            stack_size: 256,
            sweep_budget: 64,
            critical_reserve_pages: 1,
        }
    }

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
        assert_eq!(create_test_settings().validate(), Ok(()));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = HeapSettings {
            initial_pages: 8,
            max_pages: 4,
            ..create_test_settings()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            sweep_budget: 0,
            ..create_test_settings()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            stack_size: 6,
            ..create_test_settings()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "Invalid Heap Settings")]
    fn heap_refuses_invalid_settings() {
        let settings = HeapSettings {
            max_pages: MAX_PAGES + 1,
            ..create_test_settings()
        };
        let _ = Heap::new(settings, ClassTable::builtin());
    }

    #[test]
    #[should_panic(expected = "Invalid Heap Settings")]
    fn heap_refuses_a_stack_larger_than_max_pages() {
        let settings = HeapSettings {
            initial_pages: 2,
            max_pages: 4,
            stack_size: 8 * crate::PAGE_SIZE,
            ..create_test_settings()
        };
        assert_eq!(settings.validate(), Ok(()));
        let _ = Heap::new(settings, ClassTable::builtin());
    }

    #[test]
    fn generation_stamps_skip_zero() {
        let heap = Heap::new(create_test_settings(), ClassTable::builtin());
        let mut space = heap.lock();
        assert_eq!(space.stamp, 1);
        for _ in 0..254 {
            space.advance_generation();
        }
        assert_eq!(space.stamp, 255);
        assert_eq!(space.advance_generation(), 1);
        assert_eq!(space.generation, 255);
    }

    #[test]
    fn statics_live_below_the_heap() {
        let mut builder = ClassTableBuilder::new();
        let holder = builder
            .define(ClassDef::new("Holder").static_field("root", FieldKind::Reference))
            .expect("define Holder");
        let classes = builder.build();
        let offset = classes.static_field_offset(holder, "root").expect("static slot");

        let heap = Heap::new(create_test_settings(), classes);
        let slot = heap.static_address(offset);
        assert!(!heap.layout.is_dynamic(slot));
        assert_eq!(heap.read_static(offset), Address::NULL);

        heap.write_static(offset, Address::new(0x1000));
        assert_eq!(heap.read_ref(slot), Address::new(0x1000));
    }

    #[test]
    fn stack_trace_resolves_call_sites() {
        let mut sites = CallSiteTable::new();
        let main = sites.add("Main", "main", 3);
        let step = sites.add("World", "step", 17);
        let heap = Heap::with_call_sites(create_test_settings(), ClassTable::builtin(), sites);

        heap.push_call_site(main);
        heap.push_ref(heap.layout.allocation_start);
        heap.push_call_site(step);

        let trace: Vec<String> = heap.stack_trace().iter().map(|s| s.to_string()).collect();
        assert_eq!(trace, vec!["World.step:17", "Main.main:3"]);
        assert_eq!(heap.stack_depth(), (3, 0));

        assert!(heap.pop_stack());
        assert_eq!(heap.stack_trace().len(), 1);
    }

    #[test]
    fn initial_commit_covers_the_fixed_regions() {
        let settings = HeapSettings {
            initial_pages: 1,
            stack_size: 70_000,
            ..create_test_settings()
        };
        let heap = Heap::new(settings, ClassTable::builtin());
        assert!(heap.committed_pages() >= 2);
        assert!(heap.layout.allocation_start.get() < heap.committed_pages() << PAGE_SHIFT);
    }
}
