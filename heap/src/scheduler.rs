//! Drives collection cycles from a host loop.
//!
//! The host calls [`GcScheduler::tick`] once per frame. Every `interval`
//! ticks, or on the tick after [`GcScheduler::request_collection`], a cycle
//! starts in the configured [`CollectorMode`]; unfinished incremental and
//! parallel cycles advance on the following ticks.

use std::{
    any::Any,
    io, mem,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    GcPhase, GcStats, Heap, HeapError, HeapResult, HelperOutcome, MarkToken, RootProvider,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectorMode {
    /// A whole cycle on the due tick.
    Serial,
    /// Mark on the due tick, then one sweep budget per tick.
    #[default]
    Incremental,
    /// Mark on the due tick, find gaps on a helper thread, publish on the
    /// first tick after it finished.
    Parallel,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub mode: CollectorMode,
    /// Ticks between two cycles.
    pub interval: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            mode: CollectorMode::default(),
            interval: 2000,
        }
    }
}

// ── Helper thread ─────────────────────────────────────────────────────

#[derive(Default)]
struct HelperSlot {
    pending: Option<MarkToken>,
    running: bool,
    done: Option<HeapResult<HelperOutcome>>,
    /// Payload of a panic in the helper phase, raised again on the owner.
    panicked: Option<Box<dyn Any + Send>>,
    shutdown: bool,
}

impl HelperSlot {
    fn take_done(&mut self) -> Option<HeapResult<HelperOutcome>> {
        if let Some(payload) = self.panicked.take() {
            panic::resume_unwind(payload);
        }
        self.done.take()
    }
}

#[derive(Default)]
struct HelperShared {
    slot: Mutex<HelperSlot>,
    changed: Condvar,
}

/// A thread that runs the helper phase of two-phase cycles handed to it.
pub struct HelperThread {
    shared: Arc<HelperShared>,
    handle: Option<JoinHandle<()>>,
}

impl HelperThread {
    pub fn spawn(heap: Heap) -> io::Result<Self> {
        let shared = Arc::new(HelperShared::default());
        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("gc-helper".into())
                .spawn(move || helper_loop(&heap, &shared))?
        };
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Hands a marked cycle to the thread.
    pub fn submit(&self, token: MarkToken) {
        let mut slot = self.shared.slot.lock();
        debug_assert!(slot.pending.is_none() && !slot.running && slot.done.is_none());
        log::trace!("gc #{}: handing off to the helper", token.generation());
        slot.pending = Some(token);
        self.shared.changed.notify_all();
    }

    /// Whether a submitted cycle has not been taken back yet.
    pub fn is_busy(&self) -> bool {
        let slot = self.shared.slot.lock();
        slot.pending.is_some() || slot.running || slot.done.is_some() || slot.panicked.is_some()
    }

    /// The outcome of the submitted cycle, if the thread finished it.
    ///
    /// # Panics
    ///
    /// Re-raises a panic of the helper phase, such as a corrupt heap.
    pub fn try_take(&self) -> Option<HeapResult<HelperOutcome>> {
        self.shared.slot.lock().take_done()
    }

    /// Blocks until the submitted cycle finished. `None` if nothing was
    /// submitted.
    ///
    /// # Panics
    ///
    /// Re-raises a panic of the helper phase, such as a corrupt heap.
    pub fn wait(&self) -> Option<HeapResult<HelperOutcome>> {
        let mut slot = self.shared.slot.lock();
        while slot.pending.is_some() || slot.running {
            self.shared.changed.wait(&mut slot);
        }
        slot.take_done()
    }
}

fn helper_loop(heap: &Heap, shared: &HelperShared) {
    let mut slot = shared.slot.lock();
    loop {
        if slot.shutdown {
            break;
        }
        if let Some(token) = slot.pending.take() {
            slot.running = true;
            let outcome = MutexGuard::unlocked(&mut slot, || {
                panic::catch_unwind(AssertUnwindSafe(|| heap.run_helper_phase(token)))
            });
            slot.running = false;
            match outcome {
                Ok(outcome) => slot.done = Some(outcome),
                Err(payload) => slot.panicked = Some(payload),
            }
            shared.changed.notify_all();
            continue;
        }
        shared.changed.wait(&mut slot);
    }
    log::debug!("gc helper thread stopped");
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock();
            slot.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────

enum Driver {
    Serial,
    Incremental,
    Parallel(HelperThread),
}

pub struct GcScheduler {
    heap: Heap,
    settings: SchedulerSettings,
    driver: Driver,
    ticks: u32,
    requested: bool,
    cycles: u64,
}

impl GcScheduler {
    /// Spawns the helper thread in parallel mode.
    pub fn new(heap: Heap, settings: SchedulerSettings) -> io::Result<Self> {
        let driver = match settings.mode {
            CollectorMode::Serial => Driver::Serial,
            CollectorMode::Incremental => Driver::Incremental,
            CollectorMode::Parallel => Driver::Parallel(HelperThread::spawn(heap.clone())?),
        };
        log::debug!(
            "gc scheduler: {:?} every {} ticks",
            settings.mode,
            settings.interval
        );
        Ok(Self {
            heap,
            settings,
            driver,
            ticks: 0,
            requested: false,
            cycles: 0,
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Makes the next tick start a cycle.
    pub fn request_collection(&mut self) {
        self.requested = true;
    }

    /// Advances the collector by one frame. Returns the statistics of a
    /// cycle that completed on this tick.
    pub fn tick(&mut self, roots: &mut dyn RootProvider) -> HeapResult<Option<GcStats>> {
        if self.heap.phase() != GcPhase::Idle {
            return self.advance();
        }

        self.ticks += 1;
        if self.ticks < self.settings.interval && !mem::take(&mut self.requested) {
            return Ok(None);
        }
        self.ticks = 0;
        self.requested = false;

        let stats = match &self.driver {
            Driver::Serial => self.heap.run_gc(roots)?,
            Driver::Incremental => {
                self.heap.begin_gc(roots)?;
                return Ok(None);
            }
            Driver::Parallel(helper) => {
                let token = self.heap.begin_concurrent_gc(roots)?;
                helper.submit(token);
                return Ok(None);
            }
        };
        Ok(Some(self.completed(stats)))
    }

    /// One step of the cycle in flight.
    fn advance(&mut self) -> HeapResult<Option<GcStats>> {
        let stats = match (&self.driver, self.heap.phase()) {
            (_, GcPhase::Sweeping) => {
                if !self.heap.step_gc()? {
                    return Ok(None);
                }
                self.heap.last_stats()
            }
            (Driver::Parallel(helper), _) => match helper.try_take() {
                Some(outcome) => Some(self.heap.publish(outcome?)?),
                None => return Ok(None),
            },
            // a two-phase cycle someone else started
            _ => return Err(HeapError::CollectionInProgress),
        };
        Ok(stats.map(|stats| self.completed(stats)))
    }

    /// Completes the cycle in flight, if any, blocking on the helper.
    pub fn finish(&mut self) -> HeapResult<Option<GcStats>> {
        let stats = match (&self.driver, self.heap.phase()) {
            (_, GcPhase::Idle) => return Ok(None),
            (_, GcPhase::Sweeping) => self.heap.finish_gc()?,
            (Driver::Parallel(helper), _) => match helper.wait() {
                Some(outcome) => Some(self.heap.publish(outcome?)?),
                None => return Err(HeapError::CollectionInProgress),
            },
            _ => return Err(HeapError::CollectionInProgress),
        };
        Ok(stats.map(|stats| self.completed(stats)))
    }

    /// Completes the cycle in flight, then runs a whole one.
    pub fn collect_now(&mut self, roots: &mut dyn RootProvider) -> HeapResult<GcStats> {
        self.finish()?;
        let stats = self.heap.run_gc(roots)?;
        self.ticks = 0;
        Ok(self.completed(stats))
    }

    fn completed(&mut self, stats: GcStats) -> GcStats {
        self.cycles += 1;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapSettings, NoRoots};
    use object::{Address, ClassDef, ClassId, ClassTableBuilder, FieldKind, ObjectHeader};

    struct TestRoots {
        roots: Vec<Address>,
        visits: usize,
    }

    impl RootProvider for TestRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(Address)) {
            self.visits += 1;
            self.roots.iter().copied().for_each(visitor);
        }
    }

    fn create_test_heap() -> (Heap, ClassId) {
        let mut builder = ClassTableBuilder::new();
        let node = builder
            .define(ClassDef::new("Node").field("next", FieldKind::Reference))
            .expect("define Node");
        let settings = HeapSettings {
            initial_pages: 4,
            max_pages: 256,
            stack_size: 256,
            sweep_budget: 32,
            critical_reserve_pages: 1,
        };
        (Heap::new(settings, builder.build()), node)
    }

    fn scheduler(heap: &Heap, mode: CollectorMode, interval: u32) -> GcScheduler {
        GcScheduler::new(heap.clone(), SchedulerSettings { mode, interval }).expect("scheduler")
    }

    fn garbage(heap: &Heap, node: ClassId, count: usize) -> Address {
        let keep = heap.allocate_object(node).expect("alloc");
        for _ in 0..count {
            heap.allocate_object(node).expect("alloc");
        }
        keep
    }

    #[test]
    fn default_settings() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.mode, CollectorMode::Incremental);
        assert_eq!(settings.interval, 2000);
    }

    #[test]
    fn serial_mode_collects_every_interval() {
        let (heap, node) = create_test_heap();
        let mut gc = scheduler(&heap, CollectorMode::Serial, 5);
        let mut roots = TestRoots {
            roots: vec![garbage(&heap, node, 20)],
            visits: 0,
        };

        for _ in 0..4 {
            assert_eq!(gc.tick(&mut roots), Ok(None));
        }
        let stats = gc.tick(&mut roots).expect("tick").expect("cycle");
        assert_eq!(stats.marked_objects, 1);
        assert_eq!(roots.visits, 1);
        assert_eq!(gc.cycles(), 1);

        for _ in 0..10 {
            gc.tick(&mut roots).expect("tick");
        }
        assert_eq!(gc.cycles(), 3);
    }

    #[test]
    fn incremental_mode_steps_once_per_tick() {
        let (heap, node) = create_test_heap();
        let mut gc = scheduler(&heap, CollectorMode::Incremental, 1);
        let keep = garbage(&heap, node, 99);
        let mut roots = vec![keep];

        assert_eq!(gc.tick(&mut roots), Ok(None));
        assert_eq!(heap.phase(), GcPhase::Sweeping);
        // 100 objects, 32 per step
        let mut ticks = 0;
        let stats = loop {
            ticks += 1;
            if let Some(stats) = gc.tick(&mut roots).expect("tick") {
                break stats;
            }
        };
        assert_eq!(ticks, 4);
        assert_eq!(stats.marked_objects, 1);
        assert_eq!(heap.phase(), GcPhase::Idle);
    }

    #[test]
    fn requested_collections_start_on_the_next_tick() {
        let (heap, node) = create_test_heap();
        let mut gc = scheduler(&heap, CollectorMode::Serial, 1000);
        garbage(&heap, node, 3);

        assert_eq!(gc.tick(&mut NoRoots), Ok(None));
        gc.request_collection();
        assert!(gc.tick(&mut NoRoots).expect("tick").is_some());
        assert_eq!(gc.tick(&mut NoRoots), Ok(None));
    }

    #[test]
    fn parallel_mode_publishes_after_the_helper() {
        let (heap, node) = create_test_heap();
        let mut gc = scheduler(&heap, CollectorMode::Parallel, 1);
        let keep = garbage(&heap, node, 500);
        let tail = heap.allocate_object(node).expect("alloc");
        let mut roots = vec![keep, tail];

        assert_eq!(gc.tick(&mut roots), Ok(None));
        assert_ne!(heap.phase(), GcPhase::Idle);

        let stats = loop {
            if let Some(stats) = gc.tick(&mut roots).expect("tick") {
                break stats;
            }
            thread::yield_now();
        };
        assert_eq!(stats.freed_bytes, 500 * 8);
        assert_eq!(heap.gaps(), vec![(keep + 8, 4000)]);
        assert_eq!(gc.cycles(), 1);
    }

    #[test]
    fn finish_drains_the_cycle_in_flight() {
        for mode in [CollectorMode::Incremental, CollectorMode::Parallel] {
            let (heap, node) = create_test_heap();
            let mut gc = scheduler(&heap, mode, 1);
            let mut roots = vec![garbage(&heap, node, 300)];

            assert_eq!(gc.finish(), Ok(None));
            gc.tick(&mut roots).expect("tick");
            let stats = gc.finish().expect("finish").expect("stats");
            assert_eq!(stats.marked_objects, 1, "{:?}", mode);
            assert_eq!(heap.phase(), GcPhase::Idle);

            let stats = gc.collect_now(&mut roots).expect("collect");
            assert_eq!(stats.generation, 2);
            assert_eq!(gc.cycles(), 2);
        }
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn helper_panics_reach_the_owner() {
        let (heap, node) = create_test_heap();
        let keep = heap.allocate_object(node).expect("alloc");
        let dead = heap.allocate_object(node).expect("alloc");
        heap.allocate_object(node).expect("alloc");
        let helper = HelperThread::spawn(heap.clone()).expect("spawn");

        let token = heap.begin_concurrent_gc(&mut vec![keep]).expect("mark");
        heap.write_header(dead, ObjectHeader::from_raw(0x00ff_fff0));
        helper.submit(token);
        helper.wait();
    }

    #[test]
    fn helper_thread_shuts_down_on_drop() {
        let (heap, _) = create_test_heap();
        let helper = HelperThread::spawn(heap.clone()).expect("spawn");
        assert!(!helper.is_busy());
        assert!(helper.wait().is_none());

        let token = heap.begin_concurrent_gc(&mut NoRoots).expect("mark");
        helper.submit(token);
        let outcome = helper.wait().expect("submitted").expect("helper phase");
        heap.publish(outcome).expect("publish");
        drop(helper);
        assert_eq!(heap.phase(), GcPhase::Idle);
    }
}
