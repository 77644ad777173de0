//! A synthetic mutator: a rooted forest of nodes that grows, gets relinked
//! and dropped frame by frame.

use heap::{CallSiteTable, Heap, HeapResult, HeapSettings, WeakHandle};
use object::{Address, ArrayKind, ClassDef, ClassId, ClassTableBuilder, FieldKind};

/// Slots of the rooted array held in `Registry.roots`.
pub const ROOT_SLOTS: u32 = 1024;
/// Objects the host keeps alive on its own.
const PINNED: usize = 8;
const MAX_WEAK: usize = 256;

pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self, bound: u32) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((self.0 >> 33) % bound as u64) as u32
    }
}

struct Layout {
    node: ClassId,
    left: u32,
    right: u32,
    payload: u32,
    roots_slot: u32,
}

struct Sites {
    frame: u32,
    spawn: u32,
    relink: u32,
}

#[derive(Debug, Default)]
pub struct WorldStats {
    pub frames: u64,
    pub objects: u64,
    pub bytes: u64,
    pub weak_revived: u64,
    pub weak_cleared: u64,
    pub oom_retries: u64,
}

pub struct World {
    pub heap: Heap,
    layout: Layout,
    sites: Sites,
    roots: Address,
    /// Host-held references, reported through the root provider.
    pub pinned: Vec<Address>,
    weak: Vec<WeakHandle>,
    rng: Rng,
    pub stats: WorldStats,
}

impl World {
    pub fn new(settings: HeapSettings, seed: u64) -> Result<Self, String> {
        let mut builder = ClassTableBuilder::new();
        let node = builder
            .define(
                ClassDef::new("Node")
                    .field("left", FieldKind::Reference)
                    .field("right", FieldKind::Reference)
                    .field("payload", FieldKind::Int),
            )
            .map_err(|err| err.to_string())?;
        let registry = builder
            .define(
                ClassDef::new("Registry")
                    .static_field("roots", FieldKind::Reference)
                    .static_field("frames", FieldKind::Long),
            )
            .map_err(|err| err.to_string())?;
        let classes = builder.build();
        let field = |name: &str| {
            classes
                .field_offset(node, name)
                .ok_or_else(|| format!("Node has no field `{}`", name))
        };
        let layout = Layout {
            node,
            left: field("left")?,
            right: field("right")?,
            payload: field("payload")?,
            roots_slot: classes
                .static_field_offset(registry, "roots")
                .ok_or("Registry has no static `roots`")?,
        };

        let mut call_sites = CallSiteTable::new();
        let sites = Sites {
            frame: call_sites.add("World", "frame", 1),
            spawn: call_sites.add("World", "spawn", 2),
            relink: call_sites.add("World", "relink", 3),
        };

        let heap = Heap::with_call_sites(settings, classes, call_sites);
        let roots = heap
            .allocate_array(ArrayKind::Object, ROOT_SLOTS as i32)
            .map_err(|err| err.to_string())?;
        heap.write_static(layout.roots_slot, roots);

        Ok(Self {
            heap,
            layout,
            sites,
            roots,
            pinned: Vec::with_capacity(PINNED),
            weak: Vec::new(),
            rng: Rng::new(seed),
            stats: WorldStats::default(),
        })
    }

    /// Runs one frame of mutator work. The shadow stack is balanced again on
    /// return, error or not.
    pub fn frame(&mut self, objects: u32) -> HeapResult<()> {
        self.heap.push_call_site(self.sites.frame);
        let mut pushed = 1;
        let result = self.frame_body(objects, &mut pushed);
        for _ in 0..pushed {
            self.heap.pop_stack();
        }
        self.stats.frames += 1;
        result
    }

    fn frame_body(&mut self, objects: u32, pushed: &mut u32) -> HeapResult<()> {
        let mut temps = 0;
        for _ in 0..objects {
            let obj = match self.rng.next(16) {
                0 => self.spawn_array()?,
                _ => self.spawn_node()?,
            };

            match self.rng.next(10) {
                // replaces a root, dropping whatever hung there
                0 => {
                    let slot = self.rng.next(ROOT_SLOTS);
                    self.heap.write_element(self.roots, slot, obj);
                }
                1 | 2 => self.attach(obj),
                // kept alive by the frame only
                3 if temps < 16 => {
                    self.heap.push_ref(obj);
                    *pushed += 1;
                    temps += 1;
                }
                4 => self.pin(obj),
                _ => {}
            }

            if self.rng.next(32) == 0 && self.heap.class_of(obj) == self.layout.node {
                self.watch(obj);
            }
        }
        self.revive();
        Ok(())
    }

    fn spawn_node(&mut self) -> HeapResult<Address> {
        let node = self.layout.node;
        let obj = self.allocate(|heap| heap.allocate_object(node))?;
        self.heap
            .write_u32(obj + self.layout.payload, self.stats.objects as u32);
        Ok(obj)
    }

    fn spawn_array(&mut self) -> HeapResult<Address> {
        let length = self.rng.next(512) as i32;
        let kind = match self.rng.next(3) {
            0 => ArrayKind::Byte,
            1 => ArrayKind::Int,
            _ => ArrayKind::Double,
        };
        self.heap.push_call_site(self.sites.spawn);
        let result = self.allocate(|heap| heap.allocate_array(kind, length));
        self.heap.pop_stack();
        result
    }

    /// Allocates, retrying once with the critical reserve when memory runs
    /// out.
    fn allocate(&mut self, f: impl Fn(&Heap) -> HeapResult<Address>) -> HeapResult<Address> {
        let obj = match f(&self.heap) {
            Ok(obj) => obj,
            Err(err) if err.is_out_of_memory() => {
                log::warn!("{}, retrying from the reserve", err);
                self.stats.oom_retries += 1;
                self.heap.set_critical_alloc(true);
                let retry = f(&self.heap);
                self.heap.set_critical_alloc(false);
                retry?
            }
            Err(err) => return Err(err),
        };
        self.stats.objects += 1;
        self.stats.bytes += self.heap.object_size(obj) as u64;
        Ok(obj)
    }

    /// Hangs `obj` below a rooted node, if the chosen root holds one.
    fn attach(&mut self, obj: Address) {
        let parent = self
            .heap
            .read_element(self.roots, self.rng.next(ROOT_SLOTS));
        if parent.is_null() || self.heap.class_of(parent) != self.layout.node {
            return;
        }
        let field = if self.rng.next(2) == 0 {
            self.layout.left
        } else {
            self.layout.right
        };
        self.heap.write_field(parent, field, obj);
    }

    fn pin(&mut self, obj: Address) {
        if self.pinned.len() == PINNED {
            let victim = self.rng.next(PINNED as u32) as usize;
            self.pinned[victim] = obj;
        } else {
            self.pinned.push(obj);
        }
    }

    fn watch(&mut self, obj: Address) {
        if self.weak.len() == MAX_WEAK {
            let handle = self.weak.swap_remove(0);
            self.heap.release_weak(handle);
        }
        self.weak.push(self.heap.register_weak(obj));
    }

    /// Drops cleared weak handles and occasionally links a still-alive
    /// target back into the rooted graph.
    fn revive(&mut self) {
        let before = self.weak.len();
        let heap = &self.heap;
        self.weak.retain(|&handle| heap.resolve_weak(handle).is_some());
        self.stats.weak_cleared += (before - self.weak.len()) as u64;

        if self.weak.is_empty() || self.rng.next(4) != 0 {
            return;
        }
        let handle = self.weak[self.rng.next(self.weak.len() as u32) as usize];
        if let Some(target) = self.heap.resolve_weak(handle) {
            self.heap.push_call_site(self.sites.relink);
            let slot = self.rng.next(ROOT_SLOTS);
            self.heap.write_element(self.roots, slot, target);
            self.heap.pop_stack();
            self.stats.weak_revived += 1;
        }
    }

    pub fn live_weak(&self) -> usize {
        self.weak.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::NoRoots;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            initial_pages: 4,
            max_pages: 512,
            stack_size: 1024,
            sweep_budget: 500,
            critical_reserve_pages: 1,
        }
    }

    #[test]
    fn frames_keep_the_stack_balanced() {
        let mut world = World::new(create_test_settings(), 7).expect("world");
        for _ in 0..20 {
            world.frame(64).expect("frame");
            assert_eq!(world.heap.stack_depth(), (0, 0));
        }
        assert_eq!(world.stats.frames, 20);
        assert!(world.stats.objects >= 20 * 64);
    }

    #[test]
    fn rooted_structure_survives_collection() {
        let mut world = World::new(create_test_settings(), 11).expect("world");
        for _ in 0..50 {
            world.frame(64).expect("frame");
        }
        let before = world.heap.verify();
        let mut pinned = world.pinned.clone();
        world.heap.run_gc(&mut pinned).expect("gc");
        let after = world.heap.verify();
        assert!(after.objects() <= before.objects());
        assert_eq!(world.heap.read_static(world.layout.roots_slot), world.roots);
        assert_eq!(world.heap.array_length(world.roots), ROOT_SLOTS);

        // nothing references the world anymore except the static
        world.pinned.clear();
        world.heap.run_gc(&mut NoRoots).expect("gc");
        world.heap.verify();
    }
}
