//! Mark phase.
//!
//! Stamps every object reachable from the static slots, the shadow stack and
//! the host roots with the current stamp. Traversal uses an explicit worklist,
//! so graph depth never turns into native stack depth.

use object::{ARRAY_LENGTH_OFFSET, ARRAY_OVERHEAD, Address, ClassId, ClassTable, REFERENCE_SIZE};

use crate::{LinearMemory, MemoryLayout, heap::Space, layout::corrupt};

struct Marker<'a> {
    memory: &'a mut LinearMemory,
    classes: &'a ClassTable,
    layout: &'a MemoryLayout,
    limit: Address,
    stamp: u8,
    worklist: Vec<Address>,
    marked: usize,
}

impl Marker<'_> {
    #[inline]
    fn visit(&mut self, addr: Address) {
        // null, statics and call-site markers
        if !self.layout.is_dynamic(addr) {
            return;
        }
        if addr >= self.limit || !addr.is_aligned() {
            corrupt(addr, "reference outside the allocated heap");
        }
        if self.memory.stamp(addr) == self.stamp {
            return; // already marked
        }
        self.memory.set_stamp(addr, self.stamp);
        self.marked += 1;
        self.worklist.push(addr);
    }

    fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            let class = self.memory.read_header(obj).class_id();
            if class == ClassId::OBJECT_ARRAY {
                let length = self.memory.read_u32(obj + ARRAY_LENGTH_OFFSET);
                for index in 0..length {
                    let slot = obj + ARRAY_OVERHEAD + index * REFERENCE_SIZE;
                    let value = self.memory.read_address(slot);
                    self.visit(value);
                }
            } else {
                if !self.classes.contains(class) {
                    corrupt(obj, "class id out of range");
                }
                for &offset in self.classes.reference_offsets(class) {
                    let value = self.memory.read_address(obj + offset);
                    self.visit(value);
                }
            }
        }
    }
}

impl Space {
    /// Marks from all roots with the current stamp. `host_roots` were
    /// gathered from the host before the lock was taken. Returns how many
    /// objects were stamped.
    pub(crate) fn mark(
        &mut self,
        classes: &ClassTable,
        layout: &MemoryLayout,
        host_roots: &[Address],
    ) -> usize {
        let stack: Vec<u32> = self.stack.entries(&self.memory).collect();

        let mut marker = Marker {
            memory: &mut self.memory,
            classes,
            layout,
            limit: self.next_ptr,
            stamp: self.stamp,
            worklist: Vec::new(),
            marked: 0,
        };

        for &offset in classes.static_reference_offsets() {
            let value = marker.memory.read_address(layout.static_slot(offset));
            marker.visit(value);
            marker.drain();
        }
        log::trace!("marked {} objects from statics", marker.marked);

        for value in stack {
            marker.visit(Address::new(value));
        }
        marker.drain();

        for &root in host_roots {
            marker.visit(root);
        }
        marker.drain();

        marker.marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, HeapSettings};
    use object::{ArrayKind, ClassDef, ClassTableBuilder, FieldKind};

    struct TestClasses {
        node: ClassId,
        left: u32,
        right: u32,
        root_slot: u32,
    }

    fn create_test_env() -> (Heap, TestClasses) {
        let mut builder = ClassTableBuilder::new();
        let node = builder
            .define(
                ClassDef::new("Node")
                    .field("left", FieldKind::Reference)
                    .field("payload", FieldKind::Long)
                    .field("right", FieldKind::Reference)
                    .field("raw", FieldKind::RawPointer)
                    .static_field("root", FieldKind::Reference),
            )
            .expect("define Node");
        let classes = builder.build();
        let test = TestClasses {
            node,
            left: classes.field_offset(node, "left").expect("left"),
            right: classes.field_offset(node, "right").expect("right"),
            root_slot: classes.static_field_offset(node, "root").expect("root"),
        };
        let settings = HeapSettings {
            initial_pages: 4,
            max_pages: 64,
            stack_size: 256,
            sweep_budget: 64,
            critical_reserve_pages: 1,
        };
        (Heap::new(settings, classes), test)
    }

    fn run_mark(heap: &Heap, host_roots: &[Address]) -> usize {
        let space = &mut *heap.lock();
        space.advance_generation();
        space.mark(&heap.classes, &heap.layout, host_roots)
    }

    fn is_marked(heap: &Heap, addr: Address) -> bool {
        heap.read_header(addr).stamp() == heap.stamp()
    }

    #[test]
    fn marks_the_closure_of_host_roots() {
        let (heap, t) = create_test_env();
        let a = heap.allocate_object(t.node).expect("alloc");
        let b = heap.allocate_object(t.node).expect("alloc");
        let c = heap.allocate_object(t.node).expect("alloc");
        let lone = heap.allocate_object(t.node).expect("alloc");
        heap.write_field(a, t.left, b);
        heap.write_field(b, t.right, c);
        // cycle back to the root
        heap.write_field(c, t.left, a);

        assert_eq!(run_mark(&heap, &[a]), 3);
        assert!(is_marked(&heap, a));
        assert!(is_marked(&heap, b));
        assert!(is_marked(&heap, c));
        assert!(!is_marked(&heap, lone));
    }

    #[test]
    fn statics_and_stack_are_roots() {
        let (heap, t) = create_test_env();
        let from_static = heap.allocate_object(t.node).expect("alloc");
        let from_stack = heap.allocate_object(t.node).expect("alloc");
        let dead = heap.allocate_object(t.node).expect("alloc");
        heap.write_static(t.root_slot, from_static);
        heap.push_ref(from_stack);

        assert_eq!(run_mark(&heap, &[]), 2);
        assert!(is_marked(&heap, from_static));
        assert!(is_marked(&heap, from_stack));
        assert!(!is_marked(&heap, dead));
    }

    #[test]
    fn object_arrays_are_traced_element_wise() {
        let (heap, t) = create_test_env();
        let array = heap.allocate_array(ArrayKind::Object, 3).expect("alloc");
        let first = heap.allocate_object(t.node).expect("alloc");
        let last = heap.allocate_object(t.node).expect("alloc");
        let ints = heap.allocate_array(ArrayKind::Int, 2).expect("alloc");
        heap.write_element(array, 0, first);
        heap.write_element(array, 2, last);
        // an int array holding a heap address is not traced
        heap.write_u32(heap.element_address(ints, ArrayKind::Int, 0), first.get());

        assert_eq!(run_mark(&heap, &[array]), 3);
        assert!(is_marked(&heap, last));
        assert!(!is_marked(&heap, ints));
    }

    #[test]
    fn raw_pointer_fields_are_not_traced() {
        let (heap, t) = create_test_env();
        let a = heap.allocate_object(t.node).expect("alloc");
        let b = heap.allocate_object(t.node).expect("alloc");
        let raw = heap.classes.field_offset(t.node, "raw").expect("raw");
        heap.write_u32(a + raw, b.get());

        assert_eq!(run_mark(&heap, &[a]), 1);
        assert!(!is_marked(&heap, b));
    }

    #[test]
    fn values_below_the_heap_are_ignored() {
        let (heap, _) = create_test_env();
        let below = Address::new(heap.layout.allocation_start.get() - 8);
        assert_eq!(run_mark(&heap, &[Address::NULL, Address::new(4), below]), 0);
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn references_past_the_bump_pointer_are_corruption() {
        let (heap, t) = create_test_env();
        let a = heap.allocate_object(t.node).expect("alloc");
        heap.write_field(a, t.left, heap.next_ptr() + 64);
        run_mark(&heap, &[a]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let (heap, t) = create_test_env();
        let head = heap.allocate_object(t.node).expect("alloc");
        let mut tail = head;
        for _ in 0..50_000 {
            let next = heap.allocate_object(t.node).expect("alloc");
            heap.write_field(tail, t.right, next);
            tail = next;
        }
        assert_eq!(run_mark(&heap, &[head]), 50_001);
    }

    #[test]
    fn random_graphs_mark_exactly_the_reachable_set() {
        let (heap, t) = create_test_env();
        let mut seed = 0x1234_5678_9abc_def0u64;
        let mut next_rand = |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((seed >> 33) as usize) % bound
        };

        let count = 400;
        let nodes: Vec<Address> = (0..count)
            .map(|_| heap.allocate_object(t.node).expect("alloc"))
            .collect();
        let mut edges = vec![Vec::new(); count];
        for (i, &node) in nodes.iter().enumerate() {
            for offset in [t.left, t.right] {
                if next_rand(3) != 0 {
                    let j = next_rand(count);
                    heap.write_field(node, offset, nodes[j]);
                    edges[i].push(j);
                }
            }
        }
        let roots: Vec<usize> = (0..5).map(|_| next_rand(count)).collect();

        let mut reachable = vec![false; count];
        let mut pending = roots.clone();
        while let Some(i) = pending.pop() {
            if !std::mem::replace(&mut reachable[i], true) {
                pending.extend(&edges[i]);
            }
        }

        let host: Vec<Address> = roots.iter().map(|&i| nodes[i]).collect();
        let marked = run_mark(&heap, &host);
        assert_eq!(marked, reachable.iter().filter(|&&r| r).count());
        for (i, &node) in nodes.iter().enumerate() {
            assert_eq!(is_marked(&heap, node), reachable[i], "node {}", i);
        }
    }
}
