//! Heap walk for diagnostics.

use std::{collections::BTreeMap, fmt};

use object::{Address, ClassId};

use crate::{
    HeapInner,
    gaps::FILLER_STAMP,
    layout::{corrupt, object_size},
};

/// Objects of one class found by [`HeapInner::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassUsage {
    pub objects: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HeapReport {
    pub heap_start: Address,
    pub heap_end: Address,
    pub committed_pages: u32,
    /// Per class id, fillers excluded. Dead objects the last sweep has not
    /// reached yet are counted too.
    pub classes: BTreeMap<ClassId, (String, ClassUsage)>,
    pub fillers: ClassUsage,
    /// Bytes in the fillers the allocator tracks.
    pub tracked_gap_bytes: u64,
}

impl HeapReport {
    pub fn objects(&self) -> usize {
        self.classes.values().map(|(_, usage)| usage.objects).sum()
    }

    pub fn object_bytes(&self) -> u64 {
        self.classes.values().map(|(_, usage)| usage.bytes).sum()
    }

    pub fn usage(&self, class: ClassId) -> Option<&ClassUsage> {
        self.classes.get(&class).map(|(_, usage)| usage)
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap {}..{} ({} pages committed)",
            self.heap_start, self.heap_end, self.committed_pages
        )?;
        writeln!(f, "{:>6}  {:<24} {:>10} {:>12}", "id", "class", "objects", "bytes")?;
        for (class, (name, usage)) in &self.classes {
            writeln!(
                f,
                "{:>6}  {:<24} {:>10} {:>12}",
                class.to_string(),
                name,
                usage.objects,
                usage.bytes
            )?;
        }
        writeln!(
            f,
            "{:>6}  {:<24} {:>10} {:>12}",
            "",
            "(fillers)",
            self.fillers.objects,
            self.fillers.bytes
        )?;
        write!(
            f,
            "{} objects in {} bytes, {} bytes in tracked gaps",
            self.objects(),
            self.object_bytes(),
            self.tracked_gap_bytes
        )
    }
}

impl HeapInner {
    /// Walks the whole dynamic heap and checks its structure. Panics on
    /// corruption.
    pub fn verify(&self) -> HeapReport {
        let space = self.lock();
        let memory = &space.memory;
        let mut report = HeapReport {
            heap_start: self.layout.allocation_start,
            heap_end: space.next_ptr,
            committed_pages: memory.pages(),
            ..HeapReport::default()
        };

        let mut cursor = self.layout.allocation_start;
        while cursor < space.next_ptr {
            let (class, size) = object_size(memory, &self.classes, cursor);
            if class == ClassId::FILLER && memory.stamp(cursor) == FILLER_STAMP {
                report.fillers.objects += 1;
                report.fillers.bytes += size as u64;
            } else {
                let (_, usage) = report.classes.entry(class).or_insert_with(|| {
                    let name = self.classes.get(class).map(|info| info.name.clone());
                    (name.unwrap_or_default(), ClassUsage::default())
                });
                usage.objects += 1;
                usage.bytes += size as u64;
            }
            cursor = cursor + size;
        }
        if cursor != space.next_ptr {
            corrupt(cursor, "object walk overran the bump pointer");
        }

        for (gap, size) in space.gaps.sizes(memory) {
            let header = memory.read_header(gap);
            if gap >= space.next_ptr
                || header.class_id() != ClassId::FILLER
                || header.stamp() != FILLER_STAMP
            {
                corrupt(gap, "tracked gap is not a filler");
            }
            report.tracked_gap_bytes += size as u64;
        }

        for &offset in self.classes.static_reference_offsets() {
            let value = memory.read_address(self.layout.static_slot(offset));
            if self.layout.is_dynamic(value) && value >= space.next_ptr {
                corrupt(value, "static root outside the allocated heap");
            }
        }
        for value in space.stack.entries(memory) {
            let value = Address::new(value);
            if self.layout.is_dynamic(value) && value >= space.next_ptr {
                corrupt(value, "stack root outside the allocated heap");
            }
        }

        log::debug!(
            "verified {} objects, {} fillers",
            report.objects(),
            report.fillers.objects
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, HeapSettings};
    use object::{ArrayKind, ClassDef, ClassTableBuilder, FieldKind, ObjectHeader};

    fn create_test_heap() -> (Heap, ClassId) {
        let mut builder = ClassTableBuilder::new();
        let node = builder
            .define(
                ClassDef::new("Node")
                    .field("next", FieldKind::Reference)
                    .field("value", FieldKind::Int),
            )
            .expect("define Node");
        let settings = HeapSettings {
            initial_pages: 2,
            max_pages: 64,
            stack_size: 256,
            sweep_budget: 64,
            critical_reserve_pages: 1,
        };
        (Heap::new(settings, builder.build()), node)
    }

    #[test]
    fn counts_objects_per_class() {
        let (heap, node) = create_test_heap();
        let keep = heap.allocate_object(node).expect("alloc");
        for _ in 0..4 {
            heap.allocate_object(node).expect("alloc");
        }
        let array = heap.allocate_array(ArrayKind::Int, 10).expect("alloc");

        let report = heap.verify();
        assert_eq!(report.objects(), 6);
        assert_eq!(
            report.usage(node),
            Some(&ClassUsage {
                objects: 5,
                bytes: 80
            })
        );
        assert_eq!(report.usage(ClassId::INT_ARRAY).map(|u| u.bytes), Some(48));

        heap.run_gc(&mut vec![keep, array]).expect("gc");
        let report = heap.verify();
        assert_eq!(report.objects(), 2);
        assert_eq!(report.fillers, ClassUsage { objects: 1, bytes: 64 });
        assert_eq!(report.tracked_gap_bytes, 64);

        let text = report.to_string();
        assert!(text.contains("Node"));
        assert!(text.contains("(fillers)"));
    }

    #[test]
    fn byte_arrays_are_not_fillers() {
        let (heap, _) = create_test_heap();
        heap.allocate_array(ArrayKind::Byte, 3).expect("alloc");
        let report = heap.verify();
        assert_eq!(report.fillers.objects, 0);
        assert_eq!(report.usage(ClassId::BYTE_ARRAY).map(|u| u.objects), Some(1));
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn unknown_class_ids_are_corruption() {
        let (heap, node) = create_test_heap();
        let obj = heap.allocate_object(node).expect("alloc");
        heap.write_header(obj, ObjectHeader::new(ClassId::new(4000), heap.stamp()));
        heap.verify();
    }
}
