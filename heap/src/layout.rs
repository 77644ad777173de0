//! Regions of the linear memory and object sizing.
//!
//! ```text
//! 0          8             static_end   stack_limit      stack_start
//! | null guard | static area |  (pad)     | shadow stack <-- |  dynamic heap -->
//!                                                           allocation_start
//! ```

use object::{
    ARRAY_LENGTH_OFFSET, ARRAY_OVERHEAD, Address, ArrayKind, ClassId, ClassKind, ClassTable,
    align_up,
};

use crate::LinearMemory;

/// Bytes at address zero that never hold data, so that null is never a
/// valid slot.
pub const NULL_GUARD: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub static_start: Address,
    pub static_end: Address,
    /// Lowest address the shadow stack may grow to.
    pub stack_limit: Address,
    /// Empty-stack pointer; the stack grows downward from here.
    pub stack_start: Address,
    /// First byte of the dynamic heap.
    pub allocation_start: Address,
}

impl MemoryLayout {
    /// Places the static area and the shadow stack below the heap. `None` if
    /// they do not fit the address width.
    pub fn new(static_size: u32, stack_size: u32) -> Option<Self> {
        let static_start = Address::new(NULL_GUARD);
        let static_end = static_start.checked_add(static_size)?;
        let stack_limit = Address::new(u32::try_from(align_up(static_end.get() as u64)).ok()?);
        let stack_size = u32::try_from(align_up(stack_size as u64)).ok()?;
        let stack_start = stack_limit.checked_add(stack_size)?;
        Some(Self {
            static_start,
            static_end,
            stack_limit,
            stack_start,
            allocation_start: stack_start,
        })
    }

    /// Whether `addr` may point into the dynamic heap. Null, statics and
    /// call-site markers are below the heap.
    #[inline(always)]
    pub fn is_dynamic(&self, addr: Address) -> bool {
        addr >= self.allocation_start
    }

    #[inline(always)]
    pub fn static_slot(&self, offset: u32) -> Address {
        self.static_start + offset
    }
}

/// Total, aligned byte size of an array. `None` if it exceeds the address
/// width.
#[inline]
pub fn array_size(kind: ArrayKind, length: u32) -> Option<u32> {
    let bytes = ARRAY_OVERHEAD as u64 + ((length as u64) << kind.element_shift());
    u32::try_from(align_up(bytes)).ok()
}

/// Class and total, aligned size of the object at `addr`.
///
/// Panics on a header that cannot belong to an allocated object.
pub fn object_size(memory: &LinearMemory, classes: &ClassTable, addr: Address) -> (ClassId, u32) {
    let class = memory.read_header(addr).class_id();
    let Some(info) = classes.get(class) else {
        corrupt(addr, "class id out of range");
    };
    let size = match info.kind {
        ClassKind::Array(kind) => {
            let length = memory.read_u32(addr + ARRAY_LENGTH_OFFSET);
            match array_size(kind, length) {
                Some(size) => size,
                None => corrupt(addr, "array length overflows the address width"),
            }
        }
        ClassKind::Instance => align_up(info.instance_size().unwrap_or_default() as u64) as u32,
        ClassKind::Abstract => corrupt(addr, "instance of an abstract class"),
    };
    (class, size)
}

/// Aborts on a broken heap invariant. Continuing would read arbitrary bytes
/// as headers.
#[cold]
#[inline(never)]
pub fn corrupt(addr: Address, what: &str) -> ! {
    log::error!("heap corruption at {}: {}", addr, what);
    panic!("heap corruption at {}: {}", addr, what);
}
