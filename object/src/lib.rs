//! Object model of the linear heap.
//!
//! Everything here is pure layout: how an address is represented, how the
//! object header packs a class id with a mark stamp, and what each class
//! looks like in memory (instance size or array element shift, the offsets
//! of its reference fields, and its static reference slots).

mod address;
mod class;
mod header;

pub use address::Address;
pub use class::{
    ArrayKind, ClassDef, ClassId, ClassInfo, ClassKind, ClassTable,
    ClassTableBuilder, FieldKind, FieldSlot, LayoutError,
};
pub use header::{
    ALIGNMENT, ARRAY_LENGTH_OFFSET, ARRAY_OVERHEAD, OBJECT_OVERHEAD,
    ObjectHeader, REFERENCE_SIZE, STAMP_OFFSET, align_up,
};
