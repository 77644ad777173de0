use crate::ClassId;

/// Bytes of the header every heap object starts with.
pub const OBJECT_OVERHEAD: u32 = 4;
/// Offset of the 4-byte length field of arrays.
pub const ARRAY_LENGTH_OFFSET: u32 = OBJECT_OVERHEAD;
/// Header plus length field; array elements start here.
pub const ARRAY_OVERHEAD: u32 = OBJECT_OVERHEAD + 4;
/// Allocation granularity of the heap.
pub const ALIGNMENT: u32 = 8;
/// Size of a stored reference.
pub const REFERENCE_SIZE: u32 = 4;
/// Byte offset of the mark stamp inside the header.
pub const STAMP_OFFSET: u32 = 3;

/// Rounds `size` up to the allocation granularity.
#[inline(always)]
pub const fn align_up(size: u64) -> u64 {
    let mask = ALIGNMENT as u64 - 1;
    (size + mask) & !mask
}

/// The 4-byte header at the start of every heap object.
///
/// ```text
/// bits  0..24: class id
/// bits 24..32: mark stamp, the cycle in which the object was last reached
/// ```
///
/// The header is stored little endian, so the stamp is the single byte at
/// [`STAMP_OFFSET`] and can be read or written without touching the class id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectHeader(u32);

const _: () = assert!(size_of::<ObjectHeader>() == OBJECT_OVERHEAD as usize);

impl ObjectHeader {
    const CLASS_BITS: u32 = 24;
    const CLASS_MASK: u32 = (1 << Self::CLASS_BITS) - 1;

    /// Largest class id the header can encode.
    pub const MAX_CLASS_ID: u32 = Self::CLASS_MASK;

    #[inline(always)]
    pub const fn new(class: ClassId, stamp: u8) -> Self {
        debug_assert!(class.get() <= Self::CLASS_MASK);
        Self((class.get() & Self::CLASS_MASK) | ((stamp as u32) << Self::CLASS_BITS))
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn class_id(self) -> ClassId {
        ClassId::new(self.0 & Self::CLASS_MASK)
    }

    #[inline(always)]
    pub const fn stamp(self) -> u8 {
        (self.0 >> Self::CLASS_BITS) as u8
    }

    #[inline(always)]
    pub const fn with_stamp(self, stamp: u8) -> Self {
        Self((self.0 & Self::CLASS_MASK) | ((stamp as u32) << Self::CLASS_BITS))
    }

    #[inline(always)]
    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline(always)]
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl core::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("class", &self.class_id())
            .field("stamp", &self.stamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_class_and_stamp() {
        let header = ObjectHeader::new(ClassId::new(0x12_3456), 0xab);
        assert_eq!(header.class_id(), ClassId::new(0x12_3456));
        assert_eq!(header.stamp(), 0xab);
        assert_eq!(header.raw(), 0xab12_3456);
    }

    #[test]
    fn stamp_is_the_high_byte_in_memory() {
        let header = ObjectHeader::new(ClassId::BYTE_ARRAY, 7);
        let bytes = header.to_le_bytes();
        assert_eq!(bytes[STAMP_OFFSET as usize], 7);
        assert_eq!(ObjectHeader::from_le_bytes(bytes), header);
    }

    #[test]
    fn restamping_keeps_class() {
        let header = ObjectHeader::new(ClassId::OBJECT_ARRAY, 1);
        let restamped = header.with_stamp(200);
        assert_eq!(restamped.class_id(), ClassId::OBJECT_ARRAY);
        assert_eq!(restamped.stamp(), 200);
    }

    #[test]
    fn align_up_rounds_to_granularity() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(108), 112);
        assert_eq!(align_up(u32::MAX as u64), u32::MAX as u64 + 1);
    }
}
