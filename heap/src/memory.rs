//! The growable linear memory backing the heap.

use std::ops::Range;

use object::{Address, ObjectHeader, STAMP_OFFSET};

/// Growth unit of the linear memory.
pub const PAGE_SIZE: u32 = 65_536;
pub const PAGE_SHIFT: u32 = 16;
/// Pages needed to cover the whole 32-bit address space.
pub const MAX_PAGES: u32 = 1 << (32 - PAGE_SHIFT);

/// A contiguous, byte addressable, growable memory.
///
/// Growth only appends zeroed pages at the top; existing bytes keep their
/// addresses. Every access is bounds checked against the committed size, an
/// access outside of it is treated as heap corruption and panics.
#[derive(Debug)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    max_pages: u32,
}

impl LinearMemory {
    /// Commits `initial_pages`, returns `None` if the host refuses.
    pub fn new(initial_pages: u32, max_pages: u32) -> Option<Self> {
        let max_pages = max_pages.min(MAX_PAGES);
        if initial_pages > max_pages {
            return None;
        }
        let mut memory = Self {
            bytes: Vec::new(),
            max_pages,
        };
        memory.grow(initial_pages).then_some(memory)
    }

    #[inline(always)]
    pub fn pages(&self) -> u32 {
        (self.bytes.len() >> PAGE_SHIFT) as u32
    }

    #[inline(always)]
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Committed size in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Appends `pages` zeroed pages. Returns `false` if that would pass the
    /// maximum or the host cannot provide the memory.
    pub fn grow(&mut self, pages: u32) -> bool {
        let Some(total) = self.pages().checked_add(pages) else {
            return false;
        };
        if total > self.max_pages {
            return false;
        }
        let extra = (pages as usize) << PAGE_SHIFT;
        if self.bytes.try_reserve_exact(extra).is_err() {
            return false;
        }
        self.bytes.resize(self.bytes.len() + extra, 0);
        true
    }

    #[inline(always)]
    fn range(&self, addr: Address, len: usize) -> Range<usize> {
        let start = addr.index();
        let end = start + len;
        if end > self.bytes.len() {
            out_of_bounds(addr, len, self.bytes.len());
        }
        start..end
    }

    #[inline(always)]
    fn array<const N: usize>(&self, addr: Address) -> [u8; N] {
        let range = self.range(addr, N);
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[range]);
        out
    }

    #[inline(always)]
    pub fn read_u8(&self, addr: Address) -> u8 {
        let range = self.range(addr, 1);
        self.bytes[range.start]
    }

    #[inline(always)]
    pub fn write_u8(&mut self, addr: Address, value: u8) {
        let range = self.range(addr, 1);
        self.bytes[range.start] = value;
    }

    #[inline(always)]
    pub fn read_u16(&self, addr: Address) -> u16 {
        u16::from_le_bytes(self.array(addr))
    }

    #[inline(always)]
    pub fn write_u16(&mut self, addr: Address, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    #[inline(always)]
    pub fn read_u32(&self, addr: Address) -> u32 {
        u32::from_le_bytes(self.array(addr))
    }

    #[inline(always)]
    pub fn write_u32(&mut self, addr: Address, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    #[inline(always)]
    pub fn read_u64(&self, addr: Address) -> u64 {
        u64::from_le_bytes(self.array(addr))
    }

    #[inline(always)]
    pub fn write_u64(&mut self, addr: Address, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    #[inline(always)]
    pub fn read_address(&self, addr: Address) -> Address {
        Address::new(self.read_u32(addr))
    }

    #[inline(always)]
    pub fn write_address(&mut self, addr: Address, value: Address) {
        self.write_u32(addr, value.get());
    }

    #[inline(always)]
    pub fn read_header(&self, addr: Address) -> ObjectHeader {
        ObjectHeader::from_le_bytes(self.array(addr))
    }

    #[inline(always)]
    pub fn write_header(&mut self, addr: Address, header: ObjectHeader) {
        self.write_bytes(addr, &header.to_le_bytes());
    }

    #[inline(always)]
    pub fn stamp(&self, addr: Address) -> u8 {
        self.read_u8(addr + STAMP_OFFSET)
    }

    #[inline(always)]
    pub fn set_stamp(&mut self, addr: Address, stamp: u8) {
        self.write_u8(addr + STAMP_OFFSET, stamp);
    }

    pub fn read_bytes(&self, addr: Address, out: &mut [u8]) {
        let range = self.range(addr, out.len());
        out.copy_from_slice(&self.bytes[range]);
    }

    pub fn write_bytes(&mut self, addr: Address, data: &[u8]) {
        let range = self.range(addr, data.len());
        self.bytes[range].copy_from_slice(data);
    }

    pub fn fill(&mut self, addr: Address, len: u32, value: u8) {
        let range = self.range(addr, len as usize);
        self.bytes[range].fill(value);
    }
}

#[cold]
#[inline(never)]
fn out_of_bounds(addr: Address, len: usize, size: usize) -> ! {
    log::error!("memory access {}+{} outside committed size {}", addr, len, size);
    panic!("heap corruption: access at {} (+{}) outside committed memory ({} bytes)", addr, len, size);
}
