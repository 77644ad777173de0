//! Allocation: gap reuse first, then bump allocation with growth.

use object::{ARRAY_LENGTH_OFFSET, Address, ArrayKind, ClassId, ObjectHeader, align_up};

use crate::{
    HeapError, HeapInner, HeapResult,
    heap::Space,
    layout,
    memory::PAGE_SHIFT,
};

impl Space {
    /// Places a zeroed object of `size` aligned bytes and stamps its header
    /// with the current cycle, so a sweep in flight treats it as reached.
    pub(crate) fn allocate(&mut self, class: ClassId, size: u32) -> HeapResult<Address> {
        debug_assert!(size > 0 && align_up(size as u64) == size as u64);
        let addr = match self.take_gap(size) {
            Some(addr) => addr,
            None => self.bump(size)?,
        };
        self.memory.fill(addr, size, 0);
        self.memory
            .write_header(addr, ObjectHeader::new(class, self.stamp));
        Ok(addr)
    }

    fn take_gap(&mut self, size: u32) -> Option<Address> {
        if !self.gaps.has_gaps() {
            return None;
        }
        let addr = self.gaps.take_fit(&mut self.memory, size)?;
        self.free_memory = self.free_memory.saturating_sub(size as u64);
        log::trace!("reused {} bytes at {}", size, addr);
        Some(addr)
    }

    fn bump(&mut self, size: u32) -> HeapResult<Address> {
        let ptr = self.next_ptr;
        let Some(end) = ptr.checked_add(size) else {
            log::warn!("allocation of {} bytes at {} overflows the address space", size, ptr);
            return Err(HeapError::AddressOverflow { ptr, size });
        };

        let reserve = if self.critical {
            0
        } else {
            (self.reserve_pages as u64) << PAGE_SHIFT
        };
        let usable = self.memory.size().saturating_sub(reserve);
        if end.get() as u64 > usable {
            self.grow_for(end, usable)?;
        }

        self.next_ptr = end;
        Ok(ptr)
    }

    /// Grows by half the usable size, at least enough to cover `end`, never
    /// beyond the maximum.
    fn grow_for(&mut self, end: Address, usable: u64) -> HeapResult<()> {
        let usable_pages = (usable >> PAGE_SHIFT) as u32;
        let remaining_pages = self.memory.max_pages() - self.memory.pages();
        let needed = (end.get() >> PAGE_SHIFT) + 1 - usable_pages;

        if needed > remaining_pages {
            log::warn!(
                "cannot grow by {} pages, only {} left",
                needed,
                remaining_pages
            );
            return Err(HeapError::MemoryLimit {
                requested_pages: needed,
                remaining_pages,
            });
        }

        let pages = (usable_pages >> 1).min(remaining_pages).max(needed);
        if !self.memory.grow(pages) {
            log::warn!("growing by {} pages failed", pages);
            return Err(HeapError::GrowthRefused { pages });
        }
        log::debug!(
            "grew by {} pages to {} ({} needed)",
            pages,
            self.memory.pages(),
            needed
        );
        Ok(())
    }
}

impl HeapInner {
    /// Allocates a zeroed instance of `class`.
    pub fn allocate_object(&self, class: ClassId) -> HeapResult<Address> {
        let info = self
            .classes
            .get(class)
            .ok_or(HeapError::UnknownClass { class })?;
        let size = info
            .instance_size()
            .ok_or(HeapError::NotInstantiable { class })?;
        let size = align_up(size as u64) as u32;
        self.lock().allocate(class, size)
    }

    /// Allocates a zeroed array of `length` elements.
    pub fn allocate_array(&self, kind: ArrayKind, length: i32) -> HeapResult<Address> {
        let class = kind.class_id();
        let length = u32::try_from(length).map_err(|_| HeapError::NegativeLength { length })?;
        let size =
            layout::array_size(kind, length).ok_or(HeapError::SizeOverflow { class, length })?;

        // length is written before the lock is released, a concurrent scan
        // must never see a half-initialized array
        let mut space = self.lock();
        let addr = space.allocate(class, size)?;
        space.memory.write_u32(addr + ARRAY_LENGTH_OFFSET, length);
        Ok(addr)
    }

    /// Like [`allocate_array`](Self::allocate_array), with the array class
    /// given by id.
    pub fn allocate_array_of(&self, class: ClassId, length: i32) -> HeapResult<Address> {
        if !self.classes.contains(class) {
            return Err(HeapError::UnknownClass { class });
        }
        let kind = ArrayKind::from_class_id(class).ok_or(HeapError::NotAnArray { class })?;
        self.allocate_array(kind, length)
    }
}
