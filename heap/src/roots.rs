//! Root sources of the mark phase besides the static slots: the host's own
//! references and the tracked shadow stack.

use std::fmt;

use object::{Address, REFERENCE_SIZE};

use crate::{LinearMemory, MemoryLayout};

/// Consumers implement this to report references held outside the managed
/// heap (the host environment's handles).
///
/// Called once per cycle, before the heap is locked for marking, so the
/// provider must not allocate. It may report null and non-heap values, those
/// are ignored.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Address));
}

/// A host that holds no references.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(Address)) {}
}

impl RootProvider for Vec<Address> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Address)) {
        for &root in self.iter() {
            visitor(root);
        }
    }
}

impl RootProvider for [Address] {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Address)) {
        for &root in self.iter() {
            visitor(root);
        }
    }
}

/// Diagnostic information of one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub class: String,
    pub method: String,
    pub line: u32,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.method, self.line)
    }
}

/// Maps call-site markers on the shadow stack to source positions.
#[derive(Debug, Clone, Default)]
pub struct CallSiteTable {
    sites: Vec<CallSite>,
}

impl CallSiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call site and returns the marker to push for it.
    pub fn add(&mut self, class: impl Into<String>, method: impl Into<String>, line: u32) -> u32 {
        self.sites.push(CallSite {
            class: class.into(),
            method: method.into(),
            line,
        });
        (self.sites.len() - 1) as u32
    }

    pub fn get(&self, marker: u32) -> Option<&CallSite> {
        self.sites.get(marker as usize)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// The tracked stack, stored in linear memory between `stack_limit` and
/// `stack_start` and growing downward.
///
/// Entries are 4-byte values: either references into the heap or call-site
/// markers, which lie below `allocation_start`. Pushes past the limit are
/// counted but not stored; those frames are invisible to the collector.
#[derive(Debug)]
pub struct ShadowStack {
    limit: Address,
    base: Address,
    sp: Address,
    untracked: u32,
    overflow_reported: bool,
}

impl ShadowStack {
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            limit: layout.stack_limit,
            base: layout.stack_start,
            sp: layout.stack_start,
            untracked: 0,
            overflow_reported: false,
        }
    }

    /// Stored entries.
    #[inline]
    pub fn depth(&self) -> u32 {
        (self.base - self.sp) / REFERENCE_SIZE
    }

    /// Pushes that did not fit.
    #[inline]
    pub fn untracked(&self) -> u32 {
        self.untracked
    }

    pub fn push(&mut self, memory: &mut LinearMemory, value: u32) {
        if self.untracked > 0 || self.sp - self.limit < REFERENCE_SIZE {
            if !self.overflow_reported {
                self.overflow_reported = true;
                log::warn!(
                    "shadow stack overflow at depth {}, deeper frames are not tracked",
                    self.depth()
                );
            }
            self.untracked += 1;
            return;
        }
        self.sp = Address::new(self.sp.get() - REFERENCE_SIZE);
        memory.write_u32(self.sp, value);
    }

    /// Removes the top entry. Returns `false` on an empty stack.
    pub fn pop(&mut self) -> bool {
        if self.untracked > 0 {
            self.untracked -= 1;
            return true;
        }
        if self.sp == self.base {
            return false;
        }
        self.sp = self.sp + REFERENCE_SIZE;
        true
    }

    /// Stored entries from the top of the stack down to its base.
    pub fn entries<'a>(&self, memory: &'a LinearMemory) -> impl Iterator<Item = u32> + 'a {
        let (sp, base) = (self.sp.get(), self.base.get());
        (sp..base)
            .step_by(REFERENCE_SIZE as usize)
            .map(move |slot| memory.read_u32(Address::new(slot)))
    }
}
