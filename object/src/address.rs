use std::{
    fmt,
    ops::{Add, Sub},
};

use crate::ALIGNMENT;

/// A byte offset into the linear memory.
///
/// Addresses are 32 bits wide; `0` is the null reference. An address is only
/// meaningful together with the memory it indexes, it is never a machine
/// pointer.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(u32);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_aligned(self) -> bool {
        self.0 % ALIGNMENT == 0
    }

    /// `self + bytes`, or `None` if the result leaves the 32-bit address space.
    #[inline(always)]
    pub const fn checked_add(self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl Add<u32> for Address {
    type Output = Address;

    #[inline(always)]
    fn add(self, bytes: u32) -> Address {
        Address(self.0 + bytes)
    }
}

/// Distance in bytes between two addresses, `self` must not be below `rhs`.
impl Sub for Address {
    type Output = u32;

    #[inline(always)]
    fn sub(self, rhs: Address) -> u32 {
        debug_assert!(self >= rhs, "address difference underflow");
        self.0 - rhs.0
    }
}

impl From<u32> for Address {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#010x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
