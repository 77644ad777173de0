//! Errors surfaced by allocation and by the collection cycle API.

use object::{Address, ClassId};
use thiserror::Error;

pub type HeapResult<T> = Result<T, HeapError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The hard maximum of the address space would be exceeded.
    #[error("out of memory: need {requested_pages} more pages, only {remaining_pages} left")]
    MemoryLimit {
        requested_pages: u32,
        remaining_pages: u32,
    },

    /// The host refused to commit more memory.
    #[error("out of memory: growing by {pages} pages failed")]
    GrowthRefused { pages: u32 },

    /// `ptr + size` does not fit the address width.
    #[error("allocation of {size} bytes at {ptr} overflows the address space")]
    AddressOverflow { ptr: Address, size: u32 },

    /// The byte size of an array does not fit the address width.
    #[error("array {class} of length {length} is too large for the address space")]
    SizeOverflow { class: ClassId, length: u32 },

    #[error("illegal array length {length}")]
    NegativeLength { length: i32 },

    #[error("class {class} is not an array class")]
    NotAnArray { class: ClassId },

    #[error("class {class} cannot be instantiated")]
    NotInstantiable { class: ClassId },

    #[error("class {class} is not defined")]
    UnknownClass { class: ClassId },

    #[error("a collection cycle is already in progress")]
    CollectionInProgress,

    #[error("no collection cycle is in progress")]
    NoCollectionInProgress,
}

impl HeapError {
    /// Resource exhaustion the caller may recover from.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            HeapError::MemoryLimit { .. } | HeapError::GrowthRefused { .. }
        )
    }

    /// An unreasonable request rather than exhaustion.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::AddressOverflow { .. } | HeapError::SizeOverflow { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_taxonomy() {
        let oom = HeapError::GrowthRefused { pages: 4 };
        assert!(oom.is_out_of_memory());
        assert!(!oom.is_fatal());

        let overflow = HeapError::AddressOverflow {
            ptr: Address::new(u32::MAX - 8),
            size: 64,
        };
        assert!(overflow.is_fatal());
        assert!(!overflow.is_out_of_memory());

        let misuse = HeapError::CollectionInProgress;
        assert!(!misuse.is_fatal() && !misuse.is_out_of_memory());
    }

    #[test]
    fn messages_name_the_request() {
        let err = HeapError::SizeOverflow {
            class: ClassId::LONG_ARRAY,
            length: 1 << 30,
        };
        assert_eq!(
            err.to_string(),
            "array #8 of length 1073741824 is too large for the address space"
        );
    }
}
