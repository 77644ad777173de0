//! Weak handles keyed by target address.
//!
//! Several handles may point at the same object; they form a chain whose head
//! is stored in the registry under the target address. When the sweep finds a
//! registered target dead, the whole chain is unlinked and every handle in it
//! is cleared.

use std::collections::HashMap;

use object::Address;

/// Handle to a weak reference. Stale handles (released, or from a reused
/// slot) resolve to null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle {
    index: u32,
    version: u32,
}

#[derive(Debug)]
struct WeakSlot {
    target: Address,
    next: Option<u32>,
    version: u32,
    in_use: bool,
}

#[derive(Debug, Default)]
pub struct WeakRegistry {
    slots: Vec<WeakSlot>,
    free: Vec<u32>,
    chains: HashMap<Address, u32>,
}

impl WeakRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle to `target`. Only tracked handles join a chain and can
    /// be invalidated; untracked ones point outside the collected heap.
    pub fn register(&mut self, target: Address, tracked: bool) -> WeakHandle {
        let next = if tracked {
            self.chains.get(&target).copied()
        } else {
            None
        };

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.target = target;
                slot.next = next;
                slot.in_use = true;
                index
            }
            None => {
                self.slots.push(WeakSlot {
                    target,
                    next,
                    version: 0,
                    in_use: true,
                });
                (self.slots.len() - 1) as u32
            }
        };

        if tracked && !target.is_null() {
            self.chains.insert(target, index);
        }
        WeakHandle {
            index,
            version: self.slots[index as usize].version,
        }
    }

    fn slot(&self, handle: WeakHandle) -> Option<&WeakSlot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.in_use && slot.version == handle.version)
    }

    /// The target, or `None` once the handle was invalidated or released.
    pub fn resolve(&self, handle: WeakHandle) -> Option<Address> {
        self.slot(handle)
            .map(|slot| slot.target)
            .filter(|target| !target.is_null())
    }

    /// Drops `handle`, unlinking it from its chain. Returns `false` for a
    /// stale handle.
    pub fn release(&mut self, handle: WeakHandle) -> bool {
        let Some(slot) = self.slot(handle) else {
            return false;
        };
        let target = slot.target;
        let next = slot.next;

        if !target.is_null() {
            self.unlink(target, handle.index, next);
        }

        self.retire(handle.index);
        true
    }

    /// Returns a slot to the free list. Handles to it go stale.
    fn retire(&mut self, index: u32) -> Option<u32> {
        let slot = &mut self.slots[index as usize];
        slot.target = Address::NULL;
        slot.in_use = false;
        slot.version = slot.version.wrapping_add(1);
        self.free.push(index);
        slot.next.take()
    }

    fn unlink(&mut self, target: Address, index: u32, next: Option<u32>) {
        let Some(&head) = self.chains.get(&target) else {
            return;
        };
        if head == index {
            match next {
                Some(next) => {
                    self.chains.insert(target, next);
                }
                None => {
                    self.chains.remove(&target);
                }
            }
            return;
        }
        let mut cursor = head;
        while let Some(following) = self.slots[cursor as usize].next {
            if following == index {
                self.slots[cursor as usize].next = next;
                return;
            }
            cursor = following;
        }
    }

    /// Whether any handle chain is keyed by `target`.
    #[inline]
    pub fn is_registered(&self, target: Address) -> bool {
        self.chains.contains_key(&target)
    }

    /// Removes the chain of `target` and clears all of its handles. Their
    /// slots are recycled. Returns how many handles were invalidated.
    pub fn invalidate(&mut self, target: Address) -> usize {
        let mut cursor = self.chains.remove(&target);
        let mut count = 0;
        while let Some(index) = cursor {
            cursor = self.retire(index);
            count += 1;
        }
        count
    }

    /// Registered target addresses in ascending order.
    pub fn sorted_targets(&self) -> Vec<Address> {
        let mut targets: Vec<Address> = self.chains.keys().copied().collect();
        targets.sort_unstable();
        targets
    }

    /// Number of handles that still resolve.
    pub fn live_handles(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use && !slot.target.is_null())
            .count()
    }

    /// Slots ever allocated, in use or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_resolve_until_invalidated() {
        let mut registry = WeakRegistry::new();
        let target = Address::new(0x100);
        let a = registry.register(target, true);
        let b = registry.register(target, true);
        let other = registry.register(Address::new(0x200), true);

        assert_eq!(registry.resolve(a), Some(target));
        assert_eq!(registry.resolve(b), Some(target));
        assert_eq!(registry.sorted_targets(), vec![target, Address::new(0x200)]);

        assert_eq!(registry.invalidate(target), 2);
        assert_eq!(registry.resolve(a), None);
        assert_eq!(registry.resolve(b), None);
        assert_eq!(registry.resolve(other), Some(Address::new(0x200)));
        assert!(!registry.is_registered(target));

        // invalidation is final
        assert_eq!(registry.invalidate(target), 0);
        assert_eq!(registry.resolve(a), None);
    }

    #[test]
    fn untracked_handles_are_never_invalidated() {
        let mut registry = WeakRegistry::new();
        let foreign = Address::new(4);
        let handle = registry.register(foreign, false);
        assert!(!registry.is_registered(foreign));
        assert_eq!(registry.invalidate(foreign), 0);
        assert_eq!(registry.resolve(handle), Some(foreign));
    }

    #[test]
    fn release_unlinks_from_the_middle_of_a_chain() {
        let mut registry = WeakRegistry::new();
        let target = Address::new(0x80);
        let first = registry.register(target, true);
        let middle = registry.register(target, true);
        let head = registry.register(target, true);

        assert!(registry.release(middle));
        assert_eq!(registry.resolve(middle), None);
        assert!(!registry.release(middle));

        assert_eq!(registry.invalidate(target), 2);
        assert_eq!(registry.resolve(first), None);
        assert_eq!(registry.resolve(head), None);
    }

    #[test]
    fn release_of_the_last_handle_drops_the_chain() {
        let mut registry = WeakRegistry::new();
        let target = Address::new(0x80);
        let only = registry.register(target, true);
        assert!(registry.release(only));
        assert!(!registry.is_registered(target));
    }

    #[test]
    fn reused_slots_do_not_revive_stale_handles() {
        let mut registry = WeakRegistry::new();
        let old = registry.register(Address::new(0x40), true);
        registry.release(old);
        let new = registry.register(Address::new(0x48), true);

        assert_eq!(registry.resolve(old), None);
        assert_eq!(registry.resolve(new), Some(Address::new(0x48)));
        assert_eq!(registry.live_handles(), 1);
    }

    #[test]
    fn invalidated_slots_are_recycled() {
        let mut registry = WeakRegistry::new();
        for round in 0..1000u32 {
            let target = Address::new(0x1000 + round * 8);
            let a = registry.register(target, true);
            let b = registry.register(target, true);
            assert_eq!(registry.invalidate(target), 2);
            assert_eq!(registry.resolve(a), None);
            assert!(!registry.release(b));
        }
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.live_handles(), 0);

        // a stale handle stays dead when its slot is handed out again
        let target = Address::new(0x40);
        let stale = registry.register(target, true);
        registry.invalidate(target);
        let fresh = registry.register(target, true);
        assert_eq!(registry.resolve(stale), None);
        assert_eq!(registry.resolve(fresh), Some(target));
    }
}
