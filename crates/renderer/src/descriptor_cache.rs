//! Deduplication of descriptor sets.
//!
//! A set is identified by the program it is laid out for, the slot it is
//! bound to and the ordered descriptor handles written into it. The full
//! key is stored and compared on lookup, so two different handle sequences
//! never share a set even when their hashes collide.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;

use crate::error::{RenderError, RenderResult};
use crate::handle::{DescriptorHandle, ProgramHandle};

/// Identity of a cached descriptor set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetKey {
    pub program: ProgramHandle,
    /// User slot; the set is bound at index `slot + 1`
    pub slot: usize,
    /// Written in this order, binding numbers taken from each descriptor
    pub descriptors: Vec<DescriptorHandle>,
}

/// Descriptor sets keyed by [`DescriptorSetKey`], bounded by a capacity.
///
/// The hasher is a parameter so tests can force collisions.
pub struct DescriptorCache<D, S = RandomState> {
    entries: HashMap<DescriptorSetKey, D, S>,
    capacity: usize,
}

impl<D: Copy> DescriptorCache<D> {
    /// Creates a cache holding at most `capacity` sets.
    pub fn new(capacity: usize) -> Self {
        Self::with_hasher(capacity, RandomState::new())
    }
}

impl<D: Copy, S: BuildHasher> DescriptorCache<D, S> {
    /// [`new`](DescriptorCache::new) with a custom hasher.
    pub fn with_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            entries: HashMap::with_hasher(hasher),
            capacity,
        }
    }

    pub fn get(&self, key: &DescriptorSetKey) -> Option<D> {
        self.entries.get(key).copied()
    }

    /// Returns the cached set for `key`, or allocates one with `create`.
    /// The flag is true on a cache hit.
    ///
    /// # Errors
    ///
    /// [`RenderError::CapacityExceeded`] when the cache is full, or whatever
    /// `create` returns.
    pub fn get_or_try_insert_with(
        &mut self,
        key: DescriptorSetKey,
        create: impl FnOnce() -> RenderResult<D>,
    ) -> RenderResult<(D, bool)> {
        if let Some(&set) = self.entries.get(&key) {
            return Ok((set, true));
        }
        if self.entries.len() >= self.capacity {
            return Err(RenderError::capacity("descriptor sets", self.capacity));
        }
        let set = create()?;
        self.entries.insert(key, set);
        Ok((set, false))
    }

    /// Removes every entry matching `predicate` and returns their sets.
    pub fn evict_where(&mut self, mut predicate: impl FnMut(&DescriptorSetKey) -> bool) -> Vec<D> {
        let mut evicted = Vec::new();
        self.entries.retain(|key, set| {
            if predicate(key) {
                evicted.push(*set);
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Removes the sets laid out for `program`.
    pub fn evict_program(&mut self, program: ProgramHandle) -> Vec<D> {
        self.evict_where(|key| key.program == program)
    }

    /// Removes every set that has any of `descriptors` written into it.
    pub fn evict_descriptors(&mut self, descriptors: &[DescriptorHandle]) -> Vec<D> {
        if descriptors.is_empty() {
            return Vec::new();
        }
        self.evict_where(|key| key.descriptors.iter().any(|d| descriptors.contains(d)))
    }

    /// Empties the cache, returning every set for release.
    pub fn drain(&mut self) -> Vec<D> {
        self.entries.drain().map(|(_, set)| set).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
