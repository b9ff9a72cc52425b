//! Typed resource handles and the generation-tagged registry behind them.
//!
//! A [`Handle<K>`] is an index into a [`Registry`] slot plus the generation
//! the slot had when the resource was inserted. Destroying a resource bumps
//! the slot generation, so stale handles stop resolving instead of aliasing
//! whatever reuses the slot. The kind parameter keeps handles of different
//! resource kinds apart at compile time.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{RenderError, RenderResult};

/// Marker for one resource namespace.
pub trait Kind: 'static {
    /// Used in `Debug` output and error messages.
    const NAME: &'static str;
}

macro_rules! kinds {
    ($($(#[$meta:meta])* $kind:ident => $name:literal, $alias:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $kind {}

            impl Kind for $kind {
                const NAME: &'static str = $name;
            }

            #[doc = concat!("Handle of a ", $name, ".")]
            pub type $alias = Handle<$kind>;
        )*
    };
}

kinds! {
    VertexBuffer => "vertex buffer", VertexBufferHandle;
    IndexBuffer => "index buffer", IndexBufferHandle;
    UniformBuffer => "uniform buffer", UniformBufferHandle;
    StorageBuffer => "storage buffer", StorageBufferHandle;
    Image => "image", ImageHandle;
    /// Sampled view of an [`Image`]
    Texture => "texture", TextureHandle;
    Shader => "shader", ShaderHandle;
    Program => "program", ProgramHandle;
    /// One shader-visible binding of a buffer or texture
    Descriptor => "descriptor", DescriptorHandle;
    Framebuffer => "framebuffer", FramebufferHandle;
}

/// Copyable reference to a resource in a [`Registry`].
///
/// Equality and hashing cover index and generation, so a handle to a
/// destroyed resource never equals the handle of its slot's next occupant.
pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    /// Slot index. Reused after the resource is destroyed.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K: Kind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", K::NAME, self.index, self.generation)
    }
}

impl<K: Kind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot map owning every live resource of one kind.
pub struct Registry<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Kind, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Kind, T> Registry<K, T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _kind: PhantomData,
        }
    }

    /// Stores `value`, reusing the most recently freed slot if any.
    pub fn insert(&mut self, value: T) -> Handle<K> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// The value behind `handle`, `None` if it was removed.
    pub fn find(&self, handle: Handle<K>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn find_mut(&mut self, handle: Handle<K>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Like [`find`](Self::find) but reports a stale handle as an error.
    pub fn get(&self, handle: Handle<K>) -> RenderResult<&T> {
        self.find(handle).ok_or_else(|| invalid(handle))
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> RenderResult<&mut T> {
        self.find_mut(handle).ok_or_else(|| invalid(handle))
    }

    #[inline]
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.find(handle).is_some()
    }

    /// Takes the value out and invalidates every copy of `handle`.
    ///
    /// # Errors
    ///
    /// [`RenderError::InvalidHandle`] if the handle is stale or was never
    /// issued by this registry.
    pub fn remove(&mut self, handle: Handle<K>) -> RenderResult<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| invalid(handle))?;
        let value = slot.value.take().ok_or_else(|| invalid(handle))?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every live entry.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }
}

fn invalid<K: Kind>(handle: Handle<K>) -> RenderError {
    RenderError::InvalidHandle {
        kind: K::NAME,
        handle: handle.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_find() {
        let mut registry: Registry<Texture, &str> = Registry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");

        assert_eq!(registry.find(a), Some(&"a"));
        assert_eq!(registry.find(b), Some(&"b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_removed_handle_stops_resolving() {
        let mut registry: Registry<Program, u32> = Registry::new();
        let handle = registry.insert(7);

        assert_eq!(registry.remove(handle).ok(), Some(7));
        assert!(registry.find(handle).is_none());
        assert!(matches!(
            registry.get(handle),
            Err(RenderError::InvalidHandle { kind: "program", .. })
        ));
        assert!(registry.remove(handle).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let mut registry: Registry<Image, u32> = Registry::new();
        let old = registry.insert(1);
        registry.remove(old).ok();
        let new = registry.insert(2);

        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(registry.find(old).is_none());
        assert_eq!(registry.find(new), Some(&2));
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut registry: Registry<Shader, u32> = Registry::new();
        let a = registry.insert(1);
        let b = registry.insert(2);
        let c = registry.insert(3);
        registry.remove(b).ok();

        let live: Vec<_> = registry.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(a, 1), (c, 3)]);
    }

    #[test]
    fn test_drain_invalidates_everything() {
        let mut registry: Registry<Descriptor, u32> = Registry::new();
        let a = registry.insert(1);
        let b = registry.insert(2);

        let mut drained = registry.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(registry.find(a).is_none());
        assert!(registry.find(b).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_handle_debug_names_kind() {
        let mut registry: Registry<VertexBuffer, ()> = Registry::new();
        let handle = registry.insert(());
        assert_eq!(format!("{:?}", handle), "vertex buffer#0v0");
    }
}
