// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The resource header and object tagging.
//!
//! Every kernel-visible object — file, dir, mutex, sem, queue, flag,
//! socket, shm region, process — carries a header used for validation and
//! per-process linking. The original kernel spells that header as
//! `{self-pointer, next-in-list, type-tag}`: the self-pointer equals the
//! object's own address and is checked on every use to catch pointer
//! forgery, and `next-in-list` threads every resource a process owns into a
//! singly-linked list rooted in the process, walked to free everything on
//! exit.
//!
//! Neither field survives translation as-is. A self-pointer is a forgery
//! check for a language with no other way to prove a `void*` actually
//! points at a `struct file`; in safe Rust the type system already proves
//! that. What the self-pointer buys beyond typing — catching a stale handle
//! reused after its slot was freed and refilled — is preserved here as a
//! generation counter attached to an arena-style index, which is
//! [`ResourceId`]. The intrusive list becomes a fixed-capacity
//! [`ResourceList`] of `ResourceId`s owned by the process, since every
//! object's backing storage already lives in a slab sized by `config`.

use heapless::Vec;

pub use dnx_abi::ResourceTag;

/// An opaque, forgery-resistant reference to a kernel object living in some
/// [`Slab`]. `index` names the slot; `generation` must match the slot's
/// current generation for the handle to be considered live, which is what
/// catches a handle from a freed-and-reused slot — the arena equivalent of
/// the original self-pointer check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResourceId {
    pub tag: ResourceTag,
    pub index: u16,
    pub generation: u16,
}

/// The fixed-capacity list of resources a process owns, threaded in the
/// original kernel as an intrusive singly-linked list rooted in the
/// process. Order is insertion order, which is all `process_exit` needs:
/// it walks the whole list and releases each entry by its tag.
pub type ResourceList<const N: usize> = Vec<ResourceId, N>;

/// Error returned when a [`ResourceList`] is at capacity and cannot record
/// another owned resource. The caller should free whatever resource it was
/// about to register ownership of.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListFull;

/// Removes the first occurrence of `id` from `list`, returning whether one
/// was found. Used by every subsystem's "close"/"free"/"detach" path to
/// unlink a resource from its owning process before the backing slot is
/// released.
pub fn unlink<const N: usize>(list: &mut ResourceList<N>, id: ResourceId) -> bool {
    if let Some(pos) = list.iter().position(|existing| *existing == id) {
        list.swap_remove(pos);
        true
    } else {
        false
    }
}

/// A fixed-capacity slab of `T`, indexed by generation-checked
/// [`ResourceId`]s. This is the arena that replaces the pointer-cycle
/// object graph the original kernel builds out of `next-in-list` fields
/// and raw `void*` handles: allocation hands back an id instead of an
/// address, freeing bumps the slot's generation so old ids are rejected,
/// and there is never a dangling pointer to chase.
pub struct Slab<T, const N: usize> {
    tag: ResourceTag,
    slots: [Option<T>; N],
    generations: [u16; N],
}

impl<T, const N: usize> Slab<T, N> {
    pub const fn new(tag: ResourceTag) -> Self
    where
        T: Copy,
    {
        // `Option<T>: Copy` requires `T: Copy`; kernel objects stored here
        // are plain data (handles, small structs), never owning types that
        // would make this bound awkward.
        Self {
            tag,
            slots: [None; N],
            generations: [0; N],
        }
    }

    /// Inserts `value` into the first free slot, returning its id. `None`
    /// if the slab is full — the caller maps this to the "no memory" /
    /// "too many open X" error kind appropriate to the resource kind.
    pub fn insert(&mut self, value: T) -> Option<ResourceId> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(value);
        Some(ResourceId {
            tag: self.tag,
            index: index as u16,
            generation: self.generations[index],
        })
    }

    /// Looks up `id`, returning `None` if the tag doesn't match this slab,
    /// the index is out of range, the slot is empty, or the generation is
    /// stale.
    pub fn get(&self, id: ResourceId) -> Option<&T> {
        self.validate(id)?;
        self.slots[id.index as usize].as_ref()
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut T> {
        self.validate(id)?;
        self.slots[id.index as usize].as_mut()
    }

    /// Removes and returns the value at `id`, bumping the slot's generation
    /// so any copy of this same id still floating around becomes invalid.
    pub fn remove(&mut self, id: ResourceId) -> Option<T> {
        self.validate(id)?;
        let index = id.index as usize;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.slots[index].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &T)> {
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.as_ref().map(|value| {
                (
                    ResourceId {
                        tag: self.tag,
                        index: index as u16,
                        generation: self.generations[index],
                    },
                    value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, id: ResourceId) -> Option<()> {
        if id.tag != self.tag {
            return None;
        }
        let index = id.index as usize;
        if index >= N {
            return None;
        }
        if self.generations[index] != id.generation {
            return None;
        }
        Some(())
    }
}
