// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Typed object pools and the opaque handles that name their
//! contents.
//!
//! Every externally visible object lives in a per-NI arena sized at
//! NI init from the NI limits. Owners hold indices, never pointers;
//! a handle packs `{type tag, NI index, generation, slot index}`
//! into 64 bits and every lookup revalidates the generation, so a
//! stale handle fails with `ArgInvalid` instead of aliasing a
//! recycled slot. Allocation pops an index off a lock-free free
//! list; the last reference put bumps the generation and pushes the
//! slot back.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use log::*;

use crate::{PtlError, Result};

/// Free-list terminator.
const NIL: u32 = u32::MAX;

const GEN_BITS: u32 = 24;
const GEN_MASK: u64 = (1 << GEN_BITS) - 1;
const INDEX_BITS: u32 = 24;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Type tag carried in the top byte of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjTag {
    Ni = 1,
    Md = 2,
    Le = 3,
    Ct = 4,
    Eq = 5,
    Xi = 6,
    Xt = 7,
}

impl ObjTag {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Ni,
            2 => Self::Md,
            3 => Self::Le,
            4 => Self::Ct,
            5 => Self::Eq,
            6 => Self::Xi,
            7 => Self::Xt,
            _ => return None,
        })
    }
}

/// A 64-bit opaque object name: `tag:8 | ni:8 | generation:24 |
/// index:24`. The default is [`Handle::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub u64);

impl Handle {
    /// The distinguished "no object" handle.
    pub const NONE: Handle = Handle(0);

    /// Wildcard handle, accepted where "any object" makes sense.
    pub const ANY: Handle = Handle(u64::MAX);

    pub(crate) fn new(tag: ObjTag, ni: u8, gen: u32, index: u32) -> Self {
        debug_assert!(u64::from(index) <= INDEX_MASK);
        Self(
            (u64::from(tag as u8) << 56)
                | (u64::from(ni) << 48)
                | ((u64::from(gen) & GEN_MASK) << INDEX_BITS)
                | u64::from(index),
        )
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub(crate) fn tag(&self) -> Option<ObjTag> {
        ObjTag::from_u8((self.0 >> 56) as u8)
    }

    pub(crate) fn ni_index(&self) -> u8 {
        (self.0 >> 48) as u8
    }

    pub(crate) fn gen(&self) -> u32 {
        ((self.0 >> INDEX_BITS) & GEN_MASK) as u32
    }

    pub(crate) fn index(&self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }
}

/// Implemented by every pool-resident type. Objects stay constructed
/// across reuse and carry their own interior mutability; the hooks
/// let a type reset on allocation and release children on free.
pub trait PoolObject: Default + Send + Sync {
    const TAG: ObjTag;

    /// Called with refcount already 1, before the handle escapes.
    fn on_alloc(&self) {}

    /// Called when the last reference is put, before the slot goes
    /// back on the free list.
    fn on_free(&self) {}
}

struct Slot<T> {
    refs: AtomicU32,
    gen: AtomicU32,
    next_free: AtomicU32,
    obj: T,
}

/// A fixed-capacity arena for one object type of one NI. Capacity
/// comes from the NI limits; exhaustion is `NoSpace`, never growth.
pub struct Pool<T: PoolObject> {
    name: &'static str,
    ni_index: u8,
    slots: Box<[Slot<T>]>,

    /// Free list head: `aba-count:32 | index:32`. The count makes
    /// the pop CAS immune to reuse of the same head index.
    free_head: AtomicU64,

    live: AtomicUsize,
}

fn pack_head(aba: u32, index: u32) -> u64 {
    (u64::from(aba) << 32) | u64::from(index)
}

impl<T: PoolObject> Pool<T> {
    pub fn new(name: &'static str, ni_index: u8, capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < INDEX_MASK as usize);

        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                refs: AtomicU32::new(0),
                gen: AtomicU32::new(0),
                next_free: AtomicU32::new(if i + 1 == capacity { NIL } else { i as u32 + 1 }),
                obj: T::default(),
            })
            .collect();

        Self {
            name,
            ni_index,
            slots,
            free_head: AtomicU64::new(pack_head(0, 0)),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Objects currently allocated; zero again once every handle and
    /// reference has been put. The NI fini leak check reads this.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Pop a slot, refcount 1. O(1) and lock-free.
    pub fn alloc(&self) -> Result<PoolRef<'_, T>> {
        let index = loop {
            let head = self.free_head.load(Ordering::Acquire);
            let index = head as u32;

            if index == NIL {
                warn!("{} pool exhausted ({} slots)", self.name, self.slots.len());
                return Err(PtlError::NoSpace);
            }

            let next = self.slots[index as usize].next_free.load(Ordering::Relaxed);
            let new = pack_head((head >> 32) as u32 + 1, next);

            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break index;
            }
        };

        let slot = &self.slots[index as usize];
        slot.refs.store(1, Ordering::Release);
        self.live.fetch_add(1, Ordering::AcqRel);
        slot.obj.on_alloc();

        Ok(PoolRef { pool: self, index })
    }

    /// Resolve a handle, taking a reference. Fails on a foreign tag,
    /// a foreign NI, an out-of-range index, or a stale generation.
    pub fn to_obj(&self, handle: Handle) -> Result<PoolRef<'_, T>> {
        if handle.tag() != Some(T::TAG) || handle.ni_index() != self.ni_index {
            return Err(PtlError::ArgInvalid);
        }

        let index = handle.index();
        let Some(slot) = self.slots.get(index as usize) else {
            return Err(PtlError::ArgInvalid);
        };

        // Take the reference first, then confirm the generation; a
        // slot recycled between the two steps shows up as a mismatch
        // and the speculative reference is dropped again.
        loop {
            let refs = slot.refs.load(Ordering::Acquire);
            if refs == 0 {
                return Err(PtlError::ArgInvalid);
            }

            if slot
                .refs
                .compare_exchange_weak(refs, refs + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        if slot.gen.load(Ordering::Acquire) & GEN_MASK as u32 != handle.gen() {
            self.put_index(index);
            return Err(PtlError::ArgInvalid);
        }

        Ok(PoolRef { pool: self, index })
    }

    fn get_index(&self, index: u32) {
        self.slots[index as usize].refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; the last put retires the slot: free hook,
    /// generation bump (so outstanding handles go stale), free-list
    /// push.
    fn put_index(&self, index: u32) {
        let slot = &self.slots[index as usize];

        if slot.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        slot.obj.on_free();
        slot.gen.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);

        loop {
            let head = self.free_head.load(Ordering::Acquire);
            slot.next_free.store(head as u32, Ordering::Relaxed);
            let new = pack_head((head >> 32) as u32 + 1, index);

            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Visit every currently-live object. Teardown-time only: the
    /// walk races allocation, which is fine once new allocation has
    /// stopped.
    pub fn for_each_live(&self, mut f: impl FnMut(&T)) {
        for slot in self.slots.iter() {
            if slot.refs.load(Ordering::Acquire) > 0 {
                f(&slot.obj);
            }
        }
    }

    /// Drop a bare reference previously detached with
    /// [`PoolRef::forget`]. Containers that store handles rather
    /// than guards pair their detach with exactly one of these.
    pub fn put_ref(&self, handle: Handle) -> Result<()> {
        let guard = self.to_obj(handle)?;
        self.put_index(guard.index);
        Ok(())
    }

    fn handle_of(&self, index: u32) -> Handle {
        let gen = self.slots[index as usize].gen.load(Ordering::Acquire);
        Handle::new(T::TAG, self.ni_index, gen, index)
    }
}

/// A counted reference into a pool. Clone takes another reference;
/// drop puts one back. Dereferences to the object itself.
pub struct PoolRef<'a, T: PoolObject> {
    pool: &'a Pool<T>,
    index: u32,
}

impl<T: PoolObject> PoolRef<'_, T> {
    pub fn handle(&self) -> Handle {
        self.pool.handle_of(self.index)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Detach the guard, leaving its reference counted but unowned.
    /// The holder releases it later with [`Pool::put_ref`].
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl<T: PoolObject> std::fmt::Debug for PoolRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PoolRef({:#018x})", self.handle().0)
    }
}

impl<T: PoolObject> std::ops::Deref for PoolRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.pool.slots[self.index as usize].obj
    }
}

impl<T: PoolObject> Clone for PoolRef<'_, T> {
    fn clone(&self) -> Self {
        self.pool.get_index(self.index);
        Self {
            pool: self.pool,
            index: self.index,
        }
    }
}

impl<T: PoolObject> Drop for PoolRef<'_, T> {
    fn drop(&mut self) {
        self.pool.put_index(self.index);
    }
}
