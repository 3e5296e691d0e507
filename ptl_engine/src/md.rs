// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Memory descriptors: the initiator-side view of a local region.

use std::sync::Mutex;

use crate::pool::{Handle, ObjTag, PoolObject};

/// Count acks on the MD's CT.
pub const MD_EVENT_CT_ACK: u32 = 1 << 0;
/// Count replies on the MD's CT.
pub const MD_EVENT_CT_REPLY: u32 = 1 << 1;
/// CT increments count bytes moved instead of operations.
pub const MD_EVENT_CT_BYTES: u32 = 1 << 2;
/// Suppress success events on the MD's EQ (failures still post).
pub const MD_EVENT_SUCCESS_DISABLE: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct MdState {
    /// Base address of the region, stored as an integer so the pool
    /// object stays `Sync`. The application owns the memory for the
    /// MD's lifetime.
    pub start: usize,
    pub length: u64,
    pub options: u32,

    pub eq: Handle,
    pub ct: Handle,

    /// Registration cookie from the copy facade / MR layer.
    pub cookie: u64,
}

/// An initiator-side memory descriptor. Pool-resident.
#[derive(Default)]
pub struct Md {
    state: Mutex<MdState>,
}

impl PoolObject for Md {
    const TAG: ObjTag = ObjTag::Md;

    fn on_alloc(&self) {
        *self.state.lock().unwrap() = MdState::default();
    }
}

impl Md {
    pub fn bind(&self, state: MdState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn get(&self) -> MdState {
        *self.state.lock().unwrap()
    }

    /// True when the region covers `[offset, offset + len)`.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        let state = self.state.lock().unwrap();
        offset.checked_add(len).is_some_and(|end| end <= state.length)
    }
}
