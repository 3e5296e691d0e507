// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Event records, as they land in event queues.

use crate::pool::Handle;
use crate::PhysId;

/// What happened. Overflow variants mean the operation matched on
/// the overflow list rather than the priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Send,
    Ack,
    Reply,
    Put,
    PutOverflow,
    Get,
    GetOverflow,
    Atomic,
    AtomicOverflow,
    FetchAtomic,
    FetchAtomicOverflow,
    Search,
    Link,
    AutoUnlink,
    AutoFree,
    PtDisabled,
    Dropped,
}

/// Failure disposition carried in every event. `Ok` is success;
/// everything else explains why the operation did not complete
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NiFail {
    #[default]
    Ok = 0,
    Undeliverable = 1,
    Dropped = 2,
    PermViolation = 3,
    OpViolation = 4,
    Segv = 5,
    NoMatch = 6,
}

impl NiFail {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Undeliverable,
            2 => Self::Dropped,
            3 => Self::PermViolation,
            4 => Self::OpViolation,
            5 => Self::Segv,
            _ => Self::NoMatch,
        }
    }
}

/// One event record. Fields that make no sense for a given kind are
/// zero.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub ni_fail: NiFail,

    /// Source of the operation, for target-side events.
    pub initiator: PhysId,

    pub pt_index: u32,
    pub match_bits: u64,

    /// Requested and actually-moved lengths.
    pub rlength: u64,
    pub mlength: u64,

    pub remote_offset: u64,

    /// Address where the data landed (target-side events); for
    /// SEARCH events this points into the overflow buffer.
    pub start: usize,

    pub user_ptr: u64,
    pub hdr_data: u64,

    /// The entry or descriptor the event concerns, when one does.
    pub handle: Handle,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            kind: EventKind::Send,
            ni_fail: NiFail::Ok,
            initiator: PhysId { nid: 0, pid: 0 },
            pt_index: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            remote_offset: 0,
            start: 0,
            user_ptr: 0,
            hdr_data: 0,
            handle: Handle::NONE,
        }
    }
}
