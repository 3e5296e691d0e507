// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Portal table entries and the matching walk.
//!
//! Each PT holds two FIFO lists of entries. A request walks the
//! priority list first, then the overflow list; an overflow match
//! additionally records an unexpected-message descriptor that a
//! later search can bind. All list mutation and walking happens
//! under the per-PT mutex; entry state is touched under the entry's
//! own lock, in that order.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::*;
use ptl_protocol::hdr::ReqHdr;
use ptl_protocol::Op;

use crate::event::NiFail;
use crate::le::{self, Le, LeState, ListKind};
use crate::pool::{Handle, Pool};
use crate::{PhysId, PtlError, Result};

/// "Any free index" for pt_alloc.
pub const PT_ANY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtState {
    Enabled,
    Disabled,
    FlowControlled,
}

/// One message that landed on the overflow list, waiting to be
/// bound by a search.
#[derive(Debug, Clone, Copy)]
pub struct UnexpectedHdr {
    pub op: Op,
    pub initiator: PhysId,
    pub src_rank: u32,
    pub match_bits: u64,
    pub rlength: u64,
    pub mlength: u64,
    pub hdr_data: u64,

    /// Where the payload landed inside the capturing entry.
    pub start: usize,

    /// The overflow entry that captured the message.
    pub le: Handle,
}

pub struct PtEntry {
    pub options: u32,
    pub eq: Handle,
    pub state: PtState,

    /// Emitted a PT_DISABLED event since the last disable; reset on
    /// enable so each disable cycle reports once.
    pub disabled_event_sent: bool,

    pub priority: VecDeque<Handle>,
    pub overflow: VecDeque<Handle>,
    pub unexpected: Vec<UnexpectedHdr>,
}

impl PtEntry {
    fn new(options: u32, eq: Handle) -> Self {
        Self {
            options,
            eq,
            state: PtState::Enabled,
            disabled_event_sent: false,
            priority: VecDeque::new(),
            overflow: VecDeque::new(),
            unexpected: Vec::new(),
        }
    }

    pub fn list(&mut self, kind: ListKind) -> &mut VecDeque<Handle> {
        match kind {
            ListKind::Priority => &mut self.priority,
            ListKind::Overflow => &mut self.overflow,
        }
    }
}

/// Where an append places its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPos {
    Priority,
    PriorityPrepend,
    Overflow,
    OverflowPrepend,
}

impl ListPos {
    pub fn kind(&self) -> ListKind {
        match self {
            Self::Priority | Self::PriorityPrepend => ListKind::Priority,
            Self::Overflow | Self::OverflowPrepend => ListKind::Overflow,
        }
    }

    pub fn prepend(&self) -> bool {
        matches!(self, Self::PriorityPrepend | Self::OverflowPrepend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Only,
    Delete,
}

/// Result of the matching walk.
#[derive(Debug, Clone, Copy)]
pub enum MatchOutcome {
    Matched {
        le: Handle,
        list: ListKind,
        moffset: u64,
        mlength: u64,
        auto_unlink: bool,
    },

    /// An entry matched but refused the operation; the walk stops.
    PermFail(NiFail),

    /// Nothing on either list wanted the message.
    NoMatch,
}

/// The per-NI portal table: a fixed array of slots, each with its
/// own mutex.
pub struct PortalTable {
    slots: Vec<Mutex<Option<PtEntry>>>,
}

impl PortalTable {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn alloc(&self, options: u32, eq: Handle, desired: u32) -> Result<u32> {
        if desired != PT_ANY {
            let slot = self
                .slots
                .get(desired as usize)
                .ok_or(PtlError::ArgInvalid)?;
            let mut slot = slot.lock().unwrap();
            if slot.is_some() {
                return Err(PtlError::InUse);
            }
            *slot = Some(PtEntry::new(options, eq));
            return Ok(desired);
        }

        for (i, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                *slot = Some(PtEntry::new(options, eq));
                return Ok(i as u32);
            }
        }

        Err(PtlError::NoSpace)
    }

    /// Free a PT index. Both lists must already be empty.
    pub fn free(&self, index: u32) -> Result<Vec<Handle>> {
        let slot = self.slots.get(index as usize).ok_or(PtlError::ArgInvalid)?;
        let mut slot = slot.lock().unwrap();

        let entry = slot.as_ref().ok_or(PtlError::ArgInvalid)?;
        if !entry.priority.is_empty() || !entry.overflow.is_empty() {
            return Err(PtlError::InUse);
        }

        let leftovers = entry.unexpected.iter().map(|u| u.le).collect();
        *slot = None;
        Ok(leftovers)
    }

    /// Run `f` with the PT entry locked. The usual way in.
    pub fn with<R>(&self, index: u32, f: impl FnOnce(&mut PtEntry) -> R) -> Result<R> {
        let slot = self.slots.get(index as usize).ok_or(PtlError::ArgInvalid)?;
        let mut slot = slot.lock().unwrap();
        let entry = slot.as_mut().ok_or(PtlError::ArgInvalid)?;
        Ok(f(entry))
    }

    pub fn enable(&self, index: u32) -> Result<()> {
        self.with(index, |pt| {
            pt.state = PtState::Enabled;
            pt.disabled_event_sent = false;
        })
    }

    pub fn disable(&self, index: u32) -> Result<()> {
        self.with(index, |pt| pt.state = PtState::Disabled)
    }
}

/// Walk one list FIFO. Returns the outcome, mutating the matched
/// entry's state (offset advance, unlink marking) on the way.
fn walk_list(
    pt: &mut PtEntry,
    kind: ListKind,
    le_pool: &Pool<Le>,
    op: Op,
    req: &ReqHdr,
    src_rank: u32,
    matching: bool,
) -> Option<MatchOutcome> {
    for pos in 0..pt.list(kind).len() {
        let handle = pt.list(kind)[pos];
        let Ok(le) = le_pool.to_obj(handle) else {
            // A stale handle on a PT list means an unlink forgot the
            // list side; skip it and say so.
            warn!("stale entry handle on pt list");
            continue;
        };

        let mut state = le.state.lock().unwrap();

        match le::check_match(&state, op, req, src_rank, matching) {
            Err(le::MatchFail::BitsMismatch) => continue,
            Err(le::MatchFail::Perm(fail)) => return Some(MatchOutcome::PermFail(fail)),
            Ok(()) => {}
        }

        let (moffset, mlength) = le::consume(&mut state, req.rlength, req.roffset);
        let auto_unlink = le::should_auto_unlink(&state);

        if auto_unlink {
            state.linked = false;
            drop(state);
            pt.list(kind).remove(pos);
            // The list's reference is dropped by the caller after it
            // has finished with the entry (the walk's own PoolRef
            // keeps it alive meanwhile).
        }

        return Some(MatchOutcome::Matched {
            le: handle,
            list: kind,
            moffset,
            mlength,
            auto_unlink,
        });
    }

    None
}

/// The full walk: priority list, then overflow.
pub fn match_request(
    pt: &mut PtEntry,
    le_pool: &Pool<Le>,
    op: Op,
    req: &ReqHdr,
    src_rank: u32,
    matching: bool,
) -> MatchOutcome {
    for kind in [ListKind::Priority, ListKind::Overflow] {
        match walk_list(pt, kind, le_pool, op, req, src_rank, matching) {
            Some(outcome) => return outcome,
            None => continue,
        }
    }

    MatchOutcome::NoMatch
}

/// Search the unexpected list for a message matching the probe
/// described by `state`. `Delete` consumes the descriptor.
pub fn search_unexpected(
    pt: &mut PtEntry,
    probe: &LeState,
    mode: SearchMode,
    matching: bool,
) -> Option<UnexpectedHdr> {
    let found = pt.unexpected.iter().position(|u| {
        if matching && (u.match_bits ^ probe.match_bits) & !probe.ignore_bits != 0 {
            return false;
        }
        match probe.match_id {
            le::MatchPeer::Any => true,
            le::MatchPeer::Rank(r) => r == u.src_rank,
            le::MatchPeer::Phys(p) => p == u.initiator,
        }
    })?;

    match mode {
        SearchMode::Only => Some(pt.unexpected[found]),
        SearchMode::Delete => Some(pt.unexpected.remove(found)),
    }
}

/// How many unexpected descriptors still reference `le`. Zero means
/// an auto-unlinked overflow entry can report AUTO_FREE.
pub fn unexpected_refs(pt: &PtEntry, le: Handle) -> usize {
    pt.unexpected.iter().filter(|u| u.le == le).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::le::{LE_OP_PUT, LE_USE_ONCE, UID_ANY};

    fn le_pool() -> Pool<Le> {
        Pool::new("le", 0, 16)
    }

    fn append_entry(pt: &mut PtEntry, pool: &Pool<Le>, kind: ListKind, bits: u64, opts: u32) -> Handle {
        let le = pool.alloc().unwrap();
        let mut state = le.state.lock().unwrap();
        state.length = 4096;
        state.match_bits = bits;
        state.options = opts;
        state.uid = UID_ANY;
        state.linked = true;
        state.list = kind;
        drop(state);

        let h = le.handle();
        // The list holds a reference:
        le.clone().forget();
        pt.list(kind).push_back(h);
        drop(le);
        h
    }

    fn req(bits: u64, len: u64) -> ReqHdr {
        ReqHdr {
            match_bits: bits,
            rlength: len,
            uid: 0,
            ..Default::default()
        }
    }

    #[test]
    fn priority_before_overflow_fifo() {
        let pool = le_pool();
        let mut pt = PtEntry::new(0, Handle::NONE);

        let over = append_entry(&mut pt, &pool, ListKind::Overflow, 0x1, LE_OP_PUT);
        let first = append_entry(&mut pt, &pool, ListKind::Priority, 0x1, LE_OP_PUT);
        let second = append_entry(&mut pt, &pool, ListKind::Priority, 0x1, LE_OP_PUT);

        let MatchOutcome::Matched { le, list, .. } =
            match_request(&mut pt, &pool, Op::Put, &req(0x1, 8), 0, true)
        else {
            panic!("expected a match");
        };

        // Strict FIFO within the priority list:
        assert_eq!(le, first);
        assert_eq!(list, ListKind::Priority);
        let _ = (second, over);
    }

    #[test]
    fn falls_through_to_overflow() {
        let pool = le_pool();
        let mut pt = PtEntry::new(0, Handle::NONE);

        let over = append_entry(&mut pt, &pool, ListKind::Overflow, 0x2, LE_OP_PUT);
        append_entry(&mut pt, &pool, ListKind::Priority, 0x1, LE_OP_PUT);

        let MatchOutcome::Matched { le, list, .. } =
            match_request(&mut pt, &pool, Op::Put, &req(0x2, 8), 0, true)
        else {
            panic!("expected a match");
        };

        assert_eq!(le, over);
        assert_eq!(list, ListKind::Overflow);
    }

    #[test]
    fn no_match_at_all() {
        let pool = le_pool();
        let mut pt = PtEntry::new(0, Handle::NONE);
        append_entry(&mut pt, &pool, ListKind::Priority, 0x1, LE_OP_PUT);

        assert!(matches!(
            match_request(&mut pt, &pool, Op::Put, &req(0x7, 8), 0, true),
            MatchOutcome::NoMatch
        ));
    }

    #[test]
    fn use_once_unlinks_from_list() {
        let pool = le_pool();
        let mut pt = PtEntry::new(0, Handle::NONE);
        append_entry(
            &mut pt,
            &pool,
            ListKind::Priority,
            0x1,
            LE_OP_PUT | LE_USE_ONCE,
        );

        let MatchOutcome::Matched { auto_unlink, .. } =
            match_request(&mut pt, &pool, Op::Put, &req(0x1, 8), 0, true)
        else {
            panic!("expected a match");
        };

        assert!(auto_unlink);
        assert!(pt.priority.is_empty());

        // Second message has nothing left to match:
        assert!(matches!(
            match_request(&mut pt, &pool, Op::Put, &req(0x1, 8), 0, true),
            MatchOutcome::NoMatch
        ));
    }

    #[test]
    fn perm_failure_stops_the_walk() {
        let pool = le_pool();
        let mut pt = PtEntry::new(0, Handle::NONE);

        // First entry matches bits but rejects the op; a later entry
        // would accept it, but must not be reached.
        append_entry(&mut pt, &pool, ListKind::Priority, 0x1, 0);
        append_entry(&mut pt, &pool, ListKind::Priority, 0x1, LE_OP_PUT);

        assert!(matches!(
            match_request(&mut pt, &pool, Op::Put, &req(0x1, 8), 0, true),
            MatchOutcome::PermFail(NiFail::OpViolation)
        ));
    }

    #[test]
    fn pt_alloc_free_cycle() {
        let table = PortalTable::new(4);

        let a = table.alloc(0, Handle::NONE, PT_ANY).unwrap();
        let b = table.alloc(0, Handle::NONE, PT_ANY).unwrap();
        assert_ne!(a, b);

        // Desired index already taken:
        assert_eq!(table.alloc(0, Handle::NONE, a).unwrap_err(), PtlError::InUse);

        table.free(a).unwrap();
        assert_eq!(table.alloc(0, Handle::NONE, a).unwrap(), a);

        assert_eq!(table.free(99).unwrap_err(), PtlError::ArgInvalid);
    }

    #[test]
    fn unexpected_search_modes() {
        let mut pt = PtEntry::new(0, Handle::NONE);
        pt.unexpected.push(UnexpectedHdr {
            op: Op::Put,
            initiator: PhysId { nid: 1, pid: 2 },
            src_rank: 1,
            match_bits: 0xaa,
            rlength: 64,
            mlength: 64,
            hdr_data: 7,
            start: 0x1000,
            le: Handle::NONE,
        });

        let probe = LeState {
            match_bits: 0xaa,
            ..Default::default()
        };

        // Only: found but retained.
        assert!(search_unexpected(&mut pt, &probe, SearchMode::Only, true).is_some());
        assert_eq!(pt.unexpected.len(), 1);

        // Delete: found and consumed.
        assert!(search_unexpected(&mut pt, &probe, SearchMode::Delete, true).is_some());
        assert!(pt.unexpected.is_empty());

        // Gone now.
        assert!(search_unexpected(&mut pt, &probe, SearchMode::Only, true).is_none());
    }
}
