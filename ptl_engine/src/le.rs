// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! List entries: the target-side regions incoming operations land
//! in. A non-matching LE and a matching ME share one representation;
//! the match fields are simply ignored on a non-matching NI.

use std::sync::Mutex;

use ptl_protocol::hdr::ReqHdr;
use ptl_protocol::Op;

use crate::event::NiFail;
use crate::pool::{Handle, ObjTag, PoolObject};
use crate::PhysId;

/// Entry accepts Put (and the data-in half of atomics).
pub const LE_OP_PUT: u32 = 1 << 0;
/// Entry accepts Get (and the fetch half of atomics).
pub const LE_OP_GET: u32 = 1 << 1;
/// Unlink after the first match.
pub const LE_USE_ONCE: u32 = 1 << 2;
/// The entry manages its own write offset; unlink when residual
/// space falls under `min_free`.
pub const LE_MANAGE_LOCAL: u32 = 1 << 3;
/// Count communication on the entry's CT.
pub const LE_EVENT_CT_COMM: u32 = 1 << 4;
/// CT counts bytes instead of operations.
pub const LE_EVENT_CT_BYTES: u32 = 1 << 5;
/// Suppress comm events on the PT's EQ for this entry.
pub const LE_EVENT_COMM_DISABLE: u32 = 1 << 6;
/// Never acknowledge operations on this entry, whatever the
/// initiator asked for.
pub const LE_ACK_DISABLE: u32 = 1 << 7;
/// Announce the append itself with a LINK event.
pub const LE_EVENT_LINK: u32 = 1 << 8;

/// Wildcard uid.
pub const UID_ANY: u32 = u32::MAX;

/// Peer filter on a match entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPeer {
    #[default]
    Any,
    Rank(u32),
    Phys(PhysId),
}

/// Which PT list an entry is (or was) linked on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListKind {
    #[default]
    Priority,
    Overflow,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeState {
    pub start: usize,
    pub length: u64,

    /// Locally managed write offset (`LE_MANAGE_LOCAL`).
    pub offset: u64,

    pub options: u32,
    pub uid: u32,

    // Matching fields; meaningful on matching NIs only.
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub min_free: u64,
    pub match_id: MatchPeer,

    pub ct: Handle,
    pub user_ptr: u64,

    /// Where the entry is linked, while it is.
    pub pt_index: u32,
    pub list: ListKind,
    pub linked: bool,
}

/// A list entry. Pool-resident.
#[derive(Default)]
pub struct Le {
    pub state: Mutex<LeState>,

    /// Serialises atomic word updates against this entry's memory.
    pub word_lock: Mutex<()>,
}

impl PoolObject for Le {
    const TAG: ObjTag = ObjTag::Le;

    fn on_alloc(&self) {
        *self.state.lock().unwrap() = LeState::default();
    }
}

/// Why a candidate entry did not take a request. `BitsMismatch`
/// keeps the walk going; the permission failures stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFail {
    BitsMismatch,
    Perm(NiFail),
}

/// The matching predicate: bits under the ignore mask, then the
/// peer filter, then the operation mask, then the uid. Pure so it
/// can be tested without an NI.
pub fn check_match(
    state: &LeState,
    op: Op,
    req: &ReqHdr,
    src_rank: u32,
    matching: bool,
) -> std::result::Result<(), MatchFail> {
    if matching && (req.match_bits ^ state.match_bits) & !state.ignore_bits != 0 {
        return Err(MatchFail::BitsMismatch);
    }

    match state.match_id {
        MatchPeer::Any => {}
        MatchPeer::Rank(r) => {
            if r != src_rank {
                return Err(MatchFail::BitsMismatch);
            }
        }
        MatchPeer::Phys(p) => {
            if p.nid != req.src_nid || p.pid != req.src_pid {
                return Err(MatchFail::BitsMismatch);
            }
        }
    }

    let needs = match op {
        Op::Put | Op::Atomic => LE_OP_PUT,
        Op::Get => LE_OP_GET,
        Op::Fetch | Op::Swap => LE_OP_PUT | LE_OP_GET,
        _ => return Err(MatchFail::Perm(NiFail::OpViolation)),
    };
    if state.options & needs != needs {
        return Err(MatchFail::Perm(NiFail::OpViolation));
    }

    if state.uid != UID_ANY && state.uid != req.uid {
        return Err(MatchFail::Perm(NiFail::PermViolation));
    }

    Ok(())
}

/// Consume `rlength` bytes at the entry: returns `(moffset,
/// mlength)` after truncation and advances the managed offset.
/// The caller decides unlinking via [`should_auto_unlink`].
pub fn consume(state: &mut LeState, rlength: u64, roffset: u64) -> (u64, u64) {
    let moffset = if state.options & LE_MANAGE_LOCAL != 0 {
        state.offset
    } else {
        roffset.min(state.length)
    };

    let mlength = rlength.min(state.length - moffset);

    if state.options & LE_MANAGE_LOCAL != 0 {
        state.offset += mlength;
    }

    (moffset, mlength)
}

/// Unlink policy after a match: unconditionally for `use_once`;
/// for `manage_local` once the residual free space drops under
/// `min_free`.
pub fn should_auto_unlink(state: &LeState) -> bool {
    if state.options & LE_USE_ONCE != 0 {
        return true;
    }

    state.options & LE_MANAGE_LOCAL != 0 && state.length - state.offset < state.min_free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(options: u32) -> LeState {
        LeState {
            start: 0,
            length: 1024,
            options,
            uid: UID_ANY,
            ..Default::default()
        }
    }

    fn put_req(match_bits: u64) -> ReqHdr {
        ReqHdr {
            match_bits,
            uid: 42,
            rlength: 64,
            ..Default::default()
        }
    }

    #[test]
    fn bits_and_ignore_mask() {
        let mut state = entry(LE_OP_PUT);
        state.match_bits = 0xaa00;
        state.ignore_bits = 0x00ff;

        let req = put_req(0xaa55);
        assert!(check_match(&state, Op::Put, &req, 0, true).is_ok());

        let req = put_req(0xab55);
        assert_eq!(
            check_match(&state, Op::Put, &req, 0, true).unwrap_err(),
            MatchFail::BitsMismatch
        );

        // Non-matching NI ignores the bits entirely:
        assert!(check_match(&state, Op::Put, &req, 0, false).is_ok());
    }

    #[test]
    fn peer_filter() {
        let mut state = entry(LE_OP_PUT);
        state.match_id = MatchPeer::Rank(3);

        let req = put_req(0);
        assert!(check_match(&state, Op::Put, &req, 3, true).is_ok());
        assert_eq!(
            check_match(&state, Op::Put, &req, 4, true).unwrap_err(),
            MatchFail::BitsMismatch
        );
    }

    #[test]
    fn op_permissions() {
        let state = entry(LE_OP_PUT);
        let req = put_req(0);

        assert_eq!(
            check_match(&state, Op::Get, &req, 0, true).unwrap_err(),
            MatchFail::Perm(NiFail::OpViolation)
        );

        // Fetching atomics need both permissions:
        assert_eq!(
            check_match(&state, Op::Fetch, &req, 0, true).unwrap_err(),
            MatchFail::Perm(NiFail::OpViolation)
        );
        let both = entry(LE_OP_PUT | LE_OP_GET);
        assert!(check_match(&both, Op::Fetch, &req, 0, true).is_ok());
    }

    #[test]
    fn uid_check() {
        let mut state = entry(LE_OP_PUT);
        state.uid = 42;

        let req = put_req(0);
        assert!(check_match(&state, Op::Put, &req, 0, true).is_ok());

        let mut other = req;
        other.uid = 43;
        assert_eq!(
            check_match(&state, Op::Put, &other, 0, true).unwrap_err(),
            MatchFail::Perm(NiFail::PermViolation)
        );
    }

    #[test]
    fn consume_truncates_and_advances() {
        let mut state = entry(LE_OP_PUT | LE_MANAGE_LOCAL);

        assert_eq!(consume(&mut state, 1000, 0), (0, 1000));
        // Only 24 bytes left; a 64-byte request truncates:
        assert_eq!(consume(&mut state, 64, 0), (1000, 24));
        assert_eq!(state.offset, 1024);
    }

    #[test]
    fn remote_offset_without_manage_local() {
        let mut state = entry(LE_OP_PUT);
        assert_eq!(consume(&mut state, 64, 100), (100, 64));
        // Offset untouched:
        assert_eq!(state.offset, 0);
    }

    #[test]
    fn min_free_auto_unlink() {
        let mut state = entry(LE_OP_PUT | LE_MANAGE_LOCAL);
        state.min_free = 1024;

        // min_free equal to the length: any non-zero consumption
        // drops the residual below it.
        assert!(!should_auto_unlink(&state));
        consume(&mut state, 1, 0);
        assert!(should_auto_unlink(&state));
    }

    #[test]
    fn use_once_always_unlinks() {
        let state = entry(LE_OP_PUT | LE_USE_ONCE);
        assert!(should_auto_unlink(&state));
    }
}
