// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The public operations. Each entry point validates its arguments
//! synchronously and side-effect-free, builds an initiator
//! transaction, and hands it to the engine; everything after that is
//! asynchronous and reported through events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;
use ptl_protocol::atom::{op_type_valid, AtomOp, AtomType};
use ptl_protocol::hdr;
use ptl_protocol::{CommonHdr, Op, PktFmt};

use crate::conn::Conn;
use crate::ct::{CtEvent, TriggeredOp};
use crate::event::{Event, EventKind, NiFail};
use crate::initiator;
use crate::le::{LeState, MatchPeer, UID_ANY};
use crate::md::MdState;
use crate::ni::Ni;
use crate::pool::Handle;
use crate::pt::{self, ListPos, SearchMode};
use crate::shm::BufType;
use crate::{Peer, PtlError, Result};

/// Acknowledgement modes an initiator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckReq {
    #[default]
    None,
    Ack,
    CtAck,
    OcAck,
}

impl AckReq {
    fn wire(self) -> u8 {
        match self {
            Self::None => hdr::ACK_REQ_NONE,
            Self::Ack => hdr::ACK_REQ_ACK,
            Self::CtAck => hdr::ACK_REQ_CT,
            Self::OcAck => hdr::ACK_REQ_OC,
        }
    }
}

/// Everything that describes one data-movement operation. Stored
/// verbatim by triggered operations until their threshold fires.
#[derive(Debug, Clone)]
pub struct OpArgs {
    pub op: Op,
    pub put_md: Handle,
    pub local_put_offset: u64,
    pub get_md: Handle,
    pub local_get_offset: u64,
    pub length: u64,
    pub target: Peer,
    pub pt_index: u32,
    pub match_bits: u64,
    pub remote_offset: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
    pub ack_req: AckReq,
    pub atom_op: u8,
    pub atom_type: u8,
    pub operand: [u8; 32],
}

impl OpArgs {
    fn new(op: Op) -> Self {
        Self {
            op,
            put_md: Handle::NONE,
            local_put_offset: 0,
            get_md: Handle::NONE,
            local_get_offset: 0,
            length: 0,
            target: Peer::Rank(0),
            pt_index: 0,
            match_bits: 0,
            remote_offset: 0,
            user_ptr: 0,
            hdr_data: 0,
            ack_req: AckReq::None,
            atom_op: 0,
            atom_type: 0,
            operand: [0; 32],
        }
    }
}

// Data movement ------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn put(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    ack: AckReq,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
) -> Result<()> {
    let args = OpArgs {
        put_md: md,
        local_put_offset: local_offset,
        length,
        ack_req: ack,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        ..OpArgs::new(Op::Put)
    };
    validate(ni, &args)?;
    submit(ni, &args)
}

#[allow(clippy::too_many_arguments)]
pub fn get(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
) -> Result<()> {
    let args = OpArgs {
        get_md: md,
        local_get_offset: local_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        ..OpArgs::new(Op::Get)
    };
    validate(ni, &args)?;
    submit(ni, &args)
}

#[allow(clippy::too_many_arguments)]
pub fn atomic(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    ack: AckReq,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    atom_op: AtomOp,
    atom_type: AtomType,
) -> Result<()> {
    if atom_op.is_swap() {
        // The swap family needs the fetch path.
        return Err(PtlError::ArgInvalid);
    }

    let args = OpArgs {
        put_md: md,
        local_put_offset: local_offset,
        length,
        ack_req: ack,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        ..OpArgs::new(Op::Atomic)
    };
    validate(ni, &args)?;
    submit(ni, &args)
}

#[allow(clippy::too_many_arguments)]
pub fn fetch_atomic(
    ni: &Arc<Ni>,
    get_md: Handle,
    local_get_offset: u64,
    put_md: Handle,
    local_put_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    atom_op: AtomOp,
    atom_type: AtomType,
) -> Result<()> {
    if atom_op.is_swap() {
        return Err(PtlError::ArgInvalid);
    }

    let args = OpArgs {
        put_md,
        local_put_offset,
        get_md,
        local_get_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        ..OpArgs::new(Op::Fetch)
    };
    validate(ni, &args)?;
    submit(ni, &args)
}

#[allow(clippy::too_many_arguments)]
pub fn swap(
    ni: &Arc<Ni>,
    get_md: Handle,
    local_get_offset: u64,
    put_md: Handle,
    local_put_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    operand: &[u8],
    atom_op: AtomOp,
    atom_type: AtomType,
) -> Result<()> {
    if !atom_op.is_swap() {
        return Err(PtlError::ArgInvalid);
    }

    let mut op_bytes = [0u8; 32];
    let n = operand.len().min(32);
    op_bytes[..n].copy_from_slice(&operand[..n]);

    let args = OpArgs {
        put_md,
        local_put_offset,
        get_md,
        local_get_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        operand: op_bytes,
        ..OpArgs::new(Op::Swap)
    };
    validate(ni, &args)?;
    submit(ni, &args)
}

/// The synchronous validation pass. No side effects on failure.
fn validate(ni: &Arc<Ni>, args: &OpArgs) -> Result<()> {
    if args.pt_index as usize >= ni.limits.max_pt_index {
        return Err(PtlError::ArgInvalid);
    }
    if args.length > ni.limits.max_msg_size {
        return Err(PtlError::ArgInvalid);
    }

    let is_atomic = matches!(args.op, Op::Atomic | Op::Fetch | Op::Swap);
    if is_atomic {
        if args.length > ni.limits.max_atomic_size {
            return Err(PtlError::ArgInvalid);
        }

        let atom_op = AtomOp::from_u8(args.atom_op).map_err(|_| PtlError::ArgInvalid)?;
        let atom_type = AtomType::from_u8(args.atom_type).map_err(|_| PtlError::ArgInvalid)?;
        if !op_type_valid(atom_op, atom_type) {
            return Err(PtlError::ArgInvalid);
        }

        let size = atom_type.size() as u64;
        if args.length % size != 0 {
            return Err(PtlError::ArgInvalid);
        }
        if atom_op.is_swap() && atom_op != AtomOp::Swap && args.length != size {
            return Err(PtlError::ArgInvalid);
        }
    }

    // Put-side MD checks.
    if matches!(args.op, Op::Put | Op::Atomic | Op::Fetch | Op::Swap) {
        let md = ni.md_pool.to_obj(args.put_md)?;
        if !md.contains(args.local_put_offset, args.length) {
            return Err(PtlError::ArgInvalid);
        }

        // An acknowledgement with nowhere to land is a programming
        // error, caught here rather than silently dropped.
        if args.ack_req != AckReq::None {
            let m = md.get();
            if m.eq.is_none() && m.ct.is_none() {
                return Err(PtlError::ArgInvalid);
            }
        }
    }

    // Get-side MD checks.
    if matches!(args.op, Op::Get | Op::Fetch | Op::Swap) {
        let md = ni.md_pool.to_obj(args.get_md)?;
        if !md.contains(args.local_get_offset, args.length) {
            return Err(PtlError::ArgInvalid);
        }
    }

    Ok(())
}

/// Build the transaction and start the initiator machine. The
/// transaction holds a reference on each MD until it completes.
fn submit(ni: &Arc<Ni>, args: &OpArgs) -> Result<()> {
    let xi = with_backpressure(|| ni.xi_pool.alloc())?;

    {
        let mut st = xi.state.lock().unwrap();
        st.op = args.op;
        st.target = Some(args.target);
        st.pt_index = args.pt_index;
        st.match_bits = args.match_bits;
        st.hdr_data = args.hdr_data;
        st.roffset = args.remote_offset;
        st.rlength = args.length;
        st.put_resid = args.length;
        st.get_resid = args.length;
        st.ack_req = args.ack_req.wire();
        st.put_md = args.put_md;
        st.get_md = args.get_md;
        st.local_put_offset = args.local_put_offset;
        st.local_get_offset = args.local_get_offset;
        st.atom_op = args.atom_op;
        st.atom_type = args.atom_type;
        st.operand = args.operand;
        st.user_ptr = args.user_ptr;
    }

    // The transaction's MD references, released by the initiator's
    // cleanup.
    if !args.put_md.is_none() {
        ni.md_pool.to_obj(args.put_md)?.forget();
    }
    if !args.get_md.is_none() {
        match ni.md_pool.to_obj(args.get_md) {
            Ok(md) => md.forget(),
            Err(e) => {
                if !args.put_md.is_none() {
                    let _ = ni.md_pool.put_ref(args.put_md);
                }
                return Err(e);
            }
        }
    }

    // From here every failure is delivered as an event by the
    // machine itself; an Err means nothing took ownership.
    let result = initiator::start(ni, &xi);
    if result.is_err() {
        if !args.put_md.is_none() {
            let _ = ni.md_pool.put_ref(args.put_md);
        }
        if !args.get_md.is_none() {
            let _ = ni.md_pool.put_ref(args.get_md);
        }
    }
    result
}

/// An in-process barrier for the atomics stream. Data movement on
/// the shared-memory transport is synchronous at the target, so by
/// the time every reply is in there is nothing left to order.
pub fn atomic_sync(_ni: &Arc<Ni>) -> Result<()> {
    Ok(())
}

/// Ask for a send completion only every `n`th send to `peer`,
/// amortising doorbells on transports where signals cost one.
pub fn set_send_threshold(ni: &Arc<Ni>, peer: Peer, n: u32) -> Result<()> {
    let conn = ni.get_conn(peer)?;
    ni.transport.set_send_completion_threshold(&conn, n);
    Ok(())
}

/// Bundling is recorded as a no-op pair pending real semantics.
pub fn start_bundle(_ni: &Arc<Ni>) -> Result<()> {
    Ok(())
}

pub fn end_bundle(_ni: &Arc<Ni>) -> Result<()> {
    Ok(())
}

// Memory descriptors -------------------------------------------

pub fn md_bind(ni: &Arc<Ni>, state: MdState) -> Result<Handle> {
    if state.eq != Handle::NONE {
        ni.eq_pool.to_obj(state.eq)?;
    }
    if state.ct != Handle::NONE {
        ni.ct_pool.to_obj(state.ct)?;
    }

    let md = ni.md_pool.alloc()?;
    let mut state = state;
    state.cookie = ni.gbl.copy.register(state.start, state.length as usize);
    md.bind(state);

    let handle = md.handle();
    md.forget(); // the caller's reference
    Ok(handle)
}

pub fn md_release(ni: &Arc<Ni>, md: Handle) -> Result<()> {
    ni.md_pool.put_ref(md)
}

// List entries -------------------------------------------------

/// Construction arguments for `le_append` / `me_append`.
#[derive(Debug, Clone)]
pub struct LeInit {
    pub start: usize,
    pub length: u64,
    pub options: u32,
    pub uid: u32,
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub min_free: u64,
    pub match_id: MatchPeer,
    pub ct: Handle,
}

impl Default for LeInit {
    fn default() -> Self {
        Self {
            start: 0,
            length: 0,
            options: 0,
            uid: UID_ANY,
            match_bits: 0,
            ignore_bits: 0,
            min_free: 0,
            match_id: MatchPeer::Any,
            ct: Handle::NONE,
        }
    }
}

/// Append an entry. The list holds the only counted reference; it
/// moves out on unlink (explicit or automatic).
pub fn append(
    ni: &Arc<Ni>,
    pt_index: u32,
    init: &LeInit,
    pos: ListPos,
    user_ptr: u64,
) -> Result<Handle> {
    if init.ct != Handle::NONE {
        ni.ct_pool.to_obj(init.ct)?;
    }

    let le = ni.le_pool.alloc()?;
    {
        let mut state = le.state.lock().unwrap();
        state.start = init.start;
        state.length = init.length;
        state.options = init.options;
        state.uid = init.uid;
        state.match_bits = init.match_bits;
        state.ignore_bits = init.ignore_bits;
        state.min_free = init.min_free;
        state.match_id = init.match_id;
        state.ct = init.ct;
        state.user_ptr = user_ptr;
        state.pt_index = pt_index;
        state.list = pos.kind();
        state.linked = true;
    }

    let handle = le.handle();

    let eq = ni.pt.with(pt_index, |entry| {
        if pos.prepend() {
            entry.list(pos.kind()).push_front(handle);
        } else {
            entry.list(pos.kind()).push_back(handle);
        }
        entry.eq
    })?;

    // The list's reference.
    le.forget();

    // LINK is opt-in so steady-state appenders do not flood their
    // queue.
    if init.options & crate::le::LE_EVENT_LINK != 0 {
        ni.post_event(
            eq,
            Event {
                kind: EventKind::Link,
                pt_index,
                user_ptr,
                handle,
                ..Default::default()
            },
        );
    }

    Ok(handle)
}

/// Remove an entry from its list and drop the list's reference. The
/// handle is stale afterwards.
pub fn unlink(ni: &Arc<Ni>, handle: Handle) -> Result<()> {
    let le = ni.le_pool.to_obj(handle)?;
    let pt_index = le.state.lock().unwrap().pt_index;

    // The linked check and the list removal sit under the PT mutex
    // together, so an auto-unlink racing us cannot double-drop the
    // list's reference.
    let removed = ni.pt.with(pt_index, |entry| {
        let mut state = le.state.lock().unwrap();
        if !state.linked {
            return false;
        }
        state.linked = false;
        let kind = state.list;
        drop(state);

        entry.list(kind).retain(|h| *h != handle);
        true
    })?;

    if !removed {
        return Err(PtlError::ArgInvalid);
    }

    drop(le);
    ni.le_pool.put_ref(handle)
}

/// Probe the unexpected list. Emits one SEARCH event either way;
/// `Delete` consumes the descriptor, and the last descriptor of an
/// already-unlinked overflow entry announces AUTO_FREE.
pub fn search(
    ni: &Arc<Ni>,
    pt_index: u32,
    init: &LeInit,
    mode: SearchMode,
    user_ptr: u64,
) -> Result<()> {
    let probe = LeState {
        match_bits: init.match_bits,
        ignore_bits: init.ignore_bits,
        match_id: init.match_id,
        ..Default::default()
    };

    let matching = ni.options.matching;
    let (eq, found, free_check) = ni.pt.with(pt_index, |entry| {
        let found = pt::search_unexpected(entry, &probe, mode, matching);
        let free_check = found
            .filter(|_| mode == SearchMode::Delete)
            .map(|u| (u.le, pt::unexpected_refs(entry, u.le)));
        (entry.eq, found, free_check)
    })?;

    match found {
        Some(u) => {
            ni.post_event(
                eq,
                Event {
                    kind: EventKind::Search,
                    ni_fail: NiFail::Ok,
                    initiator: u.initiator,
                    pt_index,
                    match_bits: u.match_bits,
                    rlength: u.rlength,
                    mlength: u.mlength,
                    start: u.start,
                    hdr_data: u.hdr_data,
                    user_ptr,
                    handle: u.le,
                    ..Default::default()
                },
            );

            if let Some((le, 0)) = free_check {
                // AUTO_FREE: the last unexpected reference to an
                // already-unlinked overflow entry just drained.
                if let Ok(entry) = ni.le_pool.to_obj(le) {
                    if !entry.state.lock().unwrap().linked {
                        ni.post_event(
                            eq,
                            Event {
                                kind: EventKind::AutoFree,
                                pt_index,
                                handle: le,
                                ..Default::default()
                            },
                        );
                    }
                }
            }
        }
        None => {
            ni.post_event(
                eq,
                Event {
                    kind: EventKind::Search,
                    ni_fail: NiFail::NoMatch,
                    pt_index,
                    user_ptr,
                    ..Default::default()
                },
            );
        }
    }

    Ok(())
}

// Portal table -------------------------------------------------

pub fn pt_alloc(ni: &Arc<Ni>, options: u32, eq: Handle, desired: u32) -> Result<u32> {
    if eq != Handle::NONE {
        ni.eq_pool.to_obj(eq)?;
    }
    ni.pt.alloc(options, eq, desired)
}

pub fn pt_free(ni: &Arc<Ni>, pt_index: u32) -> Result<()> {
    ni.pt.free(pt_index).map(|_| ())
}

pub fn pt_enable(ni: &Arc<Ni>, pt_index: u32) -> Result<()> {
    ni.pt.enable(pt_index)
}

pub fn pt_disable(ni: &Arc<Ni>, pt_index: u32) -> Result<()> {
    ni.pt.disable(pt_index)
}

// Event queues -------------------------------------------------

pub fn eq_alloc(ni: &Arc<Ni>, count: usize) -> Result<Handle> {
    let eq = ni.eq_pool.alloc()?;
    eq.init(count);
    let handle = eq.handle();
    eq.forget();
    Ok(handle)
}

pub fn eq_free(ni: &Arc<Ni>, eq: Handle) -> Result<()> {
    ni.eq_pool.to_obj(eq)?.interrupt();
    ni.eq_pool.put_ref(eq)
}

/// Non-blocking read. The boolean reports (once) that the queue
/// overran since the previous read.
pub fn eq_get(ni: &Arc<Ni>, eq: Handle) -> Result<(Event, bool)> {
    ni.eq_pool.to_obj(eq)?.get()
}

pub fn eq_wait(ni: &Arc<Ni>, eq: Handle) -> Result<(Event, bool)> {
    // Hold a reference across the block so eq_free cannot recycle
    // the slot under the waiter.
    let queue = ni.eq_pool.to_obj(eq)?;
    queue.wait()
}

pub fn eq_poll(ni: &Arc<Ni>, eq: Handle, timeout: Duration) -> Result<(Event, bool)> {
    let queue = ni.eq_pool.to_obj(eq)?;
    queue.poll(timeout)
}

// Counting events ----------------------------------------------

pub fn ct_alloc(ni: &Arc<Ni>) -> Result<Handle> {
    let ct = ni.ct_pool.alloc()?;
    let handle = ct.handle();
    ct.forget();
    Ok(handle)
}

pub fn ct_free(ni: &Arc<Ni>, ct: Handle) -> Result<()> {
    // Cancel armed operations and drop the references they carried.
    let cancelled = ni.ct_pool.to_obj(ct)?.cancel_all();
    for t in cancelled {
        release_triggered(ni, &t.op);
    }
    ni.ct_pool.to_obj(ct)?.interrupt();
    ni.ct_pool.put_ref(ct)
}

pub fn ct_get(ni: &Arc<Ni>, ct: Handle) -> Result<CtEvent> {
    Ok(ni.ct_pool.to_obj(ct)?.get())
}

pub fn ct_inc(ni: &Arc<Ni>, ct: Handle, increment: CtEvent) -> Result<()> {
    ni.ct_pool.to_obj(ct)?;
    ni.ct_bump(ct, increment);
    Ok(())
}

pub fn ct_set(ni: &Arc<Ni>, ct: Handle, value: CtEvent) -> Result<()> {
    let fired = ni.ct_pool.to_obj(ct)?.set(value);
    for t in fired {
        dispatch_triggered(ni, t.op);
    }
    Ok(())
}

pub fn ct_wait(ni: &Arc<Ni>, ct: Handle, threshold: u64) -> Result<CtEvent> {
    let ct = ni.ct_pool.to_obj(ct)?;
    ct.wait(threshold)
}

/// Wait on several counters at once; the first to reach its
/// threshold wins. `CtNoneReached` on timeout.
pub fn ct_poll(
    ni: &Arc<Ni>,
    cts: &[Handle],
    thresholds: &[u64],
    timeout: Duration,
) -> Result<(usize, CtEvent)> {
    if cts.len() != thresholds.len() || cts.is_empty() {
        return Err(PtlError::ArgInvalid);
    }

    let deadline = Instant::now() + timeout;
    loop {
        for (i, (ct, threshold)) in cts.iter().zip(thresholds).enumerate() {
            let ct = ni.ct_pool.to_obj(*ct)?;
            let ev = ct.get();
            if ev.success + ev.failure >= *threshold {
                return Ok((i, ev));
            }
        }

        if Instant::now() >= deadline {
            return Err(PtlError::CtNoneReached);
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

// Triggered operations -----------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn triggered_put(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    ack: AckReq,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    let args = OpArgs {
        put_md: md,
        local_put_offset: local_offset,
        length,
        ack_req: ack,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        ..OpArgs::new(Op::Put)
    };
    validate(ni, &args)?;
    arm(ni, trig_ct, threshold, TriggeredOp::Put(args))
}

#[allow(clippy::too_many_arguments)]
pub fn triggered_get(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    let args = OpArgs {
        get_md: md,
        local_get_offset: local_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        ..OpArgs::new(Op::Get)
    };
    validate(ni, &args)?;
    arm(ni, trig_ct, threshold, TriggeredOp::Get(args))
}

#[allow(clippy::too_many_arguments)]
pub fn triggered_atomic(
    ni: &Arc<Ni>,
    md: Handle,
    local_offset: u64,
    length: u64,
    ack: AckReq,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    atom_op: AtomOp,
    atom_type: AtomType,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    if atom_op.is_swap() {
        return Err(PtlError::ArgInvalid);
    }

    let args = OpArgs {
        put_md: md,
        local_put_offset: local_offset,
        length,
        ack_req: ack,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        ..OpArgs::new(Op::Atomic)
    };
    validate(ni, &args)?;
    arm(ni, trig_ct, threshold, TriggeredOp::Atomic(args))
}

#[allow(clippy::too_many_arguments)]
pub fn triggered_fetch_atomic(
    ni: &Arc<Ni>,
    get_md: Handle,
    local_get_offset: u64,
    put_md: Handle,
    local_put_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    atom_op: AtomOp,
    atom_type: AtomType,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    if atom_op.is_swap() {
        return Err(PtlError::ArgInvalid);
    }

    let args = OpArgs {
        put_md,
        local_put_offset,
        get_md,
        local_get_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        ..OpArgs::new(Op::Fetch)
    };
    validate(ni, &args)?;
    arm(ni, trig_ct, threshold, TriggeredOp::FetchAtomic(args))
}

#[allow(clippy::too_many_arguments)]
pub fn triggered_swap(
    ni: &Arc<Ni>,
    get_md: Handle,
    local_get_offset: u64,
    put_md: Handle,
    local_put_offset: u64,
    length: u64,
    target: Peer,
    pt_index: u32,
    match_bits: u64,
    remote_offset: u64,
    user_ptr: u64,
    hdr_data: u64,
    operand: &[u8],
    atom_op: AtomOp,
    atom_type: AtomType,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    if !atom_op.is_swap() {
        return Err(PtlError::ArgInvalid);
    }

    let mut op_bytes = [0u8; 32];
    let n = operand.len().min(32);
    op_bytes[..n].copy_from_slice(&operand[..n]);

    let args = OpArgs {
        put_md,
        local_put_offset,
        get_md,
        local_get_offset,
        length,
        target,
        pt_index,
        match_bits,
        remote_offset,
        user_ptr,
        hdr_data,
        atom_op: atom_op as u8,
        atom_type: atom_type as u8,
        operand: op_bytes,
        ..OpArgs::new(Op::Swap)
    };
    validate(ni, &args)?;
    arm(ni, trig_ct, threshold, TriggeredOp::Swap(args))
}

pub fn triggered_ct_inc(
    ni: &Arc<Ni>,
    ct: Handle,
    increment: CtEvent,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    ni.ct_pool.to_obj(ct)?;
    arm(ni, trig_ct, threshold, TriggeredOp::CtInc { ct, increment })
}

pub fn triggered_ct_set(
    ni: &Arc<Ni>,
    ct: Handle,
    value: CtEvent,
    trig_ct: Handle,
    threshold: u64,
) -> Result<()> {
    ni.ct_pool.to_obj(ct)?;
    arm(ni, trig_ct, threshold, TriggeredOp::CtSet { ct, value })
}

/// Arm an operation on `trig_ct`. The armed record holds MD
/// references so the descriptors cannot be recycled before the
/// threshold fires.
fn arm(ni: &Arc<Ni>, trig_ct: Handle, threshold: u64, op: TriggeredOp) -> Result<()> {
    retain_triggered(ni, &op)?;

    let ct = match ni.ct_pool.to_obj(trig_ct) {
        Ok(ct) => ct,
        Err(e) => {
            release_triggered(ni, &op);
            return Err(e);
        }
    };

    match ct.arm(threshold, &op, ni.limits.max_triggered_ops) {
        Ok(None) => Ok(()),
        Ok(Some(op)) => {
            // Threshold already reached: fires now, exactly once.
            dispatch_triggered(ni, op);
            Ok(())
        }
        Err(e) => {
            release_triggered(ni, &op);
            Err(e)
        }
    }
}

fn retain_triggered(ni: &Arc<Ni>, op: &TriggeredOp) -> Result<()> {
    match op {
        TriggeredOp::Put(a)
        | TriggeredOp::Get(a)
        | TriggeredOp::Atomic(a)
        | TriggeredOp::FetchAtomic(a)
        | TriggeredOp::Swap(a) => {
            if !a.put_md.is_none() {
                ni.md_pool.to_obj(a.put_md)?.forget();
            }
            if !a.get_md.is_none() {
                match ni.md_pool.to_obj(a.get_md) {
                    Ok(md) => md.forget(),
                    Err(e) => {
                        if !a.put_md.is_none() {
                            let _ = ni.md_pool.put_ref(a.put_md);
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        }
        TriggeredOp::CtInc { ct, .. } | TriggeredOp::CtSet { ct, .. } => {
            ni.ct_pool.to_obj(*ct)?.forget();
            Ok(())
        }
    }
}

pub(crate) fn release_triggered(ni: &Arc<Ni>, op: &TriggeredOp) {
    match op {
        TriggeredOp::Put(a)
        | TriggeredOp::Get(a)
        | TriggeredOp::Atomic(a)
        | TriggeredOp::FetchAtomic(a)
        | TriggeredOp::Swap(a) => {
            if !a.put_md.is_none() {
                let _ = ni.md_pool.put_ref(a.put_md);
            }
            if !a.get_md.is_none() {
                let _ = ni.md_pool.put_ref(a.get_md);
            }
        }
        TriggeredOp::CtInc { ct, .. } | TriggeredOp::CtSet { ct, .. } => {
            let _ = ni.ct_pool.put_ref(*ct);
        }
    }
}

/// Fire a detached triggered operation through the normal codepath.
pub(crate) fn dispatch_triggered(ni: &Arc<Ni>, op: TriggeredOp) {
    let result = match &op {
        TriggeredOp::Put(a)
        | TriggeredOp::Get(a)
        | TriggeredOp::Atomic(a)
        | TriggeredOp::FetchAtomic(a)
        | TriggeredOp::Swap(a) => submit(ni, a),
        TriggeredOp::CtInc { ct, increment } => ct_inc(ni, *ct, *increment),
        TriggeredOp::CtSet { ct, value } => ct_set(ni, *ct, *value),
    };

    if let Err(e) = result {
        warn!("triggered operation failed to dispatch: {e}");
    }

    release_triggered(ni, &op);
}

// Status -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRegister {
    DropCount,
    RecvErrors,
}

pub fn ni_status(ni: &Arc<Ni>, register: StatusRegister) -> u64 {
    match register {
        StatusRegister::DropCount => ni.num_recv_drops.load(std::sync::atomic::Ordering::Relaxed),
        StatusRegister::RecvErrors => ni.num_recv_errs.load(std::sync::atomic::Ordering::Relaxed),
    }
}

// Engine-internal helpers --------------------------------------

/// Pop a send buffer, waiting briefly for returns when the pool is
/// dry. The wait is backpressure, not flow control: send rate is
/// bounded by how fast peers hand our buffers back.
///
/// On the progress thread the wait cannot be a plain yield: that
/// thread is the queue's only consumer, so the returns it is waiting
/// for are sitting in its own queue. It hunts them out directly,
/// stashing any non-return fragments for the main loop to process
/// in order.
pub(crate) fn alloc_buf_backpressure(ni: &Arc<Ni>) -> Result<u32> {
    let pad = &ni.gbl.pad;
    let on_progress =
        *ni.progress_id.lock().unwrap() == Some(std::thread::current().id());
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        if let Some(off) = pad.alloc_buf(ni.rank) {
            return Ok(off);
        }
        if Instant::now() >= deadline {
            return Err(PtlError::NoSpace);
        }

        if !on_progress {
            std::thread::yield_now();
            continue;
        }

        match pad.poll(ni.rank) {
            Some(off) if pad.buf_hdr(off).buf_type() == BufType::ShmemReturn => {
                pad.free_buf(off);
            }
            Some(off) => ni.stash.lock().unwrap().push_back(off),
            None => std::thread::yield_now(),
        }
    }
}

fn with_backpressure<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match f() {
            Err(PtlError::NoSpace) if Instant::now() < deadline => std::thread::yield_now(),
            other => return other,
        }
    }
}

/// Flush a connection's wait list into the send path, FIFO.
pub(crate) fn flush_parked(ni: &Arc<Ni>, conn: &Arc<Conn>) {
    for handle in conn.take_parked() {
        initiator::resume_parked(ni, handle);
    }
}

/// Fail a connection's wait list with `Undeliverable`.
pub(crate) fn fail_parked(ni: &Arc<Ni>, conn: &Arc<Conn>) {
    for handle in conn.take_parked() {
        initiator::fail_parked(ni, handle);
    }
}

/// Send the RDMA_DISC header as a normal send and walk the local
/// half of the disconnect handshake.
pub(crate) fn send_disconnect(ni: &Arc<Ni>, conn: &Arc<Conn>) {
    conn.disc_sent();

    // The dispatcher classifies DISC before the NI-kind check, so
    // the kind bits here are immaterial.
    let mut msg = Vec::with_capacity(16);
    CommonHdr::new(
        Op::Disc,
        ptl_protocol::NiKind::LogicalMatch,
        PktFmt::Inline,
        0,
    )
    .serialize(&mut msg);

    let Ok(buf_off) = alloc_buf_backpressure(ni) else {
        warn!("no buffer for disconnect");
        return;
    };

    let pad = &ni.gbl.pad;
    pad.buf_hdr(buf_off).set_buf_type(BufType::ShmemSend);
    // SAFETY: fresh buffer from our own pool.
    unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), pad.buf_data(buf_off), msg.len()) };

    match ni.transport.send_message(conn, buf_off, msg.len(), true) {
        Ok(crate::transport::Disposition::Completed) => {
            if conn.disc_send_complete() {
                conn.finish_disconnect();
            }
        }
        Ok(crate::transport::Disposition::Pending) => {}
        Err(e) => warn!("disconnect send failed: {e}"),
    }
}
