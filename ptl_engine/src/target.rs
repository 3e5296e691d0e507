// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The target state machine: takes an incoming request from header
//! parse to data movement, events and the acknowledgement.
//!
//! On the shared-memory transport every data movement completes
//! inside the call, so one pass through [`process_request`] walks
//! the whole ladder; the verbs path parks in `Rdma` until its
//! outstanding work requests drain (`rdma_comp`).

use std::sync::{Arc, Mutex};

use log::*;
use ptl_protocol::atom::{AtomOp, AtomType, Operand};
use ptl_protocol::hdr::{self, AckHdr, ReqHdr};
use ptl_protocol::{CommonHdr, Data, Op, PktFmt, WireError};

use crate::atomics;
use crate::conn::Conn;
use crate::ct::CtEvent;
use crate::event::{Event, EventKind, NiFail};
use crate::le::{self, ListKind};
use crate::ni::Ni;
use crate::pool::{Handle, ObjTag, PoolObject, PoolRef};
use crate::pt::{self, MatchOutcome, PtState, UnexpectedHdr};
use crate::shm::BufType;
use crate::transport::{Disposition, DmaDir};
use crate::PhysId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XtFsm {
    #[default]
    Start,
    Drop,
    GetMatch,
    GetLength,
    WaitConn,
    Data,
    DataIn,
    DataOut,
    Rdma,
    AtomicDataIn,
    SwapDataIn,
    WaitRdmaDesc,
    SendAck,
    SendReply,
    CommEvent,
    OverflowEvent,
    Cleanup,
    Cleanup2,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct XtState {
    pub fsm: XtFsm,
    pub op: Op,
    pub req: ReqHdr,
    pub src_rank: u32,

    pub le: Handle,
    pub list: ListKind,
    pub moffset: u64,
    pub mlength: u64,
    pub auto_unlink: bool,

    pub ni_fail: NiFail,

    /// Outstanding transport work requests; the machine cannot leave
    /// `Rdma` until this is zero.
    pub rdma_comp: u32,
}

impl Default for XtState {
    fn default() -> Self {
        Self {
            fsm: XtFsm::Start,
            op: Op::Put,
            req: ReqHdr::default(),
            src_rank: 0,
            le: Handle::NONE,
            list: ListKind::Priority,
            moffset: 0,
            mlength: 0,
            auto_unlink: false,
            ni_fail: NiFail::Ok,
            rdma_comp: 0,
        }
    }
}

/// A target transaction. Pool-resident.
#[derive(Default)]
pub struct Xt {
    pub state: Mutex<XtState>,
}

impl PoolObject for Xt {
    const TAG: ObjTag = ObjTag::Xt;

    fn on_alloc(&self) {
        *self.state.lock().unwrap() = XtState::default();
    }
}

/// Everything parsed out of one request message.
struct Request {
    common: CommonHdr,
    req: ReqHdr,
    get_desc: Option<Data>,
    put_data: Option<Data>,
}

fn parse(common: CommonHdr, mut rest: &[u8]) -> std::result::Result<Request, WireError> {
    let req = ReqHdr::deserialize(&mut rest)?;

    let mut get_desc = None;
    let mut put_data = None;

    if matches!(common.op, Op::Get | Op::Fetch | Op::Swap) {
        get_desc = Some(Data::deserialize(&mut rest)?);
    }
    if matches!(common.op, Op::Put | Op::Atomic | Op::Fetch | Op::Swap) {
        put_data = Some(Data::deserialize(&mut rest)?);
    }

    Ok(Request {
        common,
        req,
        get_desc,
        put_data,
    })
}

/// Handle one incoming request. `payload` is the message after the
/// common header; `src_rank` is the sending rank (the buffer's owner
/// on shared memory).
pub(crate) fn process_request(ni: &Arc<Ni>, common: CommonHdr, payload: &[u8], src_rank: u32) {
    let request = match parse(common, payload) {
        Ok(r) => r,
        Err(e) => {
            debug!("dropping malformed request: {e}");
            ni.num_recv_drops
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
    };

    let Ok(xt) = ni.xt_pool.alloc() else {
        warn!("target transaction pool exhausted; dropping request");
        ni.num_recv_drops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return;
    };

    {
        let mut st = xt.state.lock().unwrap();
        st.op = request.common.op;
        st.req = request.req;
        st.src_rank = src_rank;
        st.fsm = XtFsm::GetMatch;
    }

    run(ni, &xt, &request);

    // Cleanup2: the request buffer goes home in the dispatcher;
    // dropping the guard releases the transaction itself.
    set_fsm(&xt, XtFsm::Cleanup2);
}

/// The ladder itself.
fn run(ni: &Arc<Ni>, xt: &PoolRef<'_, Xt>, request: &Request) {
    let req = &request.req;
    let op = request.common.op;
    let src_rank = src_rank_of(xt);
    let initiator = PhysId {
        nid: req.src_nid,
        pid: req.src_pid,
    };

    // A disabled PT drops everything; the first drop of the cycle
    // reports PT_DISABLED on the PT's queue.
    enum PtOutcome {
        Disabled { first_eq: Option<Handle> },
        Walked(MatchOutcome),
    }

    // GetMatch / GetLength: walk the lists under the PT lock. The
    // walk already advances the matched entry's offsets.
    let outcome = ni.pt.with(req.pt_index, |entry| {
        if entry.state != PtState::Enabled {
            let first_eq = (!entry.disabled_event_sent).then(|| {
                entry.disabled_event_sent = true;
                entry.eq
            });
            return PtOutcome::Disabled { first_eq };
        }

        PtOutcome::Walked(pt::match_request(
            entry,
            &ni.le_pool,
            op,
            req,
            src_rank,
            ni.options.matching,
        ))
    });

    let outcome = match outcome {
        Ok(PtOutcome::Walked(outcome)) => outcome,
        Ok(PtOutcome::Disabled { first_eq }) => {
            if let Some(eq) = first_eq {
                ni.post_event(
                    eq,
                    Event {
                        kind: EventKind::PtDisabled,
                        pt_index: req.pt_index,
                        ..Default::default()
                    },
                );
            }
            drop_request(ni, xt, req, op, NiFail::Dropped);
            return;
        }
        Err(_) => {
            // Bad portal index: protocol error, drop.
            drop_request(ni, xt, req, op, NiFail::Dropped);
            return;
        }
    };

    let (le_handle, list, moffset, mlength, auto_unlink) = match outcome {
        MatchOutcome::Matched {
            le,
            list,
            moffset,
            mlength,
            auto_unlink,
        } => (le, list, moffset, mlength, auto_unlink),
        MatchOutcome::PermFail(fail) => {
            perm_fail_event(ni, req, initiator, fail);
            drop_request(ni, xt, req, op, fail);
            return;
        }
        MatchOutcome::NoMatch => {
            no_match_event(ni, req, initiator, op);
            drop_request(ni, xt, req, op, NiFail::NoMatch);
            return;
        }
    };

    {
        let mut st = xt.state.lock().unwrap();
        st.fsm = XtFsm::GetLength;
        st.le = le_handle;
        st.list = list;
        st.moffset = moffset;
        st.mlength = mlength;
        st.auto_unlink = auto_unlink;
    }

    let Ok(entry) = ni.le_pool.to_obj(le_handle) else {
        // The walk held a reference; losing it here is a bug.
        panic!("matched entry vanished mid-transaction");
    };

    let (entry_start, entry_user_ptr, entry_options, entry_ct) = {
        let s = entry.state.lock().unwrap();
        (s.start, s.user_ptr, s.options, s.ct)
    };
    let dst = (entry_start + moffset as usize) as *mut u8;

    // Data: move the payload.
    {
        let mut st = xt.state.lock().unwrap();
        st.fsm = XtFsm::Data;
    }

    let conn = ni.get_conn_raw(src_rank, initiator);
    let mut reply_fail = NiFail::Ok;

    match op {
        Op::Put => {
            move_put_data(ni, xt, &conn, &entry, dst, mlength, request, &mut reply_fail)
        }
        Op::Get => {
            set_fsm(xt, XtFsm::DataOut);
            let desc = request.get_desc.as_ref().expect("get without descriptor");
            // SAFETY-adjacent: dst covers mlength bytes of the
            // matched entry.
            match ni.transport.post_tgt_dma(&conn, DmaDir::Out, dst, mlength as usize, desc) {
                Ok(Disposition::Completed) => {}
                Ok(Disposition::Pending) => set_fsm(xt, XtFsm::Rdma),
                Err(_) => reply_fail = NiFail::Undeliverable,
            }
        }
        Op::Atomic => {
            set_fsm(xt, XtFsm::AtomicDataIn);
            apply_atomic(ni, xt, &entry, dst, mlength, request, None, &mut reply_fail);
        }
        Op::Fetch | Op::Swap => {
            set_fsm(xt, XtFsm::SwapDataIn);
            let mut old = vec![0u8; mlength as usize];
            apply_atomic(
                ni,
                xt,
                &entry,
                dst,
                mlength,
                request,
                Some(&mut old),
                &mut reply_fail,
            );

            if reply_fail == NiFail::Ok {
                set_fsm(xt, XtFsm::DataOut);
                let desc = request.get_desc.as_ref().expect("fetch without descriptor");
                match ni.transport.post_tgt_dma(
                    &conn,
                    DmaDir::Out,
                    old.as_mut_ptr(),
                    mlength as usize,
                    desc,
                ) {
                    Ok(Disposition::Completed) => {}
                    Ok(Disposition::Pending) => set_fsm(xt, XtFsm::Rdma),
                    Err(_) => reply_fail = NiFail::Undeliverable,
                }
            }
        }
        _ => unreachable!("non-request op {op:?} reached the target"),
    }

    {
        let mut st = xt.state.lock().unwrap();
        st.ni_fail = reply_fail;
    }

    // CommEvent: the PT's queue hears about it, the entry's CT
    // counts it.
    let overflow = list == ListKind::Overflow;
    if overflow && reply_fail == NiFail::Ok {
        record_unexpected(ni, xt, req, op, initiator, dst as usize);
    }

    if entry_options & le::LE_EVENT_COMM_DISABLE == 0 {
        set_fsm(xt, if overflow { XtFsm::OverflowEvent } else { XtFsm::CommEvent });
        let eq = ni.pt.with(req.pt_index, |entry| entry.eq).unwrap_or(Handle::NONE);
        ni.post_event(
            eq,
            Event {
                kind: comm_event_kind(op, overflow),
                ni_fail: reply_fail,
                initiator,
                pt_index: req.pt_index,
                match_bits: req.match_bits,
                rlength: req.rlength,
                mlength,
                remote_offset: moffset,
                start: dst as usize,
                user_ptr: entry_user_ptr,
                hdr_data: req.hdr_data,
                handle: le_handle,
            },
        );
    }

    if entry_options & le::LE_EVENT_CT_COMM != 0 && !entry_ct.is_none() {
        let inc = if reply_fail != NiFail::Ok {
            CtEvent {
                success: 0,
                failure: 1,
            }
        } else if entry_options & le::LE_EVENT_CT_BYTES != 0 {
            CtEvent {
                success: mlength,
                failure: 0,
            }
        } else {
            CtEvent {
                success: 1,
                failure: 0,
            }
        };
        ni.ct_bump(entry_ct, inc);
    }

    // Auto-unlink after the data and comm event, per the ordering
    // contract.
    if auto_unlink {
        let eq = ni.pt.with(req.pt_index, |entry| entry.eq).unwrap_or(Handle::NONE);
        ni.post_event(
            eq,
            Event {
                kind: EventKind::AutoUnlink,
                pt_index: req.pt_index,
                user_ptr: entry_user_ptr,
                handle: le_handle,
                ..Default::default()
            },
        );
        // Drop the list's reference; the entry object survives only
        // through user handles from here.
        let _ = ni.le_pool.put_ref(le_handle);
    }

    drop(entry);

    // SendAck / SendReply.
    send_response(ni, xt, &conn, req, op, mlength, moffset, reply_fail, overflow);

    set_fsm(xt, XtFsm::Cleanup);
}

fn src_rank_of(xt: &PoolRef<'_, Xt>) -> u32 {
    xt.state.lock().unwrap().src_rank
}

fn set_fsm(xt: &PoolRef<'_, Xt>, fsm: XtFsm) {
    xt.state.lock().unwrap().fsm = fsm;
}

/// Put data: in-band bytes are copied straight in; descriptor forms
/// go through the transport's DMA path.
#[allow(clippy::too_many_arguments)]
fn move_put_data(
    ni: &Arc<Ni>,
    xt: &PoolRef<'_, Xt>,
    conn: &Arc<Conn>,
    _entry: &PoolRef<'_, crate::le::Le>,
    dst: *mut u8,
    mlength: u64,
    request: &Request,
    reply_fail: &mut NiFail,
) {
    set_fsm(xt, XtFsm::DataIn);

    match request.put_data.as_ref() {
        Some(Data::Inline(bytes)) => {
            let n = (mlength as usize).min(bytes.len());
            // SAFETY: dst covers mlength bytes of the matched entry;
            // truncation already clamped mlength.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, n) };
        }
        Some(desc) => {
            if request.common.pkt_fmt == PktFmt::Indirect {
                set_fsm(xt, XtFsm::WaitRdmaDesc);
            }
            match ni
                .transport
                .post_tgt_dma(conn, DmaDir::In, dst, mlength as usize, desc)
            {
                Ok(Disposition::Completed) => {}
                Ok(Disposition::Pending) => set_fsm(xt, XtFsm::Rdma),
                Err(_) => *reply_fail = NiFail::Undeliverable,
            }
        }
        None => *reply_fail = NiFail::Dropped,
    }
}

/// Atomic application under the entry's word lock. The operand data
/// always rides in-band.
#[allow(clippy::too_many_arguments)]
fn apply_atomic(
    ni: &Arc<Ni>,
    _xt: &PoolRef<'_, Xt>,
    entry: &PoolRef<'_, crate::le::Le>,
    dst: *mut u8,
    mlength: u64,
    request: &Request,
    old: Option<&mut [u8]>,
    reply_fail: &mut NiFail,
) {
    let req = &request.req;

    let (Ok(atom_op), Ok(atom_type)) = (
        AtomOp::from_u8(req.atom_op),
        AtomType::from_u8(req.atom_type),
    ) else {
        ni.num_recv_drops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *reply_fail = NiFail::OpViolation;
        return;
    };

    let Some(Data::Inline(bytes)) = request.put_data.as_ref() else {
        *reply_fail = NiFail::Dropped;
        return;
    };

    // SAFETY: dst covers mlength bytes of the matched entry, and the
    // word lock serialises concurrent atomics on it.
    let target = unsafe { std::slice::from_raw_parts_mut(dst, mlength as usize) };

    let _word = entry.word_lock.lock().unwrap();
    if atomics::apply(
        atom_op,
        atom_type,
        target,
        bytes,
        &Operand(req.operand),
        old,
    )
    .is_err()
    {
        *reply_fail = NiFail::OpViolation;
    }
}

/// Record the unexpected-message descriptor for a message captured
/// on the overflow list.
fn record_unexpected(
    ni: &Arc<Ni>,
    xt: &PoolRef<'_, Xt>,
    req: &ReqHdr,
    op: Op,
    initiator: PhysId,
    start: usize,
) {
    let st = xt.state.lock().unwrap();
    let unexpected = UnexpectedHdr {
        op,
        initiator,
        src_rank: st.src_rank,
        match_bits: req.match_bits,
        rlength: req.rlength,
        mlength: st.mlength,
        hdr_data: req.hdr_data,
        start,
        le: st.le,
    };
    drop(st);

    let max = ni.limits.max_unexpected_headers;
    let _ = ni.pt.with(req.pt_index, |entry| {
        if entry.unexpected.len() < max {
            entry.unexpected.push(unexpected);
        } else {
            warn!("unexpected-header list full; message will not be searchable");
        }
    });
}

fn comm_event_kind(op: Op, overflow: bool) -> EventKind {
    match (op, overflow) {
        (Op::Put, false) => EventKind::Put,
        (Op::Put, true) => EventKind::PutOverflow,
        (Op::Get, false) => EventKind::Get,
        (Op::Get, true) => EventKind::GetOverflow,
        (Op::Atomic, false) => EventKind::Atomic,
        (Op::Atomic, true) => EventKind::AtomicOverflow,
        (Op::Fetch, false) | (Op::Swap, false) => EventKind::FetchAtomic,
        (Op::Fetch, true) | (Op::Swap, true) => EventKind::FetchAtomicOverflow,
        _ => unreachable!(),
    }
}

/// The drop leg: count it, tell the PT's queue if it has one, and
/// still answer the initiator when it is waiting on us.
fn drop_request(ni: &Arc<Ni>, xt: &PoolRef<'_, Xt>, req: &ReqHdr, op: Op, fail: NiFail) {
    set_fsm(xt, XtFsm::Drop);
    ni.num_recv_drops
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let initiator = PhysId {
        nid: req.src_nid,
        pid: req.src_pid,
    };
    let conn = ni.get_conn_raw(src_rank_of(xt), initiator);
    send_response(ni, xt, &conn, req, op, 0, 0, fail, false);
}

fn no_match_event(ni: &Arc<Ni>, req: &ReqHdr, initiator: PhysId, _op: Op) {
    let eq = ni
        .pt
        .with(req.pt_index, |entry| entry.eq)
        .unwrap_or(Handle::NONE);
    ni.post_event(
        eq,
        Event {
            kind: EventKind::Dropped,
            ni_fail: NiFail::NoMatch,
            initiator,
            pt_index: req.pt_index,
            match_bits: req.match_bits,
            rlength: req.rlength,
            hdr_data: req.hdr_data,
            ..Default::default()
        },
    );
}

fn perm_fail_event(ni: &Arc<Ni>, req: &ReqHdr, initiator: PhysId, fail: NiFail) {
    let eq = ni
        .pt
        .with(req.pt_index, |entry| entry.eq)
        .unwrap_or(Handle::NONE);
    ni.post_event(
        eq,
        Event {
            kind: EventKind::Dropped,
            ni_fail: fail,
            initiator,
            pt_index: req.pt_index,
            match_bits: req.match_bits,
            rlength: req.rlength,
            hdr_data: req.hdr_data,
            ..Default::default()
        },
    );
}

/// Compose and send the ack or reply, honoring the requested ack
/// mode. Replies always go; acks only when asked for and the entry
/// does not suppress them.
#[allow(clippy::too_many_arguments)]
fn send_response(
    ni: &Arc<Ni>,
    xt: &PoolRef<'_, Xt>,
    conn: &Arc<Conn>,
    req: &ReqHdr,
    op: Op,
    mlength: u64,
    moffset: u64,
    fail: NiFail,
    overflow: bool,
) {
    let ack_suppressed = {
        let st = xt.state.lock().unwrap();
        match ni.le_pool.to_obj(st.le) {
            Ok(entry) => entry.state.lock().unwrap().options & le::LE_ACK_DISABLE != 0,
            Err(_) => false,
        }
    };

    let response_op = match op {
        Op::Get | Op::Fetch | Op::Swap => Op::Reply,
        _ => match req.ack_req {
            hdr::ACK_REQ_NONE => return,
            _ if ack_suppressed => return,
            hdr::ACK_REQ_ACK => Op::Ack,
            hdr::ACK_REQ_CT => Op::CtAck,
            hdr::ACK_REQ_OC => Op::OcAck,
            other => {
                debug!("unknown ack mode {other}; suppressing ack");
                return;
            }
        },
    };

    set_fsm(
        xt,
        if response_op == Op::Reply {
            XtFsm::SendReply
        } else {
            XtFsm::SendAck
        },
    );

    let mut msg = Vec::with_capacity(64);
    CommonHdr::new(
        response_op,
        ni_kind_of(ni),
        PktFmt::Inline,
        0, // shared memory moved reply data through the facade
    )
    .serialize(&mut msg);
    AckHdr {
        handle: req.handle,
        mlength,
        moffset,
        ni_fail: fail as u8,
        overflow: overflow as u8,
    }
    .serialize(&mut msg);

    let Ok(buf_off) = crate::api::alloc_buf_backpressure(ni) else {
        warn!("no buffer for response; initiator will stall");
        return;
    };

    let pad = &ni.gbl.pad;
    pad.buf_hdr(buf_off).set_buf_type(BufType::ShmemSend);
    // SAFETY: fresh buffer from our own free list, msg is tiny.
    unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), pad.buf_data(buf_off), msg.len()) };

    if ni.transport.send_message(conn, buf_off, msg.len(), false).is_err() {
        warn!("response send failed");
    }
}

fn ni_kind_of(ni: &Arc<Ni>) -> ptl_protocol::NiKind {
    match (ni.options.matching, ni.options.logical) {
        (false, false) => ptl_protocol::NiKind::PhysNoMatch,
        (true, false) => ptl_protocol::NiKind::PhysMatch,
        (false, true) => ptl_protocol::NiKind::LogicalNoMatch,
        (true, true) => ptl_protocol::NiKind::LogicalMatch,
    }
}

/// One of this transaction's transport work requests completed
/// (verbs path). Returns true when the machine may resume past
/// `Rdma`.
pub(crate) fn rdma_comp(xt: &Xt) -> bool {
    let mut st = xt.state.lock().unwrap();
    match st.rdma_comp.checked_sub(1) {
        Some(left) => {
            st.rdma_comp = left;
            left == 0
        }
        // A completion with none outstanding is a bug.
        None => panic!("rdma completion underflow in state {:?}", st.fsm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_event_kinds() {
        assert_eq!(comm_event_kind(Op::Put, false), EventKind::Put);
        assert_eq!(comm_event_kind(Op::Put, true), EventKind::PutOverflow);
        assert_eq!(comm_event_kind(Op::Swap, false), EventKind::FetchAtomic);
        assert_eq!(comm_event_kind(Op::Get, true), EventKind::GetOverflow);
    }

    #[test]
    fn rdma_comp_gate() {
        let xt = Xt::default();
        xt.state.lock().unwrap().rdma_comp = 2;

        assert!(!rdma_comp(&xt));
        assert!(rdma_comp(&xt));
    }

    #[test]
    #[should_panic(expected = "rdma completion underflow")]
    fn rdma_comp_underflow_is_fatal() {
        let xt = Xt::default();
        let _ = rdma_comp(&xt);
    }
}
