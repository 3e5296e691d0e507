// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The initiator state machine: drives one user request from
//! composition to the completion events.
//!
//! Transitions are decided by small pure functions and executed by
//! the drivers in this module, so the decision table is testable on
//! its own. A connection fault fails the *transaction* with
//! `Undeliverable` and leaves any retrying to the connection layer;
//! the operation itself is never retried.

use std::sync::{Arc, Mutex};

use log::*;
use ptl_protocol::hdr::{self, ReqHdr};
use ptl_protocol::{CommonHdr, Data, NiKind, Op, PktFmt, Sge};

use crate::conn::{Conn, TransportKind};
use crate::ct::CtEvent;
use crate::event::{Event, EventKind, NiFail};
use crate::md;
use crate::ni::Ni;
use crate::pool::{Handle, ObjTag, PoolObject, PoolRef};
use crate::shm::{BufType, BUF_DATA_CAP};
#[cfg(feature = "rdma")]
use crate::transport::Disposition;
use crate::{Peer, PtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XiFsm {
    #[default]
    Start,
    PrepReq,
    WaitConn,
    SendReq,
    WaitComp,
    SendError,
    WaitRecv,
    DataIn,
    EarlySendEvent,
    LateSendEvent,
    AckEvent,
    ReplyEvent,
    Cleanup,
    Done,
}

/// What a transition asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XiEffect {
    /// Deliver the SEND event with `NiFail::Ok`.
    DeliverSend,

    /// Deliver the SEND event with `NiFail::Undeliverable`.
    FailSend,

    /// Park until the reply or ack arrives.
    AwaitResponse,

    /// Release the transaction and everything it holds.
    Free,
}

/// The decision at send completion: an expected
/// response parks the transaction after its early send event; no
/// expected response finishes it; a send error fails it.
pub(crate) fn after_send_comp(ok: bool, expects_response: bool) -> (XiFsm, &'static [XiEffect]) {
    if !ok {
        return (XiFsm::SendError, &[XiEffect::FailSend, XiEffect::Free]);
    }

    if expects_response {
        (
            XiFsm::WaitRecv,
            &[XiEffect::DeliverSend, XiEffect::AwaitResponse],
        )
    } else {
        (XiFsm::LateSendEvent, &[XiEffect::DeliverSend, XiEffect::Free])
    }
}

/// Which event a response turns into.
pub(crate) fn response_event_kind(op: Op) -> EventKind {
    match op {
        Op::Get | Op::Fetch | Op::Swap => EventKind::Reply,
        _ => EventKind::Ack,
    }
}

pub struct XiState {
    pub fsm: XiFsm,
    pub op: Op,

    pub target: Option<Peer>,
    pub pt_index: u32,
    pub match_bits: u64,
    pub hdr_data: u64,
    pub roffset: u64,
    pub rlength: u64,
    pub ack_req: u8,

    pub put_md: Handle,
    pub get_md: Handle,
    pub local_put_offset: u64,
    pub local_get_offset: u64,

    /// Residual byte counts; zero once each direction is satisfied.
    pub put_resid: u64,
    pub get_resid: u64,

    pub atom_op: u8,
    pub atom_type: u8,
    pub operand: [u8; 32],

    pub user_ptr: u64,
}

impl Default for XiState {
    fn default() -> Self {
        Self {
            fsm: XiFsm::Start,
            op: Op::Put,
            target: None,
            pt_index: 0,
            match_bits: 0,
            hdr_data: 0,
            roffset: 0,
            rlength: 0,
            ack_req: hdr::ACK_REQ_NONE,
            put_md: Handle::NONE,
            get_md: Handle::NONE,
            local_put_offset: 0,
            local_get_offset: 0,
            put_resid: 0,
            get_resid: 0,
            atom_op: 0,
            atom_type: 0,
            operand: [0; 32],
            user_ptr: 0,
        }
    }
}

/// An initiator transaction. Pool-resident; the wire holds one
/// reference from send until the response (or send completion, when
/// no response is expected).
#[derive(Default)]
pub struct Xi {
    pub state: Mutex<XiState>,
}

impl PoolObject for Xi {
    const TAG: ObjTag = ObjTag::Xi;

    fn on_alloc(&self) {
        *self.state.lock().unwrap() = XiState::default();
    }
}

impl Xi {
    fn expects_response(&self) -> bool {
        let st = self.state.lock().unwrap();
        matches!(st.op, Op::Get | Op::Fetch | Op::Swap) || st.ack_req != hdr::ACK_REQ_NONE
    }
}

/// Start a freshly composed transaction: acquire the connection,
/// park on it if it is still coming up, otherwise go straight to the
/// wire.
pub(crate) fn start(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>) -> Result<()> {
    let target = {
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::PrepReq;
        st.target.expect("transaction started with no target")
    };

    let conn = ni.get_conn(target)?;

    if !conn.is_connected() {
        // Park; the wait list holds a reference until the flush.
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::WaitConn;
        drop(st);

        xi.clone().forget();
        conn.park(xi.handle());

        if ni.connect(&conn).is_err() {
            // The failure is delivered as events on everything
            // parked, ourselves included.
            crate::api::fail_parked(ni, &conn);
        }
        return Ok(());
    }

    send_req(ni, xi, &conn)
}

/// Flush one parked transaction after its connection came up.
pub(crate) fn resume_parked(ni: &Arc<Ni>, handle: Handle) {
    let Ok(xi) = ni.xi_pool.to_obj(handle) else {
        warn!("parked transaction vanished");
        return;
    };

    let target = xi.state.lock().unwrap().target;
    let result = match target {
        Some(target) => match ni.get_conn(target) {
            Ok(conn) => send_req(ni, &xi, &conn),
            Err(e) => Err(e),
        },
        None => Err(PtlError::Fail),
    };

    if result.is_err() {
        fail(ni, &xi);
    }

    // Drop the wait list's reference.
    let _ = ni.xi_pool.put_ref(handle);
}

/// Fail a parked transaction whose connection never came up.
pub(crate) fn fail_parked(ni: &Arc<Ni>, handle: Handle) {
    if let Ok(xi) = ni.xi_pool.to_obj(handle) {
        fail(ni, &xi);
    }
    let _ = ni.xi_pool.put_ref(handle);
}

/// Compose the request message and hand it to the transport.
pub(crate) fn send_req(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>, conn: &Arc<Conn>) -> Result<()> {
    let msg = compose(ni, xi)?;
    assert!(msg.len() <= BUF_DATA_CAP, "request overruns a buffer");

    let buf_off = crate::api::alloc_buf_backpressure(ni)?;
    let pad = &ni.gbl.pad;
    pad.buf_hdr(buf_off).set_buf_type(BufType::ShmemSend);
    // SAFETY: the buffer was just popped from our own free list and
    // fits msg (asserted above).
    unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), pad.buf_data(buf_off), msg.len()) };

    {
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::WaitComp;
    }

    // The wire's reference: dropped at send completion (no response
    // expected) or when the response lands.
    xi.clone().forget();

    match conn.kind {
        // A shared-memory send completes at the enqueue and cannot
        // fail after the copy above. Run the completion half before
        // handing the buffer over, so the SEND event is in the queue
        // before the peer can possibly answer.
        TransportKind::Shmem => {
            send_comp(ni, xi.handle(), true);
            if let Err(e) = ni.transport.send_message(conn, buf_off, msg.len(), true) {
                warn!("shared-memory send failed: {e}");
            }
        }

        #[cfg(feature = "rdma")]
        TransportKind::Rdma => match ni.transport.send_message(conn, buf_off, msg.len(), true) {
            Ok(Disposition::Completed) => send_comp(ni, xi.handle(), true),
            Ok(Disposition::Pending) => {}
            Err(e) => {
                // Reported through the SEND event, not the return
                // code.
                debug!("send failed: {e}");
                send_comp(ni, xi.handle(), false);
            }
        },
    }

    Ok(())
}

/// Send-completion entry, from the transport (inline on shared
/// memory, via the CQ on verbs). Consumes the wire reference unless
/// the transaction now waits for a response.
pub(crate) fn send_comp(ni: &Arc<Ni>, handle: Handle, ok: bool) {
    let Ok(xi) = ni.xi_pool.to_obj(handle) else {
        warn!("send completion for unknown transaction");
        return;
    };

    let (next, effects) = after_send_comp(ok, xi.expects_response());
    {
        let mut st = xi.state.lock().unwrap();
        st.fsm = next;
    }

    for effect in effects {
        match effect {
            XiEffect::DeliverSend => deliver_send_event(ni, &xi, NiFail::Ok),
            XiEffect::FailSend => deliver_send_event(ni, &xi, NiFail::Undeliverable),
            XiEffect::AwaitResponse => {}
            XiEffect::Free => {
                release(ni, &xi);
                // Drop the wire reference; with the guard this is
                // the last one out.
                let _ = ni.xi_pool.put_ref(handle);
            }
        }
    }
}

/// A reply or ack arrived. The header was already copied out of the
/// receive buffer by the dispatcher, so nothing here can touch a
/// buffer that has been recycled under us.
pub(crate) fn process_response(
    ni: &Arc<Ni>,
    common: &CommonHdr,
    ack: &hdr::AckHdr,
    payload: &[u8],
) {
    let Ok(xi) = ni.xi_pool.to_obj(Handle(ack.handle)) else {
        warn!("response for stale transaction handle {:#x}", ack.handle);
        ni.num_recv_errs
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return;
    };

    let (op, get_md, local_get_offset, user_ptr) = {
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::DataIn;
        st.get_resid = st.rlength.saturating_sub(ack.mlength);
        (st.op, st.get_md, st.local_get_offset, st.user_ptr)
    };

    // Replies on the verbs path may carry the fetched bytes in-band;
    // on shared memory the target already wrote them through the
    // copy facade and the payload is empty.
    if common.op == Op::Reply && !payload.is_empty() {
        if let Ok(md) = ni.md_pool.to_obj(get_md) {
            let dst = md.get();
            let n = payload
                .len()
                .min(dst.length.saturating_sub(local_get_offset) as usize);
            // SAFETY: the MD's region is live while the MD is bound;
            // offset checked at submit time.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    (dst.start as *mut u8).add(local_get_offset as usize),
                    n,
                );
            }
        }
    }

    let ni_fail = NiFail::from_u8(ack.ni_fail);
    let kind = response_event_kind(op);
    {
        let mut st = xi.state.lock().unwrap();
        st.fsm = match kind {
            EventKind::Reply => XiFsm::ReplyEvent,
            _ => XiFsm::AckEvent,
        };
    }

    // Full event if the MD wants one, counting otherwise.
    if common.op != Op::OcAck {
        let md_handle = response_md(op, &xi);
        if let Ok(md) = ni.md_pool.to_obj(md_handle) {
            let m = md.get();
            if !m.eq.is_none() && (ni_fail != NiFail::Ok || m.options & md::MD_EVENT_SUCCESS_DISABLE == 0) {
                ni.post_event(
                    m.eq,
                    Event {
                        kind,
                        ni_fail,
                        mlength: ack.mlength,
                        remote_offset: ack.moffset,
                        user_ptr,
                        ..Default::default()
                    },
                );
            }

            let wants_ct = match kind {
                EventKind::Reply => m.options & md::MD_EVENT_CT_REPLY != 0,
                _ => m.options & md::MD_EVENT_CT_ACK != 0,
            } || common.op == Op::CtAck;

            if wants_ct && !m.ct.is_none() {
                let inc = if m.options & md::MD_EVENT_CT_BYTES != 0 {
                    CtEvent {
                        success: ack.mlength,
                        failure: 0,
                    }
                } else if ni_fail == NiFail::Ok {
                    CtEvent {
                        success: 1,
                        failure: 0,
                    }
                } else {
                    CtEvent {
                        success: 0,
                        failure: 1,
                    }
                };
                ni.ct_bump(m.ct, inc);
            }
        }
    }

    {
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::Cleanup;
    }

    release(ni, &xi);
    // The wire reference taken at send time.
    let _ = ni.xi_pool.put_ref(Handle(ack.handle));
}

/// Which MD a response event belongs to: replies land on the get
/// side, acks on the put side.
fn response_md(op: Op, xi: &PoolRef<'_, Xi>) -> Handle {
    let st = xi.state.lock().unwrap();
    match op {
        Op::Get => st.get_md,
        Op::Fetch | Op::Swap => st.get_md,
        _ => st.put_md,
    }
}

fn deliver_send_event(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>, ni_fail: NiFail) {
    let st = xi.state.lock().unwrap();
    let md_handle = if st.put_md.is_none() {
        st.get_md
    } else {
        st.put_md
    };
    let user_ptr = st.user_ptr;
    drop(st);

    let Ok(md) = ni.md_pool.to_obj(md_handle) else {
        return;
    };
    let m = md.get();

    if m.eq.is_none() {
        return;
    }
    if ni_fail == NiFail::Ok && m.options & md::MD_EVENT_SUCCESS_DISABLE != 0 {
        return;
    }

    ni.post_event(
        m.eq,
        Event {
            kind: EventKind::Send,
            ni_fail,
            user_ptr,
            ..Default::default()
        },
    );
}

/// Fail a transaction that never made it to the wire.
pub(crate) fn fail(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>) {
    {
        let mut st = xi.state.lock().unwrap();
        st.fsm = XiFsm::SendError;
    }
    deliver_send_event(ni, xi, NiFail::Undeliverable);
    release(ni, xi);
}

/// Drop the MD references the transaction holds. The caller drops
/// the transaction references themselves.
fn release(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>) {
    let mut st = xi.state.lock().unwrap();
    st.fsm = XiFsm::Done;
    let put_md = std::mem::replace(&mut st.put_md, Handle::NONE);
    let get_md = std::mem::replace(&mut st.get_md, Handle::NONE);
    drop(st);

    if !put_md.is_none() {
        let _ = ni.md_pool.put_ref(put_md);
    }
    if !get_md.is_none() {
        let _ = ni.md_pool.put_ref(get_md);
    }
}

/// Build the wire message for this transaction.
fn compose(ni: &Arc<Ni>, xi: &PoolRef<'_, Xi>) -> Result<Vec<u8>> {
    let st = xi.state.lock().unwrap();
    let max_inline = ni.gbl.params.max_inline as u64;

    let ni_kind = match (ni.options.matching, ni.options.logical) {
        (false, false) => NiKind::PhysNoMatch,
        (true, false) => NiKind::PhysMatch,
        (false, true) => NiKind::LogicalNoMatch,
        (true, true) => NiKind::LogicalMatch,
    };

    // Decide how the put-side payload travels.
    let put_inline = match st.op {
        Op::Put => st.rlength <= max_inline,
        Op::Atomic | Op::Fetch | Op::Swap => true,
        _ => false,
    };

    let (pkt_fmt, in_band) = match st.op {
        Op::Put if put_inline => (PktFmt::Inline, st.rlength),
        Op::Put => (PktFmt::Rdma, 0),
        Op::Atomic | Op::Fetch | Op::Swap => (PktFmt::Inline, st.rlength),
        Op::Get => (PktFmt::Rdma, 0),
        _ => return Err(PtlError::ArgInvalid),
    };

    let mut msg = Vec::with_capacity(256 + in_band as usize);
    CommonHdr::new(st.op, ni_kind, pkt_fmt, in_band).serialize(&mut msg);

    ReqHdr {
        src_nid: ni.phys.nid,
        src_pid: ni.phys.pid,
        uid: ni.gbl.uid,
        pt_index: st.pt_index,
        match_bits: st.match_bits,
        hdr_data: st.hdr_data,
        rlength: st.rlength,
        roffset: st.roffset,
        ack_req: st.ack_req,
        atom_op: st.atom_op,
        atom_type: st.atom_type,
        operand: st.operand,
        handle: xi.handle().0,
    }
    .serialize(&mut msg);

    // Get-side descriptor first, for the operations that fetch.
    if matches!(st.op, Op::Get | Op::Fetch | Op::Swap) {
        let md = ni.md_pool.to_obj(st.get_md)?;
        let m = md.get();
        Data::Sge(vec![Sge {
            addr: m.start as u64 + st.local_get_offset,
            length: st.rlength as u32,
            lkey: m.cookie as u32,
        }])
        .serialize(&mut msg);
    }

    // Put-side data second.
    if matches!(st.op, Op::Put | Op::Atomic | Op::Fetch | Op::Swap) {
        let md = ni.md_pool.to_obj(st.put_md)?;
        let m = md.get();

        if put_inline {
            let mut bytes = vec![0u8; st.rlength as usize];
            // SAFETY: validated at submit: the MD covers
            // [local_put_offset, local_put_offset + rlength).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (m.start as *const u8).add(st.local_put_offset as usize),
                    bytes.as_mut_ptr(),
                    st.rlength as usize,
                );
            }
            Data::Inline(bytes).serialize(&mut msg);
        } else {
            Data::Sge(vec![Sge {
                addr: m.start as u64 + st.local_put_offset,
                length: st.rlength as u32,
                lkey: m.cookie as u32,
            }])
            .serialize(&mut msg);
        }
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_comp_decision_table() {
        // Error: fail and free, whatever was expected.
        assert_eq!(
            after_send_comp(false, true),
            (XiFsm::SendError, &[XiEffect::FailSend, XiEffect::Free][..])
        );

        // Success with a response due: early send event, then park.
        assert_eq!(
            after_send_comp(true, true),
            (
                XiFsm::WaitRecv,
                &[XiEffect::DeliverSend, XiEffect::AwaitResponse][..]
            )
        );

        // Success, nothing coming back: send event and done.
        assert_eq!(
            after_send_comp(true, false),
            (
                XiFsm::LateSendEvent,
                &[XiEffect::DeliverSend, XiEffect::Free][..]
            )
        );
    }

    #[test]
    fn response_kinds() {
        assert_eq!(response_event_kind(Op::Get), EventKind::Reply);
        assert_eq!(response_event_kind(Op::Swap), EventKind::Reply);
        assert_eq!(response_event_kind(Op::Fetch), EventKind::Reply);
        assert_eq!(response_event_kind(Op::Put), EventKind::Ack);
        assert_eq!(response_event_kind(Op::Atomic), EventKind::Ack);
    }
}
