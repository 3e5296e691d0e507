// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The verbs transport: reliable-connected QPs brought up through
//! the RDMA CM, one completion queue and one shared receive queue
//! per NI. Compiled only with the `rdma` cargo feature; everything
//! transport-independent (state machines, matching, events, the
//! connect-race arbitration) lives outside this module and is
//! exercised without it.
//!
//! Work-request ids: sends carry the initiator transaction handle,
//! target DMA work requests carry the target transaction handle,
//! receives carry the index of the SRQ buffer.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::*;
use rdma_sys::*;

use crate::conn::{connect_race, Conn, ConnState, RaceDecision, RejectReason, MAX_CONN_RETRIES};
use crate::initiator;
use crate::ni::Ni;
use crate::pool::Handle;
use crate::progress::{classify, RecvState};
use crate::shm::{BufType, BUF_SIZE};
use crate::target;
use crate::transport::{Disposition, DmaDir, Transport};
use crate::{PhysId, PtlError, Result};

/// Receive buffers kept posted to the SRQ.
const SRQ_DEPTH: usize = 256;

/// Registered send buffers per NI.
const SEND_DEPTH: usize = 256;

/// Private payload on connect requests and rejects: a reason code
/// plus the initiating identity, so the passive side can arbitrate.
#[repr(C)]
#[derive(Clone, Copy)]
struct PrivData {
    reason: u8,
    _pad: [u8; 3],
    nid: u32,
    pid: u32,
}

impl PrivData {
    fn reason(reason: RejectReason) -> Self {
        Self {
            reason: reason as u8,
            _pad: [0; 3],
            nid: 0,
            pid: 0,
        }
    }
}

/// Per-NI verbs state.
pub(crate) struct RdmaNi {
    _ctx: *mut ibv_context,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    srq: *mut ibv_srq,
    channel: *mut rdma_event_channel,

    /// One registration covers the whole receive arena; `wr_id` on
    /// an SRQ post is a slot index into it.
    recv_arena: Box<[u8]>,
    recv_mr: *mut ibv_mr,
    free_recvs: Vec<u64>,

    /// Registered send arena, slot-indexed like the receive side.
    send_arena: Box<[u8]>,
    send_mr: *mut ibv_mr,
    free_sends: Vec<usize>,
}

// SAFETY: the verbs objects are opaque device handles; all access
// runs under the NI's rdma mutex or on the progress thread.
unsafe impl Send for RdmaNi {}
unsafe impl Sync for RdmaNi {}

/// Per-connection verbs binding.
pub(crate) struct ConnBinding {
    id: *mut rdma_cm_id,
    qp: *mut ibv_qp,

    /// Signalled-send bookkeeping for the completion threshold.
    sends_since_signal: AtomicU32,
    signal_threshold: AtomicU32,
}

// SAFETY: as for RdmaNi.
unsafe impl Send for ConnBinding {}
unsafe impl Sync for ConnBinding {}

impl ConnBinding {
    /// Whether this send carries IBV_SEND_SIGNALED, per the
    /// every-nth-doorbell rule.
    fn take_signal(&self, requested: bool) -> bool {
        if requested {
            self.sends_since_signal.store(0, Ordering::Relaxed);
            return true;
        }

        let n = self.signal_threshold.load(Ordering::Relaxed).max(1);
        let since = self.sends_since_signal.fetch_add(1, Ordering::Relaxed) + 1;
        if since >= n {
            self.sends_since_signal.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// Bring the device side up lazily: first device, PD, CQ, SRQ, both
/// registered arenas, and the initial SRQ fill.
fn ensure_rdma(ni: &Arc<Ni>) -> Result<()> {
    let mut guard = ni.rdma.lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }

    // SAFETY: straight verbs bring-up; every returned pointer is
    // checked before use.
    unsafe {
        let mut num = 0i32;
        let devices = ibv_get_device_list(&mut num);
        if devices.is_null() || num == 0 {
            error!("no RDMA devices");
            return Err(PtlError::Fail);
        }

        let ctx = ibv_open_device(*devices);
        ibv_free_device_list(devices);
        if ctx.is_null() {
            return Err(PtlError::Fail);
        }

        let pd = ibv_alloc_pd(ctx);
        if pd.is_null() {
            return Err(PtlError::Fail);
        }

        let cq = ibv_create_cq(
            ctx,
            (SRQ_DEPTH + SEND_DEPTH) as i32,
            ptr::null_mut(),
            ptr::null_mut(),
            0,
        );
        if cq.is_null() {
            return Err(PtlError::Fail);
        }

        let mut srq_attr: ibv_srq_init_attr = std::mem::zeroed();
        srq_attr.attr.max_wr = SRQ_DEPTH as u32;
        srq_attr.attr.max_sge = 1;
        let srq = ibv_create_srq(pd, &mut srq_attr);
        if srq.is_null() {
            return Err(PtlError::Fail);
        }

        let mut recv_arena = vec![0u8; SRQ_DEPTH * BUF_SIZE].into_boxed_slice();
        let recv_mr = ibv_reg_mr(
            pd,
            recv_arena.as_mut_ptr() as *mut libc::c_void,
            recv_arena.len(),
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32,
        );

        let mut send_arena = vec![0u8; SEND_DEPTH * BUF_SIZE].into_boxed_slice();
        let send_mr = ibv_reg_mr(
            pd,
            send_arena.as_mut_ptr() as *mut libc::c_void,
            send_arena.len(),
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32,
        );

        if recv_mr.is_null() || send_mr.is_null() {
            return Err(PtlError::Fail);
        }

        let mut state = RdmaNi {
            _ctx: ctx,
            pd,
            cq,
            srq,
            channel: rdma_create_event_channel(),
            recv_arena,
            recv_mr,
            free_recvs: (0..SRQ_DEPTH as u64).collect(),
            send_arena,
            send_mr,
            free_sends: (0..SEND_DEPTH).collect(),
        };
        repost_srq(&mut state, SRQ_DEPTH);

        *guard = Some(state);
    }

    Ok(())
}

/// Refill the SRQ from the free list, `batch` slots at a time.
fn repost_srq(state: &mut RdmaNi, batch: usize) {
    for _ in 0..batch {
        let Some(wr_id) = state.free_recvs.pop() else {
            return;
        };

        let mut sge = ibv_sge {
            addr: state.recv_arena.as_ptr() as u64 + wr_id * BUF_SIZE as u64,
            length: BUF_SIZE as u32,
            // SAFETY: recv_mr was registered at bring-up.
            lkey: unsafe { (*state.recv_mr).lkey },
        };

        // SAFETY: srq is live; wr and sge are stack-rooted for the
        // duration of the call.
        unsafe {
            let mut wr: ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad: *mut ibv_recv_wr = ptr::null_mut();
            if ibv_post_srq_recv(state.srq, &mut wr, &mut bad) != 0 {
                warn!("ibv_post_srq_recv failed");
                state.free_recvs.push(wr_id);
                return;
            }
        }
    }
}

/// Kick off the connect ladder. CM events drive it from here.
pub(crate) fn start_connect(ni: &Arc<Ni>, conn: &Arc<Conn>) -> Result<()> {
    ensure_rdma(ni)?;
    conn.set_state(ConnState::ResolvingAddr, false);

    let channel = {
        let guard = ni.rdma.lock().unwrap();
        guard.as_ref().expect("rdma state vanished").channel
    };

    // SAFETY: CM id creation against our event channel; the conn
    // pointer rides in the id's context for event dispatch and is
    // kept alive by the NI's connection table.
    unsafe {
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        if rdma_create_id(
            channel,
            &mut id,
            Arc::as_ptr(conn) as *mut libc::c_void,
            rdma_port_space::RDMA_PS_TCP,
        ) != 0
        {
            conn.set_state(ConnState::Disconnected, true);
            return Err(PtlError::Fail);
        }

        let mut dst = peer_sockaddr(conn.peer);
        if rdma_resolve_addr(
            id,
            ptr::null_mut(),
            &mut dst as *mut libc::sockaddr_in as *mut libc::sockaddr,
            ni.gbl.params.rdma_timeout_ms as i32,
        ) != 0
        {
            rdma_destroy_id(id);
            conn.set_state(ConnState::Disconnected, true);
            return Err(PtlError::Fail);
        }

        *conn.rdma.lock().unwrap() = Some(ConnBinding {
            id,
            qp: ptr::null_mut(),
            sends_since_signal: AtomicU32::new(0),
            signal_threshold: AtomicU32::new(1),
        });
    }

    Ok(())
}

fn peer_sockaddr(peer: PhysId) -> libc::sockaddr_in {
    // The nid doubles as an IPv4 address, the pid selects the port.
    // SAFETY: plain zeroed POD.
    let mut dst: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    dst.sin_family = libc::AF_INET as _;
    dst.sin_addr.s_addr = peer.nid.to_be();
    dst.sin_port = (0x6400u16 + peer.pid as u16).to_be();
    dst
}

/// Drain one CM event, stepping the owning connection's ladder.
fn poll_cm(ni: &Arc<Ni>) -> bool {
    let channel = {
        let guard = ni.rdma.lock().unwrap();
        match guard.as_ref() {
            Some(state) => state.channel,
            None => return false,
        }
    };

    // SAFETY: channel is live; the event is acked before return.
    unsafe {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        if rdma_get_cm_event(channel, &mut event) != 0 {
            return false;
        }
        let ev = &*event;

        match ev.event {
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => {
                let conn = conn_of(ev.id);
                conn.set_state(ConnState::ResolvingRoute, false);
                if rdma_resolve_route(ev.id, ni.gbl.params.rdma_timeout_ms as i32) != 0 {
                    retry_or_fail(ni, conn, ev.id);
                }
            }

            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => {
                let conn = conn_of(ev.id);
                conn.set_state(ConnState::Connecting, false);
                connect_qp(ni, conn, ev.id);
            }

            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                handle_connect_request(ni, ev);
            }

            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                let conn = conn_of(ev.id);
                if !conn.is_connected() {
                    conn.set_state(ConnState::Connected, false);
                }
                if let Some(conn) = ni.conn_by_pad_rank(conn.peer_rank) {
                    crate::api::flush_parked(ni, &conn);
                }
            }

            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => {
                let conn = conn_of(ev.id);
                if reject_reason(ev) == Some(RejectReason::Connecting) {
                    // Lost the race; the peer's crossing request
                    // carries this connection up instead.
                    debug!("connect crossed; waiting for peer's request");
                } else {
                    retry_or_fail(ni, conn, ev.id);
                }
            }

            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => {
                let conn = conn_of(ev.id);
                retry_or_fail(ni, conn, ev.id);
            }

            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                // The wire-level DISC header already ran the
                // graceful path; this is the CM echo.
                trace!("cm disconnect echo");
            }

            other => trace!("unhandled cm event {other}"),
        }

        rdma_ack_cm_event(event);
    }

    true
}

/// The conn behind a CM id (not valid for CONNECT_REQUEST events,
/// whose fresh id still carries the listener context).
///
/// SAFETY: the id was created with a conn pointer as context, and
/// the conn outlives the id via the NI's connection table.
unsafe fn conn_of<'a>(id: *mut rdma_cm_id) -> &'a Conn {
    &*((*id).context as *const Conn)
}

fn reject_reason(ev: &rdma_cm_event) -> Option<RejectReason> {
    // SAFETY: private data, when present, is a PrivData we (or a
    // peer speaking our protocol) put there.
    unsafe {
        let p = ev.param.conn.private_data;
        if p.is_null()
            || (ev.param.conn.private_data_len as usize) < std::mem::size_of::<PrivData>()
        {
            return None;
        }
        let d = *(p as *const PrivData);
        Some(match d.reason {
            0 => RejectReason::NoNi,
            1 => RejectReason::GoodSrq,
            2 => RejectReason::BadParam,
            3 => RejectReason::Connected,
            4 => RejectReason::Connecting,
            _ => RejectReason::Error,
        })
    }
}

/// Bounded retries; exhaustion drops the connection and fails its
/// wait list.
fn retry_or_fail(ni: &Arc<Ni>, conn: &Conn, id: *mut rdma_cm_id) {
    let tries = conn.retries.fetch_add(1, Ordering::AcqRel) + 1;

    if tries < MAX_CONN_RETRIES {
        debug!(
            "connect retry {tries} to ({},{})",
            conn.peer.nid, conn.peer.pid
        );
        let mut dst = peer_sockaddr(conn.peer);
        // SAFETY: id is the live CM id for this conn.
        unsafe {
            let _ = rdma_resolve_addr(
                id,
                ptr::null_mut(),
                &mut dst as *mut libc::sockaddr_in as *mut libc::sockaddr,
                ni.gbl.params.rdma_timeout_ms as i32,
            );
        }
        return;
    }

    warn!(
        "connect to ({},{}) failed after {tries} tries",
        conn.peer.nid, conn.peer.pid
    );
    conn.set_state(ConnState::Disconnected, true);

    if let Some(conn) = ni.conn_by_pad_rank(conn.peer_rank) {
        crate::api::fail_parked(ni, &conn);
    }
}

fn qp_attr(state: &RdmaNi) -> ibv_qp_init_attr {
    // SAFETY: plain zeroed POD.
    let mut attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
    attr.send_cq = state.cq;
    attr.recv_cq = state.cq;
    attr.srq = state.srq;
    attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    attr.cap.max_send_wr = SEND_DEPTH as u32;
    attr.cap.max_send_sge = 4;
    attr
}

/// Active side: create the QP on the resolved id and fire the
/// connect request with our identity in the private data.
fn connect_qp(ni: &Arc<Ni>, conn: &Conn, id: *mut rdma_cm_id) {
    let pd_attr = {
        let guard = ni.rdma.lock().unwrap();
        let state = guard.as_ref().expect("rdma state vanished");
        (state.pd, qp_attr(state))
    };
    let (pd, mut attr) = pd_attr;

    // SAFETY: id and pd are live; attr and param are stack-rooted.
    unsafe {
        if rdma_create_qp(id, pd, &mut attr) != 0 {
            retry_or_fail(ni, conn, id);
            return;
        }

        if let Some(binding) = conn.rdma.lock().unwrap().as_mut() {
            binding.qp = (*id).qp;
        }

        let priv_data = PrivData {
            reason: 0,
            _pad: [0; 3],
            nid: ni.phys.nid,
            pid: ni.phys.pid,
        };

        let mut param: rdma_conn_param = std::mem::zeroed();
        param.private_data = &priv_data as *const PrivData as *const libc::c_void;
        param.private_data_len = std::mem::size_of::<PrivData>() as u8;
        param.retry_count = MAX_CONN_RETRIES as u8;
        param.rnr_retry_count = 7;

        if rdma_connect(id, &mut param) != 0 {
            retry_or_fail(ni, conn, id);
        }
    }
}

/// Passive side, with the simultaneous-connect arbitration.
fn handle_connect_request(ni: &Arc<Ni>, ev: &rdma_cm_event) {
    // SAFETY: private data checked for size before the read.
    let peer = unsafe {
        let p = ev.param.conn.private_data;
        if p.is_null()
            || (ev.param.conn.private_data_len as usize) < std::mem::size_of::<PrivData>()
        {
            reject(ev.id, RejectReason::BadParam);
            return;
        }
        let d = *(p as *const PrivData);
        PhysId {
            nid: d.nid,
            pid: d.pid,
        }
    };

    let Some(rank) = ni.gbl.pad.lookup_phys(peer.nid, peer.pid) else {
        reject(ev.id, RejectReason::NoNi);
        return;
    };
    let conn = ni.get_conn_raw(rank, peer);

    if conn.is_connected() {
        reject(ev.id, RejectReason::Connected);
        return;
    }

    let local_connecting = matches!(
        conn.state(),
        ConnState::ResolvingAddr | ConnState::ResolvingRoute | ConnState::Connecting
    );

    match connect_race(ni.phys, peer, local_connecting) {
        RaceDecision::Reject(reason) => {
            debug!(
                "rejecting crossing connect from ({},{})",
                peer.nid, peer.pid
            );
            reject(ev.id, reason);
        }
        RaceDecision::Accept | RaceDecision::SelfAccept => accept(ni, &conn, ev.id),
    }
}

fn reject(id: *mut rdma_cm_id, reason: RejectReason) {
    let priv_data = PrivData::reason(reason);
    // SAFETY: id came from the connect-request event.
    unsafe {
        rdma_reject(
            id,
            &priv_data as *const PrivData as *const libc::c_void,
            std::mem::size_of::<PrivData>() as u8,
        );
    }
}

fn accept(ni: &Arc<Ni>, conn: &Arc<Conn>, id: *mut rdma_cm_id) {
    let (pd, mut attr) = {
        let guard = ni.rdma.lock().unwrap();
        let state = guard.as_ref().expect("rdma state vanished");
        (state.pd, qp_attr(state))
    };

    // SAFETY: as in connect_qp; the accepted id's context is pointed
    // at the conn for later event dispatch.
    unsafe {
        if rdma_create_qp(id, pd, &mut attr) != 0 {
            reject(id, RejectReason::Error);
            return;
        }

        (*id).context = Arc::as_ptr(conn) as *mut libc::c_void;
        *conn.rdma.lock().unwrap() = Some(ConnBinding {
            id,
            qp: (*id).qp,
            sends_since_signal: AtomicU32::new(0),
            signal_threshold: AtomicU32::new(1),
        });

        let mut param: rdma_conn_param = std::mem::zeroed();
        if rdma_accept(id, &mut param) != 0 {
            warn!("rdma_accept failed");
            return;
        }
    }

    if conn.state() < ConnState::Connecting {
        conn.set_state(ConnState::Connecting, false);
    }
}

/// What one drained completion asks of the engine, decided while
/// the rdma lock is held and executed after it is released.
enum Action {
    SendComp { handle: Handle, ok: bool },
    RdmaComp { handle: Handle },
    Packet { msg: Vec<u8> },
}

/// Poll CM events and the CQ; classify and dispatch. Returns whether
/// anything was drained.
pub(crate) fn poll_cq(ni: &Arc<Ni>, batch: usize) -> bool {
    let drained_cm = poll_cm(ni);

    let mut actions = Vec::new();
    {
        let mut guard = ni.rdma.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return drained_cm;
        };

        // SAFETY: cq is live and wcs has room for `batch` entries.
        let mut wcs: Vec<ibv_wc> = vec![unsafe { std::mem::zeroed() }; batch];
        let n = unsafe { ibv_poll_cq(state.cq, batch as i32, wcs.as_mut_ptr()) };
        if n <= 0 {
            return drained_cm;
        }

        for wc in &wcs[..n as usize] {
            let success = wc.status == ibv_wc_status::IBV_WC_SUCCESS;
            let buf_type = match wc.opcode {
                ibv_wc_opcode::IBV_WC_SEND => BufType::Send,
                ibv_wc_opcode::IBV_WC_RDMA_READ | ibv_wc_opcode::IBV_WC_RDMA_WRITE => BufType::Rdma,
                ibv_wc_opcode::IBV_WC_RECV => BufType::Recv,
                _ => BufType::Free,
            };

            match classify(success, buf_type) {
                RecvState::SendComp => actions.push(Action::SendComp {
                    handle: Handle(wc.wr_id),
                    ok: true,
                }),
                RecvState::SendCompError => {
                    ni.num_recv_errs.fetch_add(1, Ordering::Relaxed);
                    actions.push(Action::SendComp {
                        handle: Handle(wc.wr_id),
                        ok: false,
                    });
                }
                RecvState::RdmaComp => actions.push(Action::RdmaComp {
                    handle: Handle(wc.wr_id),
                }),
                RecvState::PacketRdma => {
                    // Copy-then-dispatch, same discipline as shared
                    // memory: the slot is back on the free list
                    // before any state machine runs.
                    let base = wc.wr_id as usize * BUF_SIZE;
                    let len = wc.byte_len as usize;
                    let msg = state.recv_arena[base..base + len].to_vec();
                    state.free_recvs.push(wc.wr_id);
                    actions.push(Action::Packet { msg });
                }
                RecvState::Error => {
                    ni.num_recv_errs.fetch_add(1, Ordering::Relaxed);
                }
                RecvState::DropBuf => {
                    ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let repost = ni.gbl.params.srq_repost_size;
        if state.free_recvs.len() >= repost {
            repost_srq(state, repost);
        }
    }

    for action in actions {
        match action {
            Action::SendComp { handle, ok } => initiator::send_comp(ni, handle, ok),
            Action::RdmaComp { handle } => {
                if let Ok(xt) = ni.xt_pool.to_obj(handle) {
                    // Resumption past Rdma is wired when the last
                    // outstanding WR drains.
                    let _resume = target::rdma_comp(&xt);
                }
            }
            Action::Packet { msg } => dispatch_packet(ni, &msg),
        }
    }

    true
}

fn dispatch_packet(ni: &Arc<Ni>, msg: &[u8]) {
    use ptl_protocol::{hdr::AckHdr, CommonHdr};

    let mut rest = msg;
    let Ok(common) = CommonHdr::deserialize(&mut rest) else {
        ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
        return;
    };

    if common.op.is_request() {
        // The sender's identity comes from the request header; the
        // pad-rank argument only matters for shared-memory routing.
        target::process_request(ni, common, rest, u32::MAX);
    } else if common.op.is_response() {
        if let Ok(ack) = AckHdr::deserialize(&mut rest) {
            let payload = &rest[..(common.length as usize).min(rest.len())];
            initiator::process_response(ni, &common, &ack, payload);
        }
    } else {
        ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
    }
}

/// The verbs implementation of the transport interface. Messages are
/// staged through the registered send arena; bulk data moves as RDMA
/// read/write work requests against the initiator's keys.
pub struct RdmaTransport {
    ni: std::sync::Weak<Ni>,
}

impl RdmaTransport {
    pub fn new(ni: std::sync::Weak<Ni>) -> Self {
        Self { ni }
    }
}

impl Transport for RdmaTransport {
    fn send_message(
        &self,
        conn: &Conn,
        buf_off: u32,
        len: usize,
        signalled: bool,
    ) -> Result<Disposition> {
        let ni = self.ni.upgrade().ok_or(PtlError::NoInit)?;
        let mut guard = ni.rdma.lock().unwrap();
        let state = guard.as_mut().ok_or(PtlError::NoInit)?;

        let binding = conn.rdma.lock().unwrap();
        let binding = binding.as_ref().ok_or(PtlError::Fail)?;

        let slot = state.free_sends.pop().ok_or(PtlError::NoSpace)?;
        let base = slot * BUF_SIZE;

        // Stage out of the comm-pad buffer into the registered
        // arena.
        let src = ni.gbl.pad.buf_data(buf_off);
        // SAFETY: both regions cover `len` bytes and are owned here.
        unsafe {
            std::ptr::copy_nonoverlapping(src, state.send_arena[base..].as_mut_ptr(), len);
        }
        ni.gbl.pad.free_buf(buf_off);

        let mut sge = ibv_sge {
            addr: state.send_arena.as_ptr() as u64 + base as u64,
            length: len as u32,
            // SAFETY: send_mr registered at bring-up.
            lkey: unsafe { (*state.send_mr).lkey },
        };

        // SAFETY: qp is live while the conn is connected; wr and sge
        // are stack-rooted for the call.
        unsafe {
            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.wr_id = slot as u64;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            if binding.take_signal(signalled) {
                wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            }

            let mut bad: *mut ibv_send_wr = ptr::null_mut();
            if ibv_post_send(binding.qp, &mut wr, &mut bad) != 0 {
                state.free_sends.push(slot);
                return Err(PtlError::Fail);
            }
        }

        Ok(Disposition::Pending)
    }

    fn post_tgt_dma(
        &self,
        conn: &Conn,
        dir: DmaDir,
        local: *mut u8,
        len: usize,
        remote: &ptl_protocol::Data,
    ) -> Result<Disposition> {
        let ni = self.ni.upgrade().ok_or(PtlError::NoInit)?;
        let guard = ni.rdma.lock().unwrap();
        let state = guard.as_ref().ok_or(PtlError::NoInit)?;

        let binding = conn.rdma.lock().unwrap();
        let binding = binding.as_ref().ok_or(PtlError::Fail)?;

        let ptl_protocol::Data::Rdma(desc) = remote else {
            // SGE lists and indirect descriptors are flattened by
            // the initiator before they reach a verbs target.
            return Err(PtlError::ArgInvalid);
        };

        let mut sge = ibv_sge {
            addr: local as u64,
            length: len as u32,
            // SAFETY: the entry's region was registered at bind.
            lkey: unsafe { (*state.recv_mr).lkey },
        };

        // SAFETY: as in send_message.
        unsafe {
            let mut wr: ibv_send_wr = std::mem::zeroed();
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = match dir {
                DmaDir::In => ibv_wr_opcode::IBV_WR_RDMA_READ,
                DmaDir::Out => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            };
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = desc.addr;
            wr.wr.rdma.rkey = desc.rkey;

            let mut bad: *mut ibv_send_wr = ptr::null_mut();
            if ibv_post_send(binding.qp, &mut wr, &mut bad) != 0 {
                return Err(PtlError::Fail);
            }
        }

        Ok(Disposition::Pending)
    }

    fn set_send_completion_threshold(&self, conn: &Conn, n: u32) {
        if let Some(binding) = conn.rdma.lock().unwrap().as_ref() {
            binding.signal_threshold.store(n.max(1), Ordering::Relaxed);
        }
    }
}
