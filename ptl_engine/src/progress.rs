// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The receive / completion dispatcher: one progress thread per NI.
//!
//! The thread is the sole consumer of this rank's fragment queue
//! (and, on verbs, of the NI's completion queue). It classifies
//! whatever arrives and steps the target machine, the initiator's
//! receive side, or the disconnect half of the connection manager.
//! Messages are copied out of their buffer and the buffer routed
//! home *before* any state machine runs, so nothing downstream can
//! touch a recycled buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::*;
use ptl_protocol::{hdr::AckHdr, CommonHdr, NiKind, Op};

use crate::nemesis::{POLL_LIMIT, USE_HARD_POLLING};
use crate::ni::Ni;
use crate::shm::BufType;
use crate::{api, initiator, target};

/// What the dispatcher decided to do with one completion, straight
/// from the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Successful send completion: resume the initiator.
    SendComp,

    /// Failed send completion: resume the initiator with
    /// `NI_UNDELIVERABLE`.
    SendCompError,

    /// A target-side DMA work request finished.
    RdmaComp,

    /// Bytes arrived; parse a packet out of them.
    PacketRdma,

    /// A failed non-send completion: count and release.
    Error,

    /// Not worth interpreting: count and release.
    DropBuf,
}

/// The `(wc status, buffer type)` classification table.
pub fn classify(success: bool, buf_type: BufType) -> RecvState {
    match (success, buf_type) {
        (true, BufType::Send) => RecvState::SendComp,
        (true, BufType::Rdma) => RecvState::RdmaComp,
        (true, BufType::Recv) => RecvState::PacketRdma,
        (false, BufType::Send) => RecvState::SendCompError,
        (false, BufType::Rdma) => RecvState::Error,
        _ => RecvState::DropBuf,
    }
}

/// Where a parsed packet goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// A request: run the target machine.
    Req,

    /// A reply or ack: run the initiator's receive side.
    Init,

    /// The disconnect half of the connection manager.
    Disc,
}

pub fn classify_packet(op: Op) -> PacketClass {
    if op == Op::Disc {
        PacketClass::Disc
    } else if op.is_request() {
        PacketClass::Req
    } else {
        PacketClass::Init
    }
}

/// The progress loop. Runs until `catcher_stop` is raised *and* the
/// queue has drained.
pub(crate) fn run(ni: &Arc<Ni>) {
    let batch = ni.gbl.params.wc_count.max(1);
    let mut idle: u32 = 0;

    *ni.progress_id.lock().unwrap() = Some(std::thread::current().id());
    trace!("progress thread up for rank {}", ni.rank);

    loop {
        let mut did_work = false;

        #[cfg(feature = "rdma")]
        {
            did_work |= crate::rdma::poll_cq(ni, batch);
        }

        // Fragments pulled ahead of their turn by the buffer
        // allocator come first, to keep arrival order.
        loop {
            let stashed = ni.stash.lock().unwrap().pop_front();
            match stashed {
                Some(off) => {
                    handle_fragment(ni, off);
                    did_work = true;
                }
                None => break,
            }
        }

        for _ in 0..batch {
            match ni.gbl.pad.poll(ni.rank) {
                Some(off) => {
                    handle_fragment(ni, off);
                    did_work = true;
                }
                None => break,
            }
        }

        if did_work {
            idle = 0;
            continue;
        }

        if ni.catcher_stop.load(Ordering::Acquire) {
            break;
        }

        idle = idle.saturating_add(1);
        if USE_HARD_POLLING || idle < POLL_LIMIT {
            std::hint::spin_loop();
            if idle % 64 == 0 {
                std::thread::yield_now();
            }
            continue;
        }

        // Frustration path: advertise ourselves and sleep until a
        // producer signals (or the timeout re-checks the world).
        if let Some(off) = ni.gbl.pad.poll_wait(ni.rank, 50) {
            handle_fragment(ni, off);
            idle = 0;
        }
    }

    trace!("progress thread for rank {} done", ni.rank);
}

/// One fragment off the queue: route returns home, copy messages
/// out and dispatch them.
fn handle_fragment(ni: &Arc<Ni>, off: u32) {
    let pad = &ni.gbl.pad;
    let hdr = pad.buf_hdr(off);

    match hdr.buf_type() {
        BufType::ShmemReturn => pad.free_buf(off),

        BufType::ShmemSend => {
            let len = hdr.length.load(Ordering::Acquire) as usize;
            let src_rank = hdr.owner_rank;

            // Copy the message and send the buffer home before any
            // state machine sees it; a reply header is then never
            // read from memory the owner may already be reusing.
            let mut msg = vec![0u8; len];
            // SAFETY: the buffer is ours between dequeue and the
            // route-home below.
            unsafe { std::ptr::copy_nonoverlapping(pad.buf_data(off), msg.as_mut_ptr(), len) };

            if src_rank == ni.rank {
                pad.free_buf(off);
            } else {
                hdr.set_buf_type(BufType::ShmemReturn);
                pad.deliver(src_rank, off);
            }

            process_message(ni, &msg, src_rank);
        }

        other => {
            // A buffer type that has no business on this queue.
            warn!("unexpected buffer type {other:?} on rank {} queue", ni.rank);
            ni.num_recv_errs.fetch_add(1, Ordering::Relaxed);
            pad.free_buf(off);
        }
    }
}

fn process_message(ni: &Arc<Ni>, msg: &[u8], src_rank: u32) {
    let mut rest = msg;

    let common = match CommonHdr::deserialize(&mut rest) {
        Ok(c) => c,
        Err(e) => {
            debug!("dropping message from rank {src_rank}: {e}");
            ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match classify_packet(common.op) {
        PacketClass::Disc => handle_disc(ni, src_rank),

        PacketClass::Req => {
            if common.ni_kind != ni_kind(ni) {
                debug!("request for NI kind {:?} on {:?}", common.ni_kind, ni_kind(ni));
                ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            target::process_request(ni, common, rest, src_rank);
        }

        PacketClass::Init => {
            let ack = match AckHdr::deserialize(&mut rest) {
                Ok(a) => a,
                Err(e) => {
                    debug!("dropping malformed response: {e}");
                    ni.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let payload = &rest[..(common.length as usize).min(rest.len())];
            initiator::process_response(ni, &common, &ack, payload);
        }
    }
}

/// The receive half of graceful disconnect. The sender is known
/// from the buffer's owner rank.
fn handle_disc(ni: &Arc<Ni>, src_rank: u32) {
    let Some(conn) = ni.conn_by_pad_rank(src_rank) else {
        warn!("disconnect from unknown rank {src_rank}");
        return;
    };

    if conn.disc_received() {
        conn.finish_disconnect();
    } else if !conn.disc_started() {
        // The peer led; reciprocate.
        api::send_disconnect(ni, &conn);
    }
}

fn ni_kind(ni: &Arc<Ni>) -> NiKind {
    match (ni.options.matching, ni.options.logical) {
        (false, false) => NiKind::PhysNoMatch,
        (true, false) => NiKind::PhysMatch,
        (false, true) => NiKind::LogicalNoMatch,
        (true, true) => NiKind::LogicalMatch,
    }
}
