// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-peer connections.
//!
//! A connection is created lazily in `Disconnected` on the first
//! reference to a peer, walks the connect ladder, and carries a wait
//! list of transactions parked until it reaches `Connected`. State
//! never moves backwards except through the disconnect path; a
//! regression anywhere else is a bug and aborts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use log::*;

use crate::pool::Handle;
use crate::PhysId;

/// Which transport this connection is bound to. Kept as a plain tag
/// for diagnostics and match-based fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Shmem,
    #[cfg(feature = "rdma")]
    Rdma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Disconnected,
    ResolvingAddr,
    ResolvingRoute,
    Connecting,
    Connected,
    Disconnecting,
}

/// Reject reasons carried in the connect-request private payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    NoNi = 0,
    GoodSrq = 1,
    BadParam = 2,
    Connected = 3,
    Connecting = 4,
    Error = 5,
}

/// Outcome of receiving a connect request while we may ourselves be
/// connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceDecision {
    /// Accept the incoming request.
    Accept,

    /// Reject it; the peer keeps our own outstanding request.
    Reject(RejectReason),

    /// Loopback: a connection to ourselves takes the self-accept
    /// path.
    SelfAccept,
}

/// Arbitrate a simultaneous connect. Ids compare lexicographically
/// by `(nid, pid)`; the higher side accepts the lower side's request
/// and the lower side rejects with `Connecting`, so exactly one of
/// the two crossing requests survives.
pub fn connect_race(local: PhysId, remote: PhysId, local_connecting: bool) -> RaceDecision {
    if local == remote {
        return RaceDecision::SelfAccept;
    }

    if !local_connecting {
        return RaceDecision::Accept;
    }

    if local > remote {
        RaceDecision::Accept
    } else {
        RaceDecision::Reject(RejectReason::Connecting)
    }
}

/// Connect-step retries before the connection gives up and fails its
/// queued transactions.
pub const MAX_CONN_RETRIES: u32 = 3;

pub struct Conn {
    /// Comm-pad rank of the peer (resolved once at creation).
    pub peer_rank: u32,
    pub peer: PhysId,
    pub kind: TransportKind,

    state: Mutex<ConnState>,
    state_cv: Condvar,

    /// Transactions parked until the connection comes up
    /// (`wait_list_lock` in the original's terms).
    wait_list: Mutex<VecDeque<Handle>>,

    /// Disconnect handshake: 0 → 1 on sending/receiving the DISC
    /// header, local side reaches 2 on send completion.
    pub local_disc: AtomicU8,
    pub remote_disc: AtomicU8,

    pub retries: AtomicU32,

    /// CM id / QP binding while connected over verbs.
    #[cfg(feature = "rdma")]
    pub(crate) rdma: Mutex<Option<crate::rdma::ConnBinding>>,
}

impl Conn {
    pub fn new(peer_rank: u32, peer: PhysId, kind: TransportKind) -> Self {
        Self {
            peer_rank,
            peer,
            kind,
            state: Mutex::new(ConnState::Disconnected),
            state_cv: Condvar::new(),
            wait_list: Mutex::new(VecDeque::new()),
            local_disc: AtomicU8::new(0),
            remote_disc: AtomicU8::new(0),
            retries: AtomicU32::new(0),
            #[cfg(feature = "rdma")]
            rdma: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// Advance the state machine. Forward-only, except that the
    /// disconnect path (`Connected → Disconnecting → Disconnected`)
    /// and a failed connect (anything → `Disconnected`, with
    /// `failed = true`) may go back to the bottom.
    pub fn set_state(&self, next: ConnState, failed: bool) {
        let mut state = self.state.lock().unwrap();

        let legal = next > *state
            || (*state == ConnState::Disconnecting && next == ConnState::Disconnected)
            || (failed && next == ConnState::Disconnected);

        if !legal {
            // A regression outside the disconnect path is a bug, not
            // a condition.
            panic!("illegal connection transition {:?} -> {next:?}", *state);
        }

        trace!(
            "conn to ({},{}): {:?} -> {next:?}",
            self.peer.nid,
            self.peer.pid,
            *state
        );
        *state = next;
        drop(state);
        self.state_cv.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Handshake-free bring-up (shared memory). Idempotent: racing
    /// callers both land on `Connected`.
    pub fn connect_immediate(&self) {
        let mut state = self.state.lock().unwrap();
        if *state < ConnState::Connected {
            trace!(
                "conn to ({},{}): {:?} -> Connected",
                self.peer.nid,
                self.peer.pid,
                *state
            );
            *state = ConnState::Connected;
            drop(state);
            self.state_cv.notify_all();
        }
    }

    /// Park a transaction until the connection comes up. Flushed in
    /// FIFO order by [`Conn::take_parked`].
    pub fn park(&self, xi: Handle) {
        self.wait_list.lock().unwrap().push_back(xi);
    }

    /// Drain the wait list, in arrival order. Called on transition
    /// to `Connected` (flush into the send path) and on connect
    /// failure (fail each with `Undeliverable`).
    pub fn take_parked(&self) -> Vec<Handle> {
        self.wait_list.lock().unwrap().drain(..).collect()
    }

    pub fn parked(&self) -> usize {
        self.wait_list.lock().unwrap().len()
    }

    // Disconnect handshake ---------------------------------------

    /// Record that the DISC header was handed to the transport.
    pub fn disc_sent(&self) {
        let prev = self.local_disc.swap(1, Ordering::AcqRel);
        if prev != 0 {
            panic!("double disconnect on conn to ({},{})", self.peer.nid, self.peer.pid);
        }
        self.set_state(ConnState::Disconnecting, false);
    }

    /// Send completion for the DISC header. True when both sides of
    /// the handshake are finished and the transport binding can be
    /// torn down.
    pub fn disc_send_complete(&self) -> bool {
        self.local_disc.store(2, Ordering::Release);
        self.disc_finished()
    }

    /// Peer's DISC header arrived. Same return as
    /// [`Conn::disc_send_complete`].
    pub fn disc_received(&self) -> bool {
        let prev = self.remote_disc.swap(1, Ordering::AcqRel);
        if prev != 0 {
            panic!("peer disconnected twice on conn to ({},{})", self.peer.nid, self.peer.pid);
        }
        self.disc_finished()
    }

    fn disc_finished(&self) -> bool {
        self.local_disc.load(Ordering::Acquire) == 2
            && self.remote_disc.load(Ordering::Acquire) == 1
    }

    /// Both halves done: drop to `Disconnected` under the state
    /// lock.
    pub fn finish_disconnect(&self) {
        debug!(
            "conn to ({},{}) disconnected",
            self.peer.nid, self.peer.pid
        );
        self.set_state(ConnState::Disconnected, false);
    }

    /// Has the local side begun (or finished) disconnecting?
    pub fn disc_started(&self) -> bool {
        self.local_disc.load(Ordering::Acquire) != 0
    }
}
