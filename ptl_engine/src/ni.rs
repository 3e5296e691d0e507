// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The network interface: the owner of every pool, the portal
//! table, the connection set and the progress thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::conn::{Conn, ConnState, TransportKind};
use crate::ct::{Ct, CtEvent};
use crate::eq::Eq;
use crate::event::Event;
use crate::initiator::Xi;
use crate::le::Le;
use crate::md::Md;
use crate::pool::{Handle, ObjTag, Pool};
use crate::pt::PortalTable;
use crate::target::Xt;
use crate::transport::{ShmemTransport, Transport};
use crate::{api, progress, Gbl, Peer, PhysId, PtlError, Result, NID_SELF};

/// Implementation limits, fixed at NI init. Pools are sized from
/// these; running out is `NoSpace`, never reallocation.
#[derive(Debug, Clone)]
pub struct NiLimits {
    pub max_entries: usize,
    pub max_mds: usize,
    pub max_cts: usize,
    pub max_eqs: usize,
    pub max_pt_index: usize,
    pub max_unexpected_headers: usize,
    pub max_triggered_ops: usize,
    pub max_inflight: usize,

    pub max_msg_size: u64,
    pub max_atomic_size: u64,
    pub max_waw_ordered_size: u64,
    pub max_war_ordered_size: u64,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_entries: 128,
            max_mds: 128,
            max_cts: 64,
            max_eqs: 16,
            max_pt_index: 64,
            max_unexpected_headers: 128,
            max_triggered_ops: 256,
            max_inflight: 512,
            max_msg_size: 1 << 30,
            max_atomic_size: 512,
            max_waw_ordered_size: 1 << 30,
            max_war_ordered_size: 1 << 30,
        }
    }
}

/// NI flavor and identity.
#[derive(Debug, Clone)]
pub struct NiOptions {
    /// Matching or non-matching portal semantics.
    pub matching: bool,

    /// Logical (rank) or physical `(nid, pid)` addressing.
    pub logical: bool,

    /// The comm-pad rank this NI claims as its receive identity.
    pub rank: u32,

    /// Published pid; 0 picks `rank + 1`.
    pub pid: u32,
}

impl NiOptions {
    pub fn matching_logical(rank: u32) -> Self {
        Self {
            matching: true,
            logical: true,
            rank,
            pid: 0,
        }
    }

    pub fn matching_physical(rank: u32, pid: u32) -> Self {
        Self {
            matching: true,
            logical: false,
            rank,
            pid,
        }
    }
}

pub struct Ni {
    pub(crate) index: u8,
    pub gbl: Arc<Gbl>,
    pub options: NiOptions,
    pub limits: NiLimits,

    /// Our claimed comm-pad rank and published identity.
    pub rank: u32,
    pub phys: PhysId,

    pub(crate) md_pool: Pool<Md>,
    pub(crate) le_pool: Pool<Le>,
    pub(crate) ct_pool: Pool<Ct>,
    pub(crate) eq_pool: Pool<Eq>,
    pub(crate) xi_pool: Pool<Xi>,
    pub(crate) xt_pool: Pool<Xt>,

    pub(crate) pt: PortalTable,

    pub(crate) transport: Box<dyn Transport>,

    /// Logical rank → physical identity, installed by `set_map`.
    map: Mutex<Option<Vec<PhysId>>>,

    /// Dense per-rank connections (logical NIs).
    conns_rank: Mutex<Vec<Option<Arc<Conn>>>>,

    /// Physical-peer tree, ordered lexicographically by `(nid,
    /// pid)`.
    conns_phys: Mutex<BTreeMap<PhysId, Arc<Conn>>>,

    /// Identity of the progress thread, so the buffer allocator can
    /// tell whether it runs on the queue's one consumer.
    pub(crate) progress_id: Mutex<Option<std::thread::ThreadId>>,

    /// Fragments the progress thread dequeued early while hunting
    /// for buffer returns; consumed, in order, before the queue.
    /// Progress thread only.
    pub(crate) stash: Mutex<std::collections::VecDeque<u32>>,

    /// Verbs-side state (device context, PD, CQ, SRQ); populated on
    /// first RDMA use.
    #[cfg(feature = "rdma")]
    pub(crate) rdma: Mutex<Option<crate::rdma::RdmaNi>>,

    /// Two-phase shutdown flag; the progress thread drains while
    /// this is false.
    pub(crate) catcher_stop: AtomicBool,

    progress: Mutex<Option<std::thread::JoinHandle<()>>>,

    pub num_recv_drops: AtomicU64,
    pub num_recv_errs: AtomicU64,
}

impl std::fmt::Debug for Ni {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Ni")
            .field("index", &self.index)
            .field("rank", &self.rank)
            .field("phys", &self.phys)
            .finish_non_exhaustive()
    }
}

impl Ni {
    /// Bring up an NI: claim the rank, size the pools, start the
    /// progress thread.
    pub fn init(gbl: &Arc<Gbl>, options: NiOptions, limits: NiLimits) -> Result<Arc<Ni>> {
        if options.rank >= gbl.nranks() {
            return Err(PtlError::ArgInvalid);
        }

        let pid = if options.pid == 0 {
            options.rank + 1
        } else {
            options.pid
        };
        gbl.pad.claim_rank(options.rank, NID_SELF, pid)?;

        let mut nis = gbl.nis.lock().unwrap();
        let Some(index) = nis.iter().position(|slot| slot.is_none()) else {
            gbl.pad.release_rank(options.rank);
            return Err(PtlError::NoSpace);
        };
        let index = index as u8;

        let nranks = gbl.nranks() as usize;
        let ni = Arc::new(Ni {
            index,
            gbl: gbl.clone(),
            rank: options.rank,
            phys: PhysId {
                nid: NID_SELF,
                pid,
            },
            md_pool: Pool::new("md", index, limits.max_mds),
            le_pool: Pool::new("le", index, limits.max_entries),
            ct_pool: Pool::new("ct", index, limits.max_cts),
            eq_pool: Pool::new("eq", index, limits.max_eqs),
            xi_pool: Pool::new("xi", index, limits.max_inflight),
            xt_pool: Pool::new("xt", index, limits.max_inflight),
            pt: PortalTable::new(limits.max_pt_index),
            transport: Box::new(ShmemTransport::new(gbl.clone())),
            map: Mutex::new(None),
            conns_rank: Mutex::new(vec![None; nranks]),
            conns_phys: Mutex::new(BTreeMap::new()),
            progress_id: Mutex::new(None),
            stash: Mutex::new(std::collections::VecDeque::new()),
            #[cfg(feature = "rdma")]
            rdma: Mutex::new(None),
            catcher_stop: AtomicBool::new(false),
            progress: Mutex::new(None),
            num_recv_drops: AtomicU64::new(0),
            num_recv_errs: AtomicU64::new(0),
            options,
            limits,
        });

        nis[index as usize] = Some(ni.clone());
        drop(nis);

        let thread = {
            let ni = ni.clone();
            std::thread::Builder::new()
                .name(format!("ptl-progress-{}", ni.rank))
                .spawn(move || progress::run(&ni))
                .map_err(|_| PtlError::Fail)?
        };
        *ni.progress.lock().unwrap() = Some(thread);

        debug!("NI {} up: rank {}, pid {}", index, ni.rank, ni.phys.pid);
        Ok(ni)
    }

    pub fn handle(&self) -> Handle {
        Handle::new(ObjTag::Ni, self.index, 0, self.index as u32)
    }

    // Addressing -------------------------------------------------

    /// Install the logical rank → physical identity map.
    pub fn set_map(&self, map: Vec<PhysId>) -> Result<()> {
        if !self.options.logical || map.len() > self.gbl.nranks() as usize {
            return Err(PtlError::ArgInvalid);
        }
        *self.map.lock().unwrap() = Some(map);
        Ok(())
    }

    pub fn get_map(&self) -> Result<Vec<PhysId>> {
        self.map
            .lock()
            .unwrap()
            .clone()
            .ok_or(PtlError::ArgInvalid)
    }

    /// Resolve a destination to `(comm-pad rank, physical id)`.
    fn resolve(&self, peer: Peer) -> Result<(u32, PhysId)> {
        match peer {
            Peer::Rank(r) => {
                if !self.options.logical {
                    return Err(PtlError::ArgInvalid);
                }

                let map = self.map.lock().unwrap();
                let phys = match map.as_ref() {
                    Some(map) => *map.get(r as usize).ok_or(PtlError::ArgInvalid)?,
                    None => {
                        // Identity map: rank r is comm-pad rank r.
                        drop(map);
                        let (nid, pid) = self.gbl.pad.rank_identity(r);
                        if nid == 0 {
                            return Err(PtlError::ArgInvalid);
                        }
                        return Ok((r, PhysId { nid, pid }));
                    }
                };

                let rank = self
                    .gbl
                    .pad
                    .lookup_phys(phys.nid, phys.pid)
                    .ok_or(PtlError::ArgInvalid)?;
                Ok((rank, phys))
            }
            Peer::Phys(phys) => {
                if self.options.logical {
                    return Err(PtlError::ArgInvalid);
                }
                let rank = self
                    .gbl
                    .pad
                    .lookup_phys(phys.nid, phys.pid)
                    .ok_or(PtlError::ArgInvalid)?;
                Ok((rank, phys))
            }
        }
    }

    /// Find or lazily create the connection for `peer`.
    pub(crate) fn get_conn(&self, peer: Peer) -> Result<Arc<Conn>> {
        let (rank, phys) = self.resolve(peer)?;

        if self.options.logical {
            let mut conns = self.conns_rank.lock().unwrap();
            let slot = conns.get_mut(rank as usize).ok_or(PtlError::ArgInvalid)?;
            Ok(slot
                .get_or_insert_with(|| {
                    Arc::new(Conn::new(rank, phys, TransportKind::Shmem))
                })
                .clone())
        } else {
            let mut conns = self.conns_phys.lock().unwrap();
            Ok(conns
                .entry(phys)
                .or_insert_with(|| Arc::new(Conn::new(rank, phys, TransportKind::Shmem)))
                .clone())
        }
    }

    /// Target-side connection lookup: the peer is already resolved
    /// to a comm-pad rank and identity (from the arriving buffer),
    /// so no map translation applies.
    pub(crate) fn get_conn_raw(&self, rank: u32, phys: PhysId) -> Arc<Conn> {
        let conn = if self.options.logical {
            let mut conns = self.conns_rank.lock().unwrap();
            let slot = &mut conns[rank as usize];
            slot.get_or_insert_with(|| Arc::new(Conn::new(rank, phys, TransportKind::Shmem)))
                .clone()
        } else {
            let mut conns = self.conns_phys.lock().unwrap();
            conns
                .entry(phys)
                .or_insert_with(|| Arc::new(Conn::new(rank, phys, TransportKind::Shmem)))
                .clone()
        };

        // A shared-memory conn needs no handshake; the reply path
        // must not park.
        if conn.kind == TransportKind::Shmem {
            conn.connect_immediate();
        }
        conn
    }

    /// Find the connection whose peer claimed comm-pad rank `rank`,
    /// if one exists yet. The receive path uses this: on shared
    /// memory the arriving buffer's owner rank names the sender.
    pub(crate) fn conn_by_pad_rank(&self, rank: u32) -> Option<Arc<Conn>> {
        if let Some(conn) = self
            .conns_rank
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|c| c.peer_rank == rank)
        {
            return Some(conn.clone());
        }

        self.conns_phys
            .lock()
            .unwrap()
            .values()
            .find(|c| c.peer_rank == rank)
            .cloned()
    }

    /// Bring a connection up. On shared memory there is no
    /// handshake: the transition is immediate and the wait list
    /// flushes right here.
    pub(crate) fn connect(self: &Arc<Self>, conn: &Arc<Conn>) -> Result<()> {
        match conn.kind {
            TransportKind::Shmem => {
                conn.connect_immediate();
                api::flush_parked(self, conn);
                Ok(())
            }
            #[cfg(feature = "rdma")]
            TransportKind::Rdma => crate::rdma::start_connect(self, conn),
        }
    }

    // Object helpers ---------------------------------------------

    /// Post an event to `eq`, silently dropping it when the handle
    /// is NONE (no queue attached) or stale (queue freed first).
    pub(crate) fn post_event(&self, eq: Handle, event: Event) {
        if eq.is_none() {
            return;
        }
        match self.eq_pool.to_obj(eq) {
            Ok(queue) => queue.post(event),
            Err(_) => trace!("event for stale eq dropped"),
        }
    }

    /// Bump a CT and dispatch whatever the bump fired. No engine
    /// lock is held while dispatching.
    pub(crate) fn ct_bump(self: &Arc<Self>, ct: Handle, inc: CtEvent) {
        if ct.is_none() {
            return;
        }
        let fired = match self.ct_pool.to_obj(ct) {
            Ok(ct) => ct.inc(inc),
            Err(_) => return,
        };

        for t in fired {
            api::dispatch_triggered(self, t.op);
        }
    }

    // Teardown ---------------------------------------------------

    /// Two-phase NI teardown: drain in-flight transactions,
    /// disconnect every peer, recall the buffers, stop the progress
    /// thread, check for leaks.
    pub fn fini(self: &Arc<Self>) -> Result<()> {
        debug!("NI {} fini", self.index);

        let deadline = Instant::now() + Duration::from_secs(5);
        let wait_for = |pred: &dyn Fn() -> bool, what: &str| {
            while !pred() {
                if Instant::now() > deadline {
                    warn!("fini: timed out waiting for {what}");
                    return false;
                }
                std::thread::yield_now();
            }
            true
        };

        // Phase one: let in-flight transactions finish.
        wait_for(
            &|| self.xi_pool.live() == 0 && self.xt_pool.live() == 0,
            "in-flight transactions",
        );

        // Fail anything still parked on a connection that never came
        // up.
        for conn in self.all_conns() {
            if !conn.is_connected() {
                api::fail_parked(self, &conn);
            }
        }

        // Graceful disconnect of every live connection.
        for conn in self.all_conns() {
            if conn.is_connected() && !conn.disc_started() {
                api::send_disconnect(self, &conn);
            }
        }
        wait_for(
            &|| {
                self.all_conns()
                    .iter()
                    .all(|c| c.state() == ConnState::Disconnected)
            },
            "disconnects",
        );

        // All our buffers home again.
        wait_for(
            &|| self.gbl.pad.free_count(self.rank) == crate::shm::BUFS_PER_RANK,
            "buffers",
        );

        // Stop and join the progress thread.
        self.catcher_stop.store(true, Ordering::Release);
        self.gbl.pad.wake(self.rank);
        if let Some(thread) = self.progress.lock().unwrap().take() {
            let _ = thread.join();
        }

        // Unblock any waiters so user threads see Interrupted
        // rather than hanging, and cancel whatever is still armed.
        self.eq_pool.for_each_live(|eq| eq.interrupt());
        self.ct_pool.for_each_live(|ct| {
            ct.interrupt();
            for t in ct.cancel_all() {
                api::release_triggered(self, &t.op);
            }
        });

        for (name, live) in [
            ("md", self.md_pool.live()),
            ("le", self.le_pool.live()),
            ("ct", self.ct_pool.live()),
            ("eq", self.eq_pool.live()),
            ("xi", self.xi_pool.live()),
            ("xt", self.xt_pool.live()),
        ] {
            if live != 0 {
                warn!("fini: {live} {name} object(s) still live");
            }
        }

        self.gbl.pad.release_rank(self.rank);
        self.gbl.nis.lock().unwrap()[self.index as usize] = None;

        Ok(())
    }

    fn all_conns(&self) -> Vec<Arc<Conn>> {
        let mut out: Vec<Arc<Conn>> = self
            .conns_rank
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect();
        out.extend(self.conns_phys.lock().unwrap().values().cloned());
        out
    }
}
