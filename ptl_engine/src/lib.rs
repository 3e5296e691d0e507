// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Portals message engine: one-sided Put/Get/Atomic/FetchAtomic/
//! Swap between the ranks of a job.
//!
//! The engine is organised around per-NI object pools addressed by
//! opaque 64-bit handles, a shared-memory comm pad carrying one
//! lock-free fragment queue per rank, and one progress thread per NI
//! that drains completions and drives the initiator and target state
//! machines. The verbs transport compiles behind the `rdma` feature;
//! the shared-memory transport is always present and carries the
//! whole engine between co-located peers.

pub mod api;
pub mod atomics;
pub mod conn;
pub mod ct;
pub mod eq;
pub mod event;
pub mod initiator;
pub mod le;
pub mod md;
pub mod nemesis;
pub mod ni;
pub mod param;
pub mod pool;
pub mod progress;
pub mod pt;
#[cfg(feature = "rdma")]
pub mod rdma;
pub mod shm;
pub mod target;
pub mod transport;

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::*;

pub use event::{Event, EventKind, NiFail};
pub use ni::{Ni, NiLimits, NiOptions};
pub use pool::Handle;

/// The stable return codes of the public API. `Ok(())` stands in for
/// `PTL_OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtlError {
    /// Catch-all internal failure.
    Fail,

    /// An argument failed validation; the call had no effect.
    ArgInvalid,

    /// The library (or the NI) has not been initialised.
    NoInit,

    /// A pool or table has no free slot left.
    NoSpace,

    /// The object is still referenced and cannot be torn down.
    InUse,

    /// The requested rank/pid identity is already bound by another
    /// NI.
    PidInUse,

    /// No event waiting in the queue.
    EqEmpty,

    /// Events were lost to queue overrun since the last read.
    EqDropped,

    /// `ct_poll` timed out with no counter reaching its threshold.
    CtNoneReached,

    /// A blocking wait was interrupted by teardown.
    Interrupted,
}

impl std::error::Error for PtlError {}

impl fmt::Display for PtlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Fail => "operation failed",
                Self::ArgInvalid => "invalid argument",
                Self::NoInit => "not initialised",
                Self::NoSpace => "out of space",
                Self::InUse => "object in use",
                Self::PidInUse => "pid already in use",
                Self::EqEmpty => "event queue empty",
                Self::EqDropped => "events dropped",
                Self::CtNoneReached => "no counter reached its threshold",
                Self::Interrupted => "interrupted",
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, PtlError>;

/// Physical peer identity. Orders lexicographically by `(nid, pid)`,
/// which is also the order the connect tie-break uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysId {
    pub nid: u32,
    pub pid: u32,
}

/// How an operation names its destination: by rank on a logical NI,
/// by `(nid, pid)` on a physical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Rank(u32),
    Phys(PhysId),
}

/// Node id every rank of the in-process/shared-memory job reports.
pub const NID_SELF: u32 = 1;

/// Options accepted by [`init`].
#[derive(Debug, Clone)]
pub struct GblOptions {
    /// Number of ranks sharing the comm pad.
    pub nranks: u32,

    /// Name for the posix shared-memory object backing the comm pad.
    /// `None` gives a process-private (but still `MAP_SHARED`)
    /// mapping, which is all a single-process job needs.
    pub shm_name: Option<String>,
}

impl Default for GblOptions {
    fn default() -> Self {
        Self {
            nranks: 2,
            shm_name: None,
        }
    }
}

/// Process-wide state: the comm pad, the NI table, the job-scoped
/// uid. Returned from [`init`] and handed (as an `Arc`) into every
/// NI.
pub struct Gbl {
    pub(crate) pad: shm::CommPad,
    pub(crate) params: param::Params,

    /// Cross-process copy helper; plain memcpy in-process, KNEM (or
    /// kin) between processes.
    pub(crate) copy: Box<dyn transport::CopyFacade>,

    /// Job-scoped user id stamped into every request header and
    /// checked against list entries at the target.
    pub uid: u32,

    /// NI slots; an NI's position here is the NI index carried in
    /// every handle it issues.
    pub(crate) nis: Mutex<Vec<Option<Arc<Ni>>>>,
}

/// Maximum NIs one process can hold; the handle format allows 256.
pub const MAX_NIS: usize = 16;

static GBL: Mutex<Option<Weak<Gbl>>> = Mutex::new(None);

/// Initialise the engine, or bump the reference on an existing
/// initialisation. The comm pad is created by the first caller and
/// attached by everyone else; when the last `Arc<Gbl>` drops the pad
/// is unmapped.
pub fn init(opts: GblOptions) -> Result<Arc<Gbl>> {
    let mut slot = GBL.lock().unwrap();

    if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
        trace!("init: joining existing global state");
        return Ok(existing);
    }

    if opts.nranks == 0 {
        return Err(PtlError::ArgInvalid);
    }

    let params = param::Params::from_env();
    let pad = shm::CommPad::create(&opts, &params)?;

    let gbl = Arc::new(Gbl {
        pad,
        params,
        copy: Box::new(transport::SameProcess),
        // SAFETY: getuid() has no failure modes.
        uid: unsafe { libc::getuid() },
        nis: Mutex::new((0..MAX_NIS).map(|_| None).collect()),
    });

    *slot = Some(Arc::downgrade(&gbl));

    debug!("engine initialised for {} ranks", opts.nranks);
    Ok(gbl)
}

impl Gbl {
    pub fn nranks(&self) -> u32 {
        self.pad.nranks()
    }

    /// Look an NI up by the NI-index field of one of its handles.
    pub fn ni_by_index(&self, index: u8) -> Result<Arc<Ni>> {
        let nis = self.nis.lock().unwrap();
        nis.get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or(PtlError::ArgInvalid)
    }
}
