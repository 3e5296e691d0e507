// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The shared comm pad.
//!
//! One segment per job, created by the first initialiser and
//! attached by everyone else. Layout: a header (magic, version,
//! geometry), one slot per rank (claim word, published identity,
//! fragment queue, process-shared mutex/condvar, buffer free list),
//! then each rank's buffer region. Everything inside the segment is
//! addressed by offsets from the base so the mapping address never
//! matters.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::*;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::nemesis::{NemesisQueue, QueueNode, NIL};
use crate::param::Params;
use crate::{GblOptions, PtlError, Result};

const MAGIC_READY: u32 = 0x70_74_6c_34; // "ptl4"
const SEG_VERSION: u32 = 1;

/// Whole buffer slot, header included.
pub const BUF_SIZE: usize = 4096;

/// Offset of the data area within a buffer slot.
pub const BUF_DATA_OFF: usize = 64;

/// Usable message bytes per buffer.
pub const BUF_DATA_CAP: usize = BUF_SIZE - BUF_DATA_OFF;

/// Buffers owned by each rank.
pub const BUFS_PER_RANK: usize = 256;

/// What a buffer is currently being used for. The receive
/// dispatcher keys off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufType {
    Free = 0,
    Send = 1,
    Recv = 2,
    Rdma = 3,
    Tgt = 4,
    ShmemSend = 5,
    ShmemReturn = 6,
}

impl BufType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Free,
            1 => Self::Send,
            2 => Self::Recv,
            3 => Self::Rdma,
            4 => Self::Tgt,
            5 => Self::ShmemSend,
            6 => Self::ShmemReturn,
            _ => return None,
        })
    }
}

/// Header at the front of every buffer slot. The queue node comes
/// first so a buffer offset is also a queue-node offset.
#[repr(C)]
pub struct BufHdr {
    pub node: QueueNode,
    pub owner_rank: u32,
    buf_type: AtomicU32,
    pub length: AtomicU32,
}

impl BufHdr {
    pub fn buf_type(&self) -> BufType {
        BufType::from_u32(self.buf_type.load(Ordering::Acquire))
            .expect("corrupt buffer type word")
    }

    pub fn set_buf_type(&self, t: BufType) {
        self.buf_type.store(t as u32, Ordering::Release);
    }
}

/// Process-shared pthread mutex + condvar pair, embedded per rank.
#[repr(C)]
struct PSync {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: the whole point of the type; the pthread objects are
// initialised PTHREAD_PROCESS_SHARED and carry their own exclusion.
unsafe impl Sync for PSync {}
unsafe impl Send for PSync {}

impl PSync {
    /// SAFETY: must be called exactly once per segment lifetime,
    /// before any lock/wait.
    unsafe fn init(&self) {
        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        libc::pthread_mutexattr_init(&mut mattr);
        libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutex_init(self.mutex.get(), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);

        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        libc::pthread_condattr_init(&mut cattr);
        libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_cond_init(self.cond.get(), &cattr);
        libc::pthread_condattr_destroy(&mut cattr);
    }

    fn lock(&self) {
        // SAFETY: initialised in CommPad::create before the segment
        // is published.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        assert_eq!(rc, 0, "pthread_mutex_lock: {rc}");
    }

    fn unlock(&self) {
        // SAFETY: lock is held by this thread.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.get()) };
        assert_eq!(rc, 0, "pthread_mutex_unlock: {rc}");
    }

    fn broadcast(&self) {
        // SAFETY: initialised as for lock().
        let rc = unsafe { libc::pthread_cond_broadcast(self.cond.get()) };
        assert_eq!(rc, 0, "pthread_cond_broadcast: {rc}");
    }

    /// Wait up to `timeout_ms`, mutex held. Spurious wakeups are the
    /// caller's problem, as usual.
    fn timedwait(&self, timeout_ms: u32) {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: plain clock read into a local.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let nsec = now.tv_nsec as i64 + i64::from(timeout_ms) * 1_000_000;
        let abstime = libc::timespec {
            tv_sec: now.tv_sec + (nsec / 1_000_000_000) as libc::time_t,
            tv_nsec: (nsec % 1_000_000_000) as _,
        };

        // SAFETY: mutex held by this thread.
        let rc = unsafe { libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &abstime) };
        assert!(rc == 0 || rc == libc::ETIMEDOUT, "pthread_cond_timedwait: {rc}");
    }
}

/// Per-rank slot in the segment header area.
#[repr(C)]
struct RankSlot {
    /// 0 while unclaimed; the claiming NI's pid once bound.
    claimed: AtomicU32,

    /// Published physical identity, for physical-NI lookup.
    nid: AtomicU32,
    pid: AtomicU32,

    _pad: u32,

    queue: NemesisQueue,
    sync: PSync,

    /// Buffer free list: `aba:32 | offset:32`, NIL-terminated
    /// through the buffers' queue-node links. Only the owner rank
    /// pushes and pops.
    free: AtomicU64,
}

#[repr(C)]
struct SegmentHdr {
    magic: AtomicU32,
    version: u32,
    nranks: u32,
    bufs_per_rank: u32,
    buf_region_off: u32,
}

fn round_up(v: usize, to: usize) -> usize {
    v.div_ceil(to) * to
}

/// The mapped segment plus the geometry needed to address into it.
pub struct CommPad {
    base: *mut u8,
    size: usize,
    nranks: u32,
    shm_name: Option<String>,
    created: bool,
}

// SAFETY: all mutation inside the segment goes through atomics or
// the process-shared pthread objects.
unsafe impl Send for CommPad {}
unsafe impl Sync for CommPad {}

const HDR_AREA: usize = 64;
const RANK_SLOT_SIZE: usize = 256;

impl CommPad {
    fn layout(nranks: u32) -> (usize, usize) {
        assert!(std::mem::size_of::<SegmentHdr>() <= HDR_AREA);
        assert!(std::mem::size_of::<RankSlot>() <= RANK_SLOT_SIZE);

        let buf_region_off = round_up(HDR_AREA + nranks as usize * RANK_SLOT_SIZE, BUF_SIZE);
        let total = buf_region_off + nranks as usize * BUFS_PER_RANK * BUF_SIZE;
        (buf_region_off, total)
    }

    /// Create (or, for a named pad that already exists, attach) the
    /// comm pad.
    pub fn create(opts: &GblOptions, _params: &Params) -> Result<Self> {
        let (buf_region_off, size) = Self::layout(opts.nranks);

        let (base, created) = match &opts.shm_name {
            None => (map_anonymous(size)?, true),
            Some(name) => map_named(name, size)?,
        };

        let pad = Self {
            base,
            size,
            nranks: opts.nranks,
            shm_name: opts.shm_name.clone(),
            created,
        };

        if created {
            pad.format(buf_region_off);
        } else {
            pad.wait_ready()?;
        }

        Ok(pad)
    }

    /// First-creator initialisation: header, rank slots, buffer free
    /// lists, then the magic word that publishes the segment.
    fn format(&self, buf_region_off: usize) {
        debug!(
            "formatting comm pad: {} ranks, {} bytes",
            self.nranks, self.size
        );

        {
            // SAFETY: creator-exclusive until the magic word
            // publishes the segment.
            let hdr = unsafe { &mut *(self.base as *mut SegmentHdr) };
            hdr.version = SEG_VERSION;
            hdr.nranks = self.nranks;
            hdr.bufs_per_rank = BUFS_PER_RANK as u32;
            hdr.buf_region_off = buf_region_off as u32;
        }

        for r in 0..self.nranks {
            let slot = self.rank_slot(r);
            slot.claimed.store(0, Ordering::Relaxed);
            slot.nid.store(0, Ordering::Relaxed);
            slot.pid.store(0, Ordering::Relaxed);
            slot.queue.init();
            // SAFETY: one-time init before publication.
            unsafe { slot.sync.init() };

            // Chain this rank's buffers into its free list:
            slot.free.store(u64::from(NIL), Ordering::Relaxed);
            for b in 0..BUFS_PER_RANK {
                let off = self.buf_off(r, b);
                // SAFETY: creator-exclusive, as above.
                let hdr = unsafe { &mut *(self.base.add(off as usize) as *mut BufHdr) };
                hdr.node.init();
                hdr.owner_rank = r;
                hdr.set_buf_type(BufType::Free);
                self.push_free(r, off);
            }
        }

        self.hdr_atomic_magic().store(MAGIC_READY, Ordering::Release);
    }

    fn wait_ready(&self) -> Result<()> {
        // The creator formats quickly; bounded spin is plenty.
        for _ in 0..1_000_000 {
            if self.hdr_atomic_magic().load(Ordering::Acquire) == MAGIC_READY {
                let hdr = self.hdr();
                if hdr.version != SEG_VERSION || hdr.nranks != self.nranks {
                    error!(
                        "comm pad mismatch: version {} nranks {}",
                        hdr.version, hdr.nranks
                    );
                    return Err(PtlError::Fail);
                }
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(PtlError::Fail)
    }

    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    fn hdr(&self) -> &SegmentHdr {
        // SAFETY: the header is immutable once the segment is
        // published.
        unsafe { &*(self.base as *const SegmentHdr) }
    }

    fn hdr_atomic_magic(&self) -> &AtomicU32 {
        // SAFETY: magic is the first word of the header.
        unsafe { &*(self.base as *const AtomicU32) }
    }

    fn rank_slot(&self, rank: u32) -> &RankSlot {
        assert!(rank < self.nranks);
        // SAFETY: in-bounds by layout(); RankSlot is all atomics and
        // process-shared pthread state.
        unsafe { &*(self.base.add(HDR_AREA + rank as usize * RANK_SLOT_SIZE) as *const RankSlot) }
    }

    fn buf_region_off(&self) -> usize {
        self.hdr().buf_region_off as usize
    }

    fn buf_off(&self, rank: u32, index: usize) -> u32 {
        (self.buf_region_off() + (rank as usize * BUFS_PER_RANK + index) * BUF_SIZE) as u32
    }

    pub fn buf_hdr(&self, off: u32) -> &BufHdr {
        debug_assert_eq!(
            (off as usize - self.buf_region_off()) % BUF_SIZE,
            0,
            "misaligned buffer offset"
        );
        // SAFETY: offset is a buffer slot inside the mapping.
        unsafe { &*(self.base.add(off as usize) as *const BufHdr) }
    }

    /// Raw data area of a buffer. The caller serialises access via
    /// buffer ownership (a buffer belongs to exactly one side at a
    /// time).
    pub fn buf_data(&self, off: u32) -> *mut u8 {
        // SAFETY: in-bounds, see buf_hdr().
        unsafe { self.base.add(off as usize + BUF_DATA_OFF) }
    }

    // Rank claiming ----------------------------------------------

    pub fn claim_rank(&self, rank: u32, nid: u32, pid: u32) -> Result<()> {
        let slot = self.rank_slot(rank);
        slot.claimed
            .compare_exchange(0, pid.max(1), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PtlError::PidInUse)?;
        slot.nid.store(nid, Ordering::Release);
        slot.pid.store(pid, Ordering::Release);
        Ok(())
    }

    pub fn release_rank(&self, rank: u32) {
        let slot = self.rank_slot(rank);
        slot.nid.store(0, Ordering::Release);
        slot.pid.store(0, Ordering::Release);
        slot.claimed.store(0, Ordering::Release);
    }

    /// Find the rank that published `(nid, pid)`, for physical
    /// addressing.
    pub fn lookup_phys(&self, nid: u32, pid: u32) -> Option<u32> {
        (0..self.nranks).find(|&r| {
            let slot = self.rank_slot(r);
            slot.claimed.load(Ordering::Acquire) != 0
                && slot.nid.load(Ordering::Acquire) == nid
                && slot.pid.load(Ordering::Acquire) == pid
        })
    }

    pub fn rank_identity(&self, rank: u32) -> (u32, u32) {
        let slot = self.rank_slot(rank);
        (
            slot.nid.load(Ordering::Acquire),
            slot.pid.load(Ordering::Acquire),
        )
    }

    // Buffer free lists ------------------------------------------

    fn push_free(&self, rank: u32, off: u32) {
        let slot = self.rank_slot(rank);
        let node = &self.buf_hdr(off).node;

        loop {
            let head = slot.free.load(Ordering::Acquire);
            node.set_next(head as u32);
            let new = ((head >> 32).wrapping_add(1) << 32) | u64::from(off);
            if slot
                .free
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop a free buffer belonging to `rank`. Only the owner rank
    /// calls this.
    pub fn alloc_buf(&self, rank: u32) -> Option<u32> {
        let slot = self.rank_slot(rank);

        loop {
            let head = slot.free.load(Ordering::Acquire);
            let off = head as u32;
            if off == NIL {
                return None;
            }

            let next = self.buf_hdr(off).node.next();
            let new = ((head >> 32).wrapping_add(1) << 32) | u64::from(next);
            if slot
                .free
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(off);
            }
        }
    }

    /// Return a buffer to its owner's free list (owner rank only;
    /// remote ranks route through [`CommPad::deliver`] with type
    /// `ShmemReturn` instead).
    pub fn free_buf(&self, off: u32) {
        let hdr = self.buf_hdr(off);
        hdr.set_buf_type(BufType::Free);
        self.push_free(hdr.owner_rank, off);
    }

    /// Free buffers currently on `rank`'s free list, for the
    /// teardown leak check.
    pub fn free_count(&self, rank: u32) -> usize {
        let mut n = 0;
        let mut off = self.rank_slot(rank).free.load(Ordering::Acquire) as u32;
        while off != NIL {
            n += 1;
            off = self.buf_hdr(off).node.next();
        }
        n
    }

    // Fragment delivery ------------------------------------------

    /// Hand the buffer at `off` to `rank`'s consumer.
    pub fn deliver(&self, rank: u32, off: u32) {
        let slot = self.rank_slot(rank);
        // SAFETY: off is a buffer slot; the buffer is owned by the
        // caller until this enqueue.
        unsafe { slot.queue.enqueue(self.base, off) };

        if slot.queue.has_sleeper() {
            slot.sync.lock();
            slot.sync.broadcast();
            slot.sync.unlock();
        }
    }

    /// Non-blocking poll of `rank`'s queue. Consumer thread only.
    pub fn poll(&self, rank: u32) -> Option<u32> {
        // SAFETY: single consumer guaranteed by rank claiming.
        unsafe { self.rank_slot(rank).queue.dequeue(self.base) }
    }

    /// Slow-path poll: advertise frustration, recheck, sleep
    /// briefly. Returns as soon as something arrives or the timeout
    /// lapses.
    pub fn poll_wait(&self, rank: u32, timeout_ms: u32) -> Option<u32> {
        let slot = self.rank_slot(rank);

        slot.sync.lock();
        slot.queue.sleeper_arrived();

        // Recheck after publishing the sleeper; pairs with the
        // producer's SeqCst tail exchange.
        let mut got = self.poll(rank);
        if got.is_none() {
            slot.sync.timedwait(timeout_ms);
            got = self.poll(rank);
        }

        slot.queue.sleeper_left();
        slot.sync.unlock();
        got
    }

    /// Kick `rank`'s consumer out of a blocking wait (teardown).
    pub fn wake(&self, rank: u32) {
        let slot = self.rank_slot(rank);
        slot.sync.lock();
        slot.sync.broadcast();
        slot.sync.unlock();
    }
}

impl Drop for CommPad {
    fn drop(&mut self) {
        // SAFETY: base/size are the live mapping; nothing in this
        // process touches it after Gbl drops.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };

        if self.created {
            if let Some(name) = &self.shm_name {
                let _ = nix::sys::mman::shm_unlink(name.as_str());
            }
        }
    }
}

fn map_anonymous(size: usize) -> Result<*mut u8> {
    // SAFETY: plain anonymous shared mapping; checked below.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_SHARED,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        error!("mmap: {}", std::io::Error::last_os_error());
        return Err(PtlError::Fail);
    }

    Ok(addr as *mut u8)
}

/// Open-or-create the named pad. Returns the mapping and whether we
/// are the creator (and therefore the formatter).
fn map_named(name: &str, size: usize) -> Result<(*mut u8, bool)> {
    use std::os::fd::AsRawFd;

    let mode = Mode::S_IRUSR | Mode::S_IWUSR;

    let (fd, created) =
        match nix::sys::mman::shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
            Ok(fd) => (fd, true),
            Err(nix::errno::Errno::EEXIST) => {
                let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, mode)
                    .map_err(|_| PtlError::Fail)?;
                (fd, false)
            }
            Err(e) => {
                error!("shm_open({name}): {e}");
                return Err(PtlError::Fail);
            }
        };

    if created {
        nix::unistd::ftruncate(&fd, size as libc::off_t).map_err(|_| PtlError::Fail)?;
    }

    // SAFETY: fd is a fresh shm object of at least `size` bytes.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        error!("mmap({name}): {}", std::io::Error::last_os_error());
        return Err(PtlError::Fail);
    }

    Ok((addr as *mut u8, created))
}
