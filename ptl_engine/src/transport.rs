// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The transport abstraction: what the state machines ask of the
//! wire, with a shared-memory implementation here and a verbs one
//! behind the `rdma` feature.

use std::sync::Arc;

use log::*;
use ptl_protocol::{Data, Sge};

use crate::conn::Conn;
use crate::{Gbl, PtlError, Result};

/// Direction of a target-side data movement, from the target's
/// point of view: `In` pulls initiator memory to the entry (Put /
/// Atomic operand data), `Out` pushes entry memory to the initiator
/// (Get data, fetched prior contents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDir {
    In,
    Out,
}

/// Whether the operation finished inside the call (shared memory)
/// or will complete later through the NI's completion source
/// (verbs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Pending,
}

pub trait Transport: Send + Sync {
    /// Post the composed message in `buf_off` (`len` bytes) toward
    /// `conn`'s peer. `signalled` requests a send completion; an
    /// unsignalled send on verbs piggybacks on the next signalled
    /// one.
    fn send_message(&self, conn: &Conn, buf_off: u32, len: usize, signalled: bool)
        -> Result<Disposition>;

    /// Move `len` bytes between `local` and the initiator-side
    /// region described by `remote`, on behalf of a target-side
    /// transaction.
    ///
    /// SAFETY-adjacent contract: `local` must cover `len` bytes that
    /// the caller owns for the duration of the call (or until the
    /// pending completion, on verbs).
    fn post_tgt_dma(
        &self,
        conn: &Conn,
        dir: DmaDir,
        local: *mut u8,
        len: usize,
        remote: &Data,
    ) -> Result<Disposition>;

    /// Ask for a CQ signal only every `n`th send on this connection,
    /// amortising the doorbell. Meaningless on shared memory.
    fn set_send_completion_threshold(&self, conn: &Conn, n: u32);
}

/// The opaque cross-process copy helper (KNEM in production). The
/// in-process implementation is plain memcpy; a cross-process one
/// maps cookies to region registrations.
pub trait CopyFacade: Send + Sync {
    /// `register(region) → cookie`.
    fn register(&self, addr: usize, len: usize) -> u64;

    fn deregister(&self, cookie: u64);

    /// Copy `len` bytes from the remote region `(cookie, src)` into
    /// `dst`.
    ///
    /// SAFETY: `dst` must cover `len` writable bytes; `(cookie,
    /// src)` must name a live registered region of at least `len`
    /// bytes.
    unsafe fn copy_in(&self, dst: *mut u8, cookie: u64, src: u64, len: usize);

    /// Copy `len` bytes from `src` into the remote region `(cookie,
    /// dst)`.
    ///
    /// SAFETY: as for `copy_in`, with directions swapped.
    unsafe fn copy_out(&self, src: *const u8, cookie: u64, dst: u64, len: usize);
}

/// Same-address-space copies: the cookie carries nothing.
pub struct SameProcess;

impl CopyFacade for SameProcess {
    fn register(&self, _addr: usize, _len: usize) -> u64 {
        0
    }

    fn deregister(&self, _cookie: u64) {}

    unsafe fn copy_in(&self, dst: *mut u8, _cookie: u64, src: u64, len: usize) {
        std::ptr::copy_nonoverlapping(src as usize as *const u8, dst, len);
    }

    unsafe fn copy_out(&self, src: *const u8, _cookie: u64, dst: u64, len: usize) {
        std::ptr::copy_nonoverlapping(src, dst as usize as *mut u8, len);
    }
}

/// The shared-memory transport: messages travel as comm-pad buffers
/// through the peer's fragment queue, bulk data moves through the
/// copy facade.
pub struct ShmemTransport {
    gbl: Arc<Gbl>,
}

impl ShmemTransport {
    pub fn new(gbl: Arc<Gbl>) -> Self {
        Self { gbl }
    }
}

impl Transport for ShmemTransport {
    fn send_message(
        &self,
        conn: &Conn,
        buf_off: u32,
        len: usize,
        _signalled: bool,
    ) -> Result<Disposition> {
        let pad = &self.gbl.pad;
        pad.buf_hdr(buf_off)
            .length
            .store(len as u32, std::sync::atomic::Ordering::Release);
        pad.deliver(conn.peer_rank, buf_off);

        // A shared-memory send is complete the moment it is on the
        // peer's queue.
        Ok(Disposition::Completed)
    }

    fn post_tgt_dma(
        &self,
        _conn: &Conn,
        dir: DmaDir,
        local: *mut u8,
        len: usize,
        remote: &Data,
    ) -> Result<Disposition> {
        let facade: &dyn CopyFacade = &*self.gbl.copy;

        match remote {
            Data::Inline(_) => {
                // In-band payloads never reach the DMA path.
                Err(PtlError::ArgInvalid)
            }
            Data::Sge(list) => {
                copy_sges(facade, dir, local, len, list);
                Ok(Disposition::Completed)
            }
            Data::Rdma(desc) => {
                let n = len.min(desc.length as usize);
                // SAFETY: the initiator described this region in its
                // request and keeps the MD bound until the reply.
                unsafe {
                    match dir {
                        DmaDir::In => facade.copy_in(local, desc.rkey as u64, desc.addr, n),
                        DmaDir::Out => facade.copy_out(local, desc.rkey as u64, desc.addr, n),
                    }
                }
                Ok(Disposition::Completed)
            }
            Data::Indirect { desc, count } => {
                // Fetch the real scatter list first, then run it.
                let mut raw = vec![0u8; *count as usize * 16];
                // SAFETY: as above; the indirect list lives in the
                // initiator's registered memory.
                unsafe {
                    facade.copy_in(raw.as_mut_ptr(), desc.rkey as u64, desc.addr, raw.len());
                }

                let mut rest = raw.as_slice();
                let mut list = Vec::with_capacity(*count as usize);
                for _ in 0..*count {
                    let mut sge = Sge::default();
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(&rest[..16]);
                    sge.addr = u64::from_le_bytes(bytes[..8].try_into().unwrap());
                    sge.length = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
                    sge.lkey = u32::from_le_bytes(bytes[12..].try_into().unwrap());
                    rest = &rest[16..];
                    list.push(sge);
                }

                copy_sges(facade, dir, local, len, &list);
                Ok(Disposition::Completed)
            }
        }
    }

    fn set_send_completion_threshold(&self, _conn: &Conn, _n: u32) {
        // Shared-memory sends always complete inline.
    }
}

/// Walk a scatter-gather list moving up to `len` bytes.
fn copy_sges(facade: &dyn CopyFacade, dir: DmaDir, local: *mut u8, len: usize, list: &[Sge]) {
    let mut moved = 0usize;

    for sge in list {
        if moved == len {
            break;
        }
        let n = (len - moved).min(sge.length as usize);

        // SAFETY: the initiator's request described these regions
        // and owns them until its transaction completes; `local` is
        // the caller's entry memory.
        unsafe {
            match dir {
                DmaDir::In => facade.copy_in(local.add(moved), sge.lkey as u64, sge.addr, n),
                DmaDir::Out => facade.copy_out(local.add(moved), sge.lkey as u64, sge.addr, n),
            }
        }
        moved += n;
    }

    if moved < len {
        warn!("scatter list short by {} bytes", len - moved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_process_copies() {
        let facade = SameProcess;
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];

        // SAFETY: both slices are live locals.
        unsafe { facade.copy_in(dst.as_mut_ptr(), 0, src.as_ptr() as u64, 4) };
        assert_eq!(dst, src);

        let mut dst2 = [0u8; 4];
        // SAFETY: as above.
        unsafe { facade.copy_out(src.as_ptr(), 0, dst2.as_mut_ptr() as u64, 4) };
        assert_eq!(dst2, src);
    }

    #[test]
    fn sge_walk_respects_lengths() {
        let facade = SameProcess;
        let a = [0xaau8; 8];
        let b = [0xbbu8; 8];
        let mut dst = [0u8; 12];

        let list = [
            Sge {
                addr: a.as_ptr() as u64,
                length: 8,
                lkey: 0,
            },
            Sge {
                addr: b.as_ptr() as u64,
                length: 8,
                lkey: 0,
            },
        ];

        // 12 bytes across a 8+8 list: the second element is cut.
        copy_sges(&facade, DmaDir::In, dst.as_mut_ptr(), 12, &list);
        assert_eq!(&dst[..8], &[0xaa; 8]);
        assert_eq!(&dst[8..], &[0xbb; 4]);
    }
}
