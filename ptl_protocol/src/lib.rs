// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire layer for the Portals message engine: the common header, the
//! operation-specific header tails, the data descriptors that ride in
//! requests, and the atomic operation tables.
//!
//! Nothing in this crate holds engine state; everything here can be
//! encoded, decoded and inspected standalone.

pub mod atom;
pub mod data;
pub mod hdr;

use std::fmt;

pub use atom::{AtomOp, AtomType, Operand};
pub use data::{Data, RdmaDesc, Sge};
pub use hdr::{AckHdr, CommonHdr, NiKind, PktFmt, ReqHdr};

/// Only supported version of the wire protocol.
pub const HDR_VERSION: u8 = 1;

/// The operations that can appear in the common header.
///
/// The numeric values matter: the receive dispatcher classifies a
/// packet as a request when `op <= Swap` and as initiator-bound when
/// `op >= Reply`, with `Disc` handled before either check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Op {
    Put = 0,
    Get = 1,
    Atomic = 2,
    Fetch = 3,
    Swap = 4,
    Reply = 5,
    Ack = 6,
    CtAck = 7,
    OcAck = 8,
    Disc = 9,
}

impl Op {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Put,
            1 => Self::Get,
            2 => Self::Atomic,
            3 => Self::Fetch,
            4 => Self::Swap,
            5 => Self::Reply,
            6 => Self::Ack,
            7 => Self::CtAck,
            8 => Self::OcAck,
            9 => Self::Disc,
            other => return Err(WireError::UnknownOp(other)),
        })
    }

    /// True for the five operations that a target must service.
    pub fn is_request(&self) -> bool {
        *self <= Self::Swap
    }

    /// True for the replies and acknowledgements consumed by the
    /// initiator's receive side.
    pub fn is_response(&self) -> bool {
        *self >= Self::Reply && *self <= Self::OcAck
    }
}

/// The possible errors that can arise from decoding a header or a
/// descriptor off the wire. A decode error never tears anything down;
/// the engine drops the buffer and counts it.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Header version field was not [`HDR_VERSION`].
    BadVersion(u8),

    /// Operation code out of range.
    UnknownOp(u8),

    /// Atomic operation code out of range.
    UnknownAtomOp(u8),

    /// Atomic data type code out of range.
    UnknownAtomType(u8),

    /// Data descriptor tag out of range.
    UnknownDataFmt(u8),

    /// Ran out of bytes mid-field.
    Truncated,
}

impl std::error::Error for WireError {}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadVersion(v) => write!(f, "unsupported header version {v}"),
            Self::UnknownOp(o) => write!(f, "unknown operation code {o}"),
            Self::UnknownAtomOp(o) => write!(f, "unknown atomic operation {o}"),
            Self::UnknownAtomType(t) => write!(f, "unknown atomic type {t}"),
            Self::UnknownDataFmt(t) => write!(f, "unknown data descriptor format {t}"),
            Self::Truncated => write!(f, "message too short"),
        }
    }
}

/// Pull `N` bytes off the front of `data`, or fail with `Truncated`.
pub(crate) fn take<'a, const N: usize>(data: &mut &'a [u8]) -> Result<&'a [u8; N], WireError> {
    if data.len() < N {
        return Err(WireError::Truncated);
    }
    let (head, rest) = data.split_at(N);
    *data = rest;
    Ok(head.try_into().unwrap())
}

pub(crate) fn get_u8(data: &mut &[u8]) -> Result<u8, WireError> {
    Ok(take::<1>(data)?[0])
}

/// Small integers are little-endian on the wire.
pub(crate) fn get_u32(data: &mut &[u8]) -> Result<u32, WireError> {
    Ok(u32::from_le_bytes(*take::<4>(data)?))
}

pub(crate) fn get_u64(data: &mut &[u8]) -> Result<u64, WireError> {
    Ok(u64::from_le_bytes(*take::<8>(data)?))
}
