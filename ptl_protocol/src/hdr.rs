// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Message headers.
//!
//! Every message starts with the 16-byte common header: a packed flag
//! byte (version, NI kind, packet format), the operation code, six
//! reserved bytes, and the payload length. The length is big-endian;
//! all smaller integers on the wire are little-endian. Requests carry
//! a [`ReqHdr`] tail, replies and acks an [`AckHdr`] tail, and a
//! disconnect notice carries no tail at all.

use log::*;

use crate::*;

/// Size of the encoded common header.
pub const COMMON_HDR_SIZE: usize = 16;

/// Which flavor of NI a message was sent from. Both peers of a
/// connection must agree on this; a mismatch is a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NiKind {
    PhysNoMatch = 0,
    PhysMatch = 1,
    LogicalNoMatch = 2,
    LogicalMatch = 3,
}

impl NiKind {
    fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => Self::PhysNoMatch,
            1 => Self::PhysMatch,
            2 => Self::LogicalNoMatch,
            _ => Self::LogicalMatch,
        }
    }

    pub fn matching(&self) -> bool {
        matches!(self, Self::PhysMatch | Self::LogicalMatch)
    }

    pub fn logical(&self) -> bool {
        matches!(self, Self::LogicalNoMatch | Self::LogicalMatch)
    }
}

/// How the payload of a request is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktFmt {
    /// Payload bytes follow the header tail in-band.
    Inline = 0,

    /// The tail is followed by one RDMA descriptor the target moves
    /// data through.
    Rdma = 1,

    /// The tail is followed by an indirect descriptor; the target
    /// must first fetch the real scatter-gather list.
    Indirect = 2,
}

impl PktFmt {
    fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => Self::Inline,
            1 => Self::Rdma,
            _ => Self::Indirect,
        }
    }
}

/// The common header present on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHdr {
    pub op: Op,
    pub ni_kind: NiKind,
    pub pkt_fmt: PktFmt,

    /// Length of the payload that rides in or is described by this
    /// message. Big-endian on the wire.
    pub length: u64,
}

impl CommonHdr {
    pub fn new(op: Op, ni_kind: NiKind, pkt_fmt: PktFmt, length: u64) -> Self {
        Self {
            op,
            ni_kind,
            pkt_fmt,
            length,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        // version:4 | ni_kind:2 | pkt_fmt:2
        let flags = (HDR_VERSION << 4) | ((self.ni_kind as u8) << 2) | self.pkt_fmt as u8;
        buf.push(flags);
        buf.push(self.op as u8);
        buf.extend_from_slice(&[0u8; 6]);
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        let flags = get_u8(data)?;

        let version = flags >> 4;
        if version != HDR_VERSION {
            debug!("message with unsupported header version {version}");
            return Err(WireError::BadVersion(version));
        }

        let op = Op::from_u8(get_u8(data)?)?;
        let _reserved = take::<6>(data)?;
        let length = u64::from_be_bytes(*take::<8>(data)?);

        Ok(Self {
            op,
            ni_kind: NiKind::from_bits(flags >> 2),
            pkt_fmt: PktFmt::from_bits(flags),
            length,
        })
    }
}

/// Header tail on the five request operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqHdr {
    pub src_nid: u32,
    pub src_pid: u32,

    /// Job-scoped user id of the sender, checked against the matched
    /// entry before any data moves.
    pub uid: u32,

    pub pt_index: u32,
    pub match_bits: u64,
    pub hdr_data: u64,

    /// Requested length; the common header's `length` only covers
    /// what rides in this particular message.
    pub rlength: u64,
    pub roffset: u64,

    /// Ack disposition requested by the initiator: one of the
    /// `ACK_REQ_*` constants.
    pub ack_req: u8,

    pub atom_op: u8,
    pub atom_type: u8,

    /// Typed operand for the swap family, valid bytes per
    /// [`AtomType::size`].
    pub operand: [u8; 32],

    /// The initiator-side transaction handle, echoed back in the ack
    /// or reply so the initiator can find its transaction again.
    pub handle: u64,
}

/// No acknowledgement wanted.
pub const ACK_REQ_NONE: u8 = 0;
/// Full ack event.
pub const ACK_REQ_ACK: u8 = 1;
/// Counting-only ack.
pub const ACK_REQ_CT: u8 = 2;
/// Operation-completed ack with no event payload.
pub const ACK_REQ_OC: u8 = 3;

impl Default for ReqHdr {
    fn default() -> Self {
        Self {
            src_nid: 0,
            src_pid: 0,
            uid: 0,
            pt_index: 0,
            match_bits: 0,
            hdr_data: 0,
            rlength: 0,
            roffset: 0,
            ack_req: ACK_REQ_NONE,
            atom_op: 0,
            atom_type: 0,
            operand: [0; 32],
            handle: 0,
        }
    }
}

impl ReqHdr {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_nid.to_le_bytes());
        buf.extend_from_slice(&self.src_pid.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.pt_index.to_le_bytes());
        buf.extend_from_slice(&self.match_bits.to_le_bytes());
        buf.extend_from_slice(&self.hdr_data.to_le_bytes());
        buf.extend_from_slice(&self.rlength.to_le_bytes());
        buf.extend_from_slice(&self.roffset.to_le_bytes());
        buf.push(self.ack_req);
        buf.push(self.atom_op);
        buf.push(self.atom_type);
        buf.push(0); // pad
        buf.extend_from_slice(&self.operand);
        buf.extend_from_slice(&self.handle.to_le_bytes());
    }

    pub fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        let mut hdr = Self {
            src_nid: get_u32(data)?,
            src_pid: get_u32(data)?,
            uid: get_u32(data)?,
            pt_index: get_u32(data)?,
            match_bits: get_u64(data)?,
            hdr_data: get_u64(data)?,
            rlength: get_u64(data)?,
            roffset: get_u64(data)?,
            ack_req: get_u8(data)?,
            atom_op: get_u8(data)?,
            atom_type: get_u8(data)?,
            ..Default::default()
        };

        let _pad = get_u8(data)?;
        hdr.operand = *take::<32>(data)?;
        hdr.handle = get_u64(data)?;

        Ok(hdr)
    }
}

/// Header tail on replies and the three ack flavors. A reply's
/// payload (if any) follows this tail in-band or is pushed by RDMA
/// write, per the common header's `pkt_fmt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckHdr {
    /// The initiator transaction this responds to.
    pub handle: u64,

    /// Bytes the target actually consumed (after truncation).
    pub mlength: u64,

    /// Offset within the matched entry where data landed.
    pub moffset: u64,

    /// Failure kind observed at the target, one of the engine's
    /// `ni_fail` codes; 0 is success.
    pub ni_fail: u8,

    /// Set when the request matched on the overflow list.
    pub overflow: u8,
}

impl AckHdr {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.handle.to_le_bytes());
        buf.extend_from_slice(&self.mlength.to_le_bytes());
        buf.extend_from_slice(&self.moffset.to_le_bytes());
        buf.push(self.ni_fail);
        buf.push(self.overflow);
        buf.extend_from_slice(&[0u8; 2]); // pad
    }

    pub fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        let hdr = Self {
            handle: get_u64(data)?,
            mlength: get_u64(data)?,
            moffset: get_u64(data)?,
            ni_fail: get_u8(data)?,
            overflow: get_u8(data)?,
        };
        let _pad = take::<2>(data)?;
        Ok(hdr)
    }
}
