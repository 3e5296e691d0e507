// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Data descriptors.
//!
//! A request whose payload does not ride in-band carries one of these
//! after its header tail, telling the target where the initiator's
//! memory is and how to reach it.

use crate::*;

const FMT_INLINE: u8 = 0;
const FMT_SGE: u8 = 1;
const FMT_RDMA: u8 = 2;
const FMT_INDIRECT: u8 = 3;

/// One remotely accessible region: address, remote key, length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdmaDesc {
    pub addr: u64,
    pub rkey: u32,
    pub length: u64,
}

impl RdmaDesc {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.rkey.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            addr: get_u64(data)?,
            rkey: get_u32(data)?,
            length: get_u64(data)?,
        })
    }
}

/// A scatter-gather element, as used in immediate SGE lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl Sge {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.lkey.to_le_bytes());
    }

    fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            addr: get_u64(data)?,
            length: get_u32(data)?,
            lkey: get_u32(data)?,
        })
    }
}

/// The tagged descriptor union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Payload bytes carried in the message itself.
    Inline(Vec<u8>),

    /// An immediate list of scatter-gather elements. Only meaningful
    /// between co-located peers, where addresses are reachable via
    /// the copy facade.
    Sge(Vec<Sge>),

    /// One region the target reads from or writes to directly.
    Rdma(RdmaDesc),

    /// The initiator's region list was too long to send; this points
    /// at an SGE array in the initiator's registered memory that the
    /// target must fetch first.
    Indirect { desc: RdmaDesc, count: u32 },
}

impl Data {
    /// Total bytes described, independent of representation.
    pub fn length(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Sge(list) => list.iter().map(|s| s.length as u64).sum(),
            Self::Rdma(desc) => desc.length,
            Self::Indirect { desc, .. } => desc.length,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Inline(bytes) => {
                buf.push(FMT_INLINE);
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            Self::Sge(list) => {
                buf.push(FMT_SGE);
                buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
                for sge in list {
                    sge.serialize(buf);
                }
            }
            Self::Rdma(desc) => {
                buf.push(FMT_RDMA);
                desc.serialize(buf);
            }
            Self::Indirect { desc, count } => {
                buf.push(FMT_INDIRECT);
                desc.serialize(buf);
                buf.extend_from_slice(&count.to_le_bytes());
            }
        }
    }

    pub fn deserialize(data: &mut &[u8]) -> Result<Self, WireError> {
        let tag = get_u8(data)?;

        match tag {
            FMT_INLINE => {
                let len = get_u32(data)? as usize;
                if data.len() < len {
                    return Err(WireError::Truncated);
                }
                let (bytes, rest) = data.split_at(len);
                *data = rest;
                Ok(Self::Inline(bytes.to_vec()))
            }
            FMT_SGE => {
                let count = get_u32(data)?;
                let mut list = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    list.push(Sge::deserialize(data)?);
                }
                Ok(Self::Sge(list))
            }
            FMT_RDMA => Ok(Self::Rdma(RdmaDesc::deserialize(data)?)),
            FMT_INDIRECT => {
                let desc = RdmaDesc::deserialize(data)?;
                let count = get_u32(data)?;
                Ok(Self::Indirect { desc, count })
            }
            other => Err(WireError::UnknownDataFmt(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(before: Data) {
        let mut bytes = Vec::new();
        before.serialize(&mut bytes);
        let mut rest = bytes.as_slice();
        let after = Data::deserialize(&mut rest).unwrap();

        assert_eq!(before, after);
        assert!(rest.is_empty());
    }

    #[test]
    fn descriptor_round_trips() {
        round_trip(Data::Inline(vec![1, 2, 3, 4, 5]));
        round_trip(Data::Inline(Vec::new()));
        round_trip(Data::Sge(vec![
            Sge {
                addr: 0x1000,
                length: 64,
                lkey: 7,
            },
            Sge {
                addr: 0x2000,
                length: 4032,
                lkey: 7,
            },
        ]));
        round_trip(Data::Rdma(RdmaDesc {
            addr: 0xffff_0000_1234,
            rkey: 99,
            length: 1 << 20,
        }));
        round_trip(Data::Indirect {
            desc: RdmaDesc {
                addr: 0xab,
                rkey: 3,
                length: 512,
            },
            count: 16,
        });
    }

    #[test]
    fn inline_longer_than_input_is_truncated() {
        let mut bytes = Vec::new();
        Data::Inline(vec![9; 32]).serialize(&mut bytes);
        bytes.truncate(bytes.len() - 1);

        assert_eq!(
            Data::deserialize(&mut bytes.as_slice()),
            Err(WireError::Truncated)
        );
    }
}
