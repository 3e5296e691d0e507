// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Atomic operation and data-type tables.
//!
//! Which operation is defined over which algebra is fixed by the
//! standard: logical and bitwise operations only over the integer
//! types, MIN/MAX everywhere except complex, the ordered
//! compare-and-swap variants everywhere except complex, MSWAP only
//! over the integers, SWAP and the plain/NE compare forms everywhere.

use crate::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AtomOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Prod = 3,
    Lor = 4,
    Land = 5,
    Bor = 6,
    Band = 7,
    Lxor = 8,
    Bxor = 9,
    Swap = 10,
    Cswap = 11,
    CswapNe = 12,
    CswapLe = 13,
    CswapLt = 14,
    CswapGe = 15,
    CswapGt = 16,
    Mswap = 17,
}

impl AtomOp {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Min,
            1 => Self::Max,
            2 => Self::Sum,
            3 => Self::Prod,
            4 => Self::Lor,
            5 => Self::Land,
            6 => Self::Bor,
            7 => Self::Band,
            8 => Self::Lxor,
            9 => Self::Bxor,
            10 => Self::Swap,
            11 => Self::Cswap,
            12 => Self::CswapNe,
            13 => Self::CswapLe,
            14 => Self::CswapLt,
            15 => Self::CswapGe,
            16 => Self::CswapGt,
            17 => Self::Mswap,
            other => return Err(WireError::UnknownAtomOp(other)),
        })
    }

    /// The swap family carries an operand in the request header and
    /// always returns the prior contents to the initiator.
    pub fn is_swap(&self) -> bool {
        *self >= Self::Swap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomType {
    Int8 = 0,
    Uint8 = 1,
    Int16 = 2,
    Uint16 = 3,
    Int32 = 4,
    Uint32 = 5,
    Int64 = 6,
    Uint64 = 7,
    Float = 8,
    Double = 9,
    FloatComplex = 10,
    DoubleComplex = 11,
}

impl AtomType {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Int8,
            1 => Self::Uint8,
            2 => Self::Int16,
            3 => Self::Uint16,
            4 => Self::Int32,
            5 => Self::Uint32,
            6 => Self::Int64,
            7 => Self::Uint64,
            8 => Self::Float,
            9 => Self::Double,
            10 => Self::FloatComplex,
            11 => Self::DoubleComplex,
            other => return Err(WireError::UnknownAtomType(other)),
        })
    }

    /// Width in bytes of one element of this type.
    pub fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float => 4,
            Self::Int64 | Self::Uint64 | Self::Double | Self::FloatComplex => 8,
            Self::DoubleComplex => 16,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Uint8
                | Self::Int16
                | Self::Uint16
                | Self::Int32
                | Self::Uint32
                | Self::Int64
                | Self::Uint64
        )
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::FloatComplex | Self::DoubleComplex)
    }
}

/// Whether `op` is defined over `typ`.
pub fn op_type_valid(op: AtomOp, typ: AtomType) -> bool {
    use AtomOp::*;

    match op {
        // Logical and bitwise operations need an integer algebra:
        Lor | Land | Bor | Band | Lxor | Bxor | Mswap => typ.is_integral(),

        // No total order on the complex numbers:
        Min | Max | CswapLe | CswapLt | CswapGe | CswapGt => !typ.is_complex(),

        Sum | Prod | Swap | Cswap | CswapNe => true,
    }
}

/// A typed operand as carried in the request header's 32-byte field.
/// Only the first [`AtomType::size`] bytes are meaningful (MSWAP uses
/// twice that: mask then value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand(pub [u8; 32]);

impl Operand {
    pub const NONE: Operand = Operand([0; 32]);

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 32];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self(buf)
    }

    pub fn as_bytes(&self, typ: AtomType) -> &[u8] {
        &self.0[..typ.size()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_bitwise_on_floats() {
        assert!(!op_type_valid(AtomOp::Band, AtomType::Float));
        assert!(!op_type_valid(AtomOp::Lxor, AtomType::Double));
        assert!(op_type_valid(AtomOp::Band, AtomType::Uint64));
    }

    #[test]
    fn no_ordering_on_complex() {
        assert!(!op_type_valid(AtomOp::Min, AtomType::FloatComplex));
        assert!(!op_type_valid(AtomOp::CswapLt, AtomType::DoubleComplex));
        assert!(op_type_valid(AtomOp::Sum, AtomType::DoubleComplex));
        assert!(op_type_valid(AtomOp::CswapNe, AtomType::FloatComplex));
    }

    #[test]
    fn mswap_is_integer_only() {
        assert!(op_type_valid(AtomOp::Mswap, AtomType::Uint32));
        assert!(!op_type_valid(AtomOp::Mswap, AtomType::Double));
    }

    #[test]
    fn op_codes_round_trip() {
        for code in 0..=17u8 {
            let op = AtomOp::from_u8(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(AtomOp::from_u8(18).is_err());

        for code in 0..=11u8 {
            let typ = AtomType::from_u8(code).unwrap();
            assert_eq!(typ as u8, code);
        }
        assert!(AtomType::from_u8(12).is_err());
    }
}
