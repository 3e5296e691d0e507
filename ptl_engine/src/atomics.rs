// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Application of atomic operations to target memory.
//!
//! The target state machine calls [`apply`] with the matched entry's
//! word lock held, so concurrent operations against the same region
//! serialise at the granularity the standard asks for. Everything
//! here is byte-slice in, byte-slice out; elements are little-endian
//! in memory, matching the wire.

use ptl_protocol::atom::{op_type_valid, AtomOp, AtomType, Operand};

use crate::{PtlError, Result};

/// Element-wise combine loop shared by all scalar types. `$f` maps
/// `(prior, incoming) -> new`.
macro_rules! combine {
    ($ty:ty, $f:expr, $tgt:expr, $src:expr, $old:expr) => {{
        const S: usize = std::mem::size_of::<$ty>();
        let n = $tgt.len() / S;
        for i in 0..n {
            let a = <$ty>::from_le_bytes($tgt[i * S..(i + 1) * S].try_into().unwrap());
            let b = <$ty>::from_le_bytes($src[i * S..(i + 1) * S].try_into().unwrap());
            if let Some(old) = $old.as_deref_mut() {
                old[i * S..(i + 1) * S].copy_from_slice(&a.to_le_bytes());
            }
            let f: fn($ty, $ty) -> $ty = $f;
            $tgt[i * S..(i + 1) * S].copy_from_slice(&f(a, b).to_le_bytes());
        }
    }};
}

/// Combine dispatch for the integer types.
macro_rules! int_ops {
    ($ty:ty, $op:expr, $tgt:expr, $src:expr, $old:expr) => {
        match $op {
            AtomOp::Min => combine!($ty, |a, b| if b < a { b } else { a }, $tgt, $src, $old),
            AtomOp::Max => combine!($ty, |a, b| if b > a { b } else { a }, $tgt, $src, $old),
            AtomOp::Sum => combine!($ty, |a, b| a.wrapping_add(b), $tgt, $src, $old),
            AtomOp::Prod => combine!($ty, |a, b| a.wrapping_mul(b), $tgt, $src, $old),
            AtomOp::Lor => combine!(
                $ty,
                |a, b| (a != 0 || b != 0) as u8 as $ty,
                $tgt,
                $src,
                $old
            ),
            AtomOp::Land => combine!(
                $ty,
                |a, b| (a != 0 && b != 0) as u8 as $ty,
                $tgt,
                $src,
                $old
            ),
            AtomOp::Lxor => combine!(
                $ty,
                |a, b| ((a != 0) ^ (b != 0)) as u8 as $ty,
                $tgt,
                $src,
                $old
            ),
            AtomOp::Bor => combine!($ty, |a, b| a | b, $tgt, $src, $old),
            AtomOp::Band => combine!($ty, |a, b| a & b, $tgt, $src, $old),
            AtomOp::Bxor => combine!($ty, |a, b| a ^ b, $tgt, $src, $old),
            AtomOp::Swap => combine!($ty, |_, b| b, $tgt, $src, $old),
            // Validity filtering and the single-element split keep
            // the rest out of here.
            _ => unreachable!("op {:?} in integer combine", $op),
        }
    };
}

macro_rules! float_ops {
    ($ty:ty, $op:expr, $tgt:expr, $src:expr, $old:expr) => {
        match $op {
            AtomOp::Min => combine!($ty, |a, b| if b < a { b } else { a }, $tgt, $src, $old),
            AtomOp::Max => combine!($ty, |a, b| if b > a { b } else { a }, $tgt, $src, $old),
            AtomOp::Sum => combine!($ty, |a, b| a + b, $tgt, $src, $old),
            AtomOp::Prod => combine!($ty, |a, b| a * b, $tgt, $src, $old),
            AtomOp::Swap => combine!($ty, |_, b| b, $tgt, $src, $old),
            _ => unreachable!("op {:?} in float combine", $op),
        }
    };
}

/// Complex elements are `(re, im)` pairs of the component type.
macro_rules! complex_ops {
    ($ty:ty, $op:expr, $tgt:expr, $src:expr, $old:expr) => {{
        const S: usize = 2 * std::mem::size_of::<$ty>();
        const H: usize = std::mem::size_of::<$ty>();
        let n = $tgt.len() / S;
        for i in 0..n {
            let base = i * S;
            let ar = <$ty>::from_le_bytes($tgt[base..base + H].try_into().unwrap());
            let ai = <$ty>::from_le_bytes($tgt[base + H..base + S].try_into().unwrap());
            let br = <$ty>::from_le_bytes($src[base..base + H].try_into().unwrap());
            let bi = <$ty>::from_le_bytes($src[base + H..base + S].try_into().unwrap());

            if let Some(old) = $old.as_deref_mut() {
                old[base..base + H].copy_from_slice(&ar.to_le_bytes());
                old[base + H..base + S].copy_from_slice(&ai.to_le_bytes());
            }

            let (rr, ri) = match $op {
                AtomOp::Sum => (ar + br, ai + bi),
                AtomOp::Prod => (ar * br - ai * bi, ar * bi + ai * br),
                AtomOp::Swap => (br, bi),
                _ => unreachable!("op {:?} in complex combine", $op),
            };

            $tgt[base..base + H].copy_from_slice(&rr.to_le_bytes());
            $tgt[base + H..base + S].copy_from_slice(&ri.to_le_bytes());
        }
    }};
}

/// Single-element conditional swap for ordered scalar types.
macro_rules! cswap {
    ($ty:ty, $op:expr, $tgt:expr, $src:expr, $operand:expr, $old:expr) => {{
        let prior = <$ty>::from_le_bytes((&$tgt[..]).try_into().unwrap());
        let value = <$ty>::from_le_bytes($src.try_into().unwrap());
        let cmp = <$ty>::from_le_bytes($operand.try_into().unwrap());

        if let Some(old) = $old.as_deref_mut() {
            old.copy_from_slice(&prior.to_le_bytes());
        }

        let swap = match $op {
            AtomOp::Cswap => cmp == prior,
            AtomOp::CswapNe => cmp != prior,
            AtomOp::CswapLe => cmp <= prior,
            AtomOp::CswapLt => cmp < prior,
            AtomOp::CswapGe => cmp >= prior,
            AtomOp::CswapGt => cmp > prior,
            _ => unreachable!(),
        };

        if swap {
            $tgt.copy_from_slice(&value.to_le_bytes());
        }
    }};
}

macro_rules! mswap {
    ($ty:ty, $tgt:expr, $src:expr, $operand:expr, $old:expr) => {{
        let prior = <$ty>::from_le_bytes((&$tgt[..]).try_into().unwrap());
        let value = <$ty>::from_le_bytes($src.try_into().unwrap());
        let mask = <$ty>::from_le_bytes($operand.try_into().unwrap());

        if let Some(old) = $old.as_deref_mut() {
            old.copy_from_slice(&prior.to_le_bytes());
        }

        $tgt.copy_from_slice(&((prior & !mask) | (value & mask)).to_le_bytes());
    }};
}

/// Apply `op` over `target`, combining with `src`. `old`, when
/// supplied, receives the prior contents (the fetch half of
/// FetchAtomic/Swap). `operand` is only read by the conditional and
/// masked swaps.
///
/// Lengths: `target.len()` must be a whole number of elements and
/// `src` at least as long; the conditional/masked swaps operate on
/// exactly one element.
pub fn apply(
    op: AtomOp,
    typ: AtomType,
    target: &mut [u8],
    src: &[u8],
    operand: &Operand,
    mut old: Option<&mut [u8]>,
) -> Result<()> {
    if !op_type_valid(op, typ) {
        return Err(PtlError::ArgInvalid);
    }

    let size = typ.size();
    if target.len() % size != 0 || src.len() < target.len() {
        return Err(PtlError::ArgInvalid);
    }
    if let Some(old) = old.as_deref() {
        if old.len() < target.len() {
            return Err(PtlError::ArgInvalid);
        }
    }

    // The conditional and masked swaps are defined on exactly one
    // element.
    if op.is_swap() && op != AtomOp::Swap && target.len() != size {
        return Err(PtlError::ArgInvalid);
    }

    match op {
        AtomOp::Cswap
        | AtomOp::CswapNe
        | AtomOp::CswapLe
        | AtomOp::CswapLt
        | AtomOp::CswapGe
        | AtomOp::CswapGt => {
            let opnd = operand.as_bytes(typ);
            match typ {
                AtomType::Int8 => cswap!(i8, op, target, &src[..size], opnd, old),
                AtomType::Uint8 => cswap!(u8, op, target, &src[..size], opnd, old),
                AtomType::Int16 => cswap!(i16, op, target, &src[..size], opnd, old),
                AtomType::Uint16 => cswap!(u16, op, target, &src[..size], opnd, old),
                AtomType::Int32 => cswap!(i32, op, target, &src[..size], opnd, old),
                AtomType::Uint32 => cswap!(u32, op, target, &src[..size], opnd, old),
                AtomType::Int64 => cswap!(i64, op, target, &src[..size], opnd, old),
                AtomType::Uint64 => cswap!(u64, op, target, &src[..size], opnd, old),
                AtomType::Float => cswap!(f32, op, target, &src[..size], opnd, old),
                AtomType::Double => cswap!(f64, op, target, &src[..size], opnd, old),
                AtomType::FloatComplex | AtomType::DoubleComplex => {
                    complex_cswap(op, typ, target, &src[..size], opnd, old)
                }
            }
        }

        AtomOp::Mswap => {
            let opnd = operand.as_bytes(typ);
            match typ {
                AtomType::Int8 => mswap!(i8, target, &src[..size], opnd, old),
                AtomType::Uint8 => mswap!(u8, target, &src[..size], opnd, old),
                AtomType::Int16 => mswap!(i16, target, &src[..size], opnd, old),
                AtomType::Uint16 => mswap!(u16, target, &src[..size], opnd, old),
                AtomType::Int32 => mswap!(i32, target, &src[..size], opnd, old),
                AtomType::Uint32 => mswap!(u32, target, &src[..size], opnd, old),
                AtomType::Int64 => mswap!(i64, target, &src[..size], opnd, old),
                AtomType::Uint64 => mswap!(u64, target, &src[..size], opnd, old),
                // op_type_valid keeps Mswap integral.
                _ => unreachable!(),
            }
        }

        _ => match typ {
            AtomType::Int8 => int_ops!(i8, op, target, src, old),
            AtomType::Uint8 => int_ops!(u8, op, target, src, old),
            AtomType::Int16 => int_ops!(i16, op, target, src, old),
            AtomType::Uint16 => int_ops!(u16, op, target, src, old),
            AtomType::Int32 => int_ops!(i32, op, target, src, old),
            AtomType::Uint32 => int_ops!(u32, op, target, src, old),
            AtomType::Int64 => int_ops!(i64, op, target, src, old),
            AtomType::Uint64 => int_ops!(u64, op, target, src, old),
            AtomType::Float => float_ops!(f32, op, target, src, old),
            AtomType::Double => float_ops!(f64, op, target, src, old),
            AtomType::FloatComplex => complex_ops!(f32, op, target, src, old),
            AtomType::DoubleComplex => complex_ops!(f64, op, target, src, old),
        },
    }

    Ok(())
}

/// Complex equality-flavored conditional swap. Only `Cswap` and
/// `CswapNe` get here; the ordered forms are invalid on complex.
fn complex_cswap(
    op: AtomOp,
    typ: AtomType,
    target: &mut [u8],
    src: &[u8],
    operand: &[u8],
    mut old: Option<&mut [u8]>,
) {
    if let Some(old) = old.as_deref_mut() {
        old[..target.len()].copy_from_slice(target);
    }

    let equal = &target[..] == operand;
    let swap = match op {
        AtomOp::Cswap => equal,
        AtomOp::CswapNe => !equal,
        _ => unreachable!("ordered cswap on complex type {typ:?}"),
    };

    if swap {
        target.copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(vals: &[u64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn sum_uint64_with_fetch() {
        let mut tgt = words(&[10, 20]);
        let src = words(&[1, 2]);
        let mut old = vec![0u8; 16];

        apply(
            AtomOp::Sum,
            AtomType::Uint64,
            &mut tgt,
            &src,
            &Operand::NONE,
            Some(&mut old),
        )
        .unwrap();

        assert_eq!(tgt, words(&[11, 22]));
        assert_eq!(old, words(&[10, 20]));
    }

    #[test]
    fn min_max_int32() {
        let mut tgt = (-5i32).to_le_bytes().to_vec();
        apply(
            AtomOp::Max,
            AtomType::Int32,
            &mut tgt,
            &3i32.to_le_bytes(),
            &Operand::NONE,
            None,
        )
        .unwrap();
        assert_eq!(i32::from_le_bytes(tgt.clone().try_into().unwrap()), 3);

        apply(
            AtomOp::Min,
            AtomType::Int32,
            &mut tgt,
            &(-7i32).to_le_bytes(),
            &Operand::NONE,
            None,
        )
        .unwrap();
        assert_eq!(i32::from_le_bytes(tgt.try_into().unwrap()), -7);
    }

    #[test]
    fn band_on_double_rejected() {
        let mut tgt = vec![0u8; 8];
        let src = vec![0u8; 8];
        assert_eq!(
            apply(
                AtomOp::Band,
                AtomType::Double,
                &mut tgt,
                &src,
                &Operand::NONE,
                None
            )
            .unwrap_err(),
            PtlError::ArgInvalid
        );
    }

    #[test]
    fn cswap_on_equal_operands() {
        // CSWAP swaps exactly when operand == prior.
        let mut tgt = 5u64.to_le_bytes().to_vec();
        let operand = Operand::from_slice(&5u64.to_le_bytes());
        apply(
            AtomOp::Cswap,
            AtomType::Uint64,
            &mut tgt,
            &9u64.to_le_bytes(),
            &operand,
            None,
        )
        .unwrap();
        assert_eq!(u64::from_le_bytes(tgt.clone().try_into().unwrap()), 9);

        // CSWAP_NE on equal operands must NOT swap.
        let mut tgt = 5u64.to_le_bytes().to_vec();
        apply(
            AtomOp::CswapNe,
            AtomType::Uint64,
            &mut tgt,
            &9u64.to_le_bytes(),
            &operand,
            None,
        )
        .unwrap();
        assert_eq!(u64::from_le_bytes(tgt.try_into().unwrap()), 5);
    }

    #[test]
    fn cswap_lt_on_equal_operands_does_not_swap() {
        let mut tgt = 5u64.to_le_bytes().to_vec();
        let operand = Operand::from_slice(&5u64.to_le_bytes());
        let mut old = vec![0u8; 8];

        apply(
            AtomOp::CswapLt,
            AtomType::Uint64,
            &mut tgt,
            &9u64.to_le_bytes(),
            &operand,
            Some(&mut old),
        )
        .unwrap();

        assert_eq!(u64::from_le_bytes(tgt.try_into().unwrap()), 5);
        // The prior value still comes back:
        assert_eq!(u64::from_le_bytes(old.try_into().unwrap()), 5);
    }

    #[test]
    fn cswap_lt_swaps_when_less() {
        let mut tgt = 5u64.to_le_bytes().to_vec();
        let operand = Operand::from_slice(&4u64.to_le_bytes());
        apply(
            AtomOp::CswapLt,
            AtomType::Uint64,
            &mut tgt,
            &9u64.to_le_bytes(),
            &operand,
            None,
        )
        .unwrap();
        assert_eq!(u64::from_le_bytes(tgt.try_into().unwrap()), 9);
    }

    #[test]
    fn mswap_masks() {
        let mut tgt = 0xffff_0000u32.to_le_bytes().to_vec();
        let operand = Operand::from_slice(&0x00ff_00ffu32.to_le_bytes());
        let mut old = vec![0u8; 4];

        apply(
            AtomOp::Mswap,
            AtomType::Uint32,
            &mut tgt,
            &0x1234_5678u32.to_le_bytes(),
            &operand,
            Some(&mut old),
        )
        .unwrap();

        // Masked bits from the value, the rest untouched:
        assert_eq!(
            u32::from_le_bytes(tgt.try_into().unwrap()),
            (0xffff_0000 & !0x00ff_00ff) | (0x1234_5678 & 0x00ff_00ff)
        );
        assert_eq!(u32::from_le_bytes(old.try_into().unwrap()), 0xffff_0000);
    }

    #[test]
    fn multi_element_cswap_rejected() {
        let mut tgt = vec![0u8; 16];
        let src = vec![0u8; 16];
        assert_eq!(
            apply(
                AtomOp::Cswap,
                AtomType::Uint64,
                &mut tgt,
                &src,
                &Operand::NONE,
                None
            )
            .unwrap_err(),
            PtlError::ArgInvalid
        );
    }

    #[test]
    fn complex_sum_and_prod() {
        // (1 + 2i) * (3 + 4i) = -5 + 10i
        let mut tgt: Vec<u8> = [1.0f32, 2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let src: Vec<u8> = [3.0f32, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        apply(
            AtomOp::Prod,
            AtomType::FloatComplex,
            &mut tgt,
            &src,
            &Operand::NONE,
            None,
        )
        .unwrap();

        let re = f32::from_le_bytes(tgt[..4].try_into().unwrap());
        let im = f32::from_le_bytes(tgt[4..].try_into().unwrap());
        assert_eq!((re, im), (-5.0, 10.0));
    }

    #[test]
    fn swap_returns_prior_array() {
        let mut tgt = words(&[7, 8, 9]);
        let src = words(&[1, 2, 3]);
        let mut old = vec![0u8; 24];

        apply(
            AtomOp::Swap,
            AtomType::Uint64,
            &mut tgt,
            &src,
            &Operand::NONE,
            Some(&mut old),
        )
        .unwrap();

        assert_eq!(tgt, words(&[1, 2, 3]));
        assert_eq!(old, words(&[7, 8, 9]));
    }
}
