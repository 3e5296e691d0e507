// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Atomic operation semantics over the wire.

use std::sync::Arc;

use ptl_engine::api::{self, AckReq, LeInit};
use ptl_engine::event::EventKind;
use ptl_engine::le::{LE_OP_GET, LE_OP_PUT};
use ptl_engine::md::MdState;
use ptl_engine::ni::{Ni, NiLimits, NiOptions};
use ptl_engine::pool::Handle;
use ptl_engine::pt::{ListPos, PT_ANY};
use ptl_engine::{init, Gbl, GblOptions, Peer, PtlError};
use ptl_protocol::atom::{AtomOp, AtomType};

fn setup(ranks: &[u32]) -> (Arc<Gbl>, Vec<Arc<Ni>>) {
    let gbl = init(GblOptions {
        nranks: 16,
        shm_name: None,
    })
    .unwrap();

    let nis = ranks
        .iter()
        .map(|&r| Ni::init(&gbl, NiOptions::matching_logical(r), NiLimits::default()).unwrap())
        .collect();
    (gbl, nis)
}

fn bind(ni: &Arc<Ni>, ptr: usize, len: u64, eq: Handle) -> Handle {
    api::md_bind(
        ni,
        MdState {
            start: ptr,
            length: len,
            eq,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap()
}

/// One fetch-add round trip; returns once the reply is in.
#[allow(clippy::too_many_arguments)]
fn fetch_add_u64(
    ni: &Arc<Ni>,
    eq: Handle,
    get_md: Handle,
    put_md: Handle,
    target: Peer,
    pt: u32,
    bits: u64,
) {
    api::fetch_atomic(
        ni,
        get_md,
        0,
        put_md,
        0,
        8,
        target,
        pt,
        bits,
        0,
        0,
        0,
        AtomOp::Sum,
        AtomType::Uint64,
    )
    .unwrap();

    loop {
        let (ev, _) = api::eq_wait(ni, eq).unwrap();
        if ev.kind == EventKind::Reply {
            break;
        }
    }
}

/// Two peers each fetch-add 1 a hundred times into a
/// zeroed counter. The counter ends at 200 and the fetched priors
/// are exactly {0..199}.
#[test]
fn concurrent_fetch_add_sees_every_value_once() {
    let (_gbl, nis) = setup(&[0, 1, 2]);
    let target = &nis[0];
    let peers = [nis[1].clone(), nis[2].clone()];

    let counter = Box::new(0u64);
    let counter_ptr = &*counter as *const u64 as usize;

    let pt = api::pt_alloc(target, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        target,
        pt,
        &LeInit {
            start: counter_ptr,
            length: 8,
            options: LE_OP_PUT | LE_OP_GET,
            match_bits: 0x5,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let mut threads = Vec::new();
    for ni in peers {
        threads.push(std::thread::spawn(move || {
            let one = 1u64.to_le_bytes();
            let mut prior = [0u8; 8];

            let eq = api::eq_alloc(&ni, 16).unwrap();
            let put_md = bind(&ni, one.as_ptr() as usize, 8, Handle::NONE);
            let get_md = bind(&ni, prior.as_mut_ptr() as usize, 8, eq);

            let mut seen = Vec::with_capacity(100);
            for _ in 0..100 {
                fetch_add_u64(&ni, eq, get_md, put_md, Peer::Rank(0), pt, 0x5);
                seen.push(u64::from_le_bytes(prior));
            }

            api::md_release(&ni, put_md).unwrap();
            api::md_release(&ni, get_md).unwrap();
            (ni, seen)
        }));
    }

    let mut all: Vec<u64> = Vec::with_capacity(200);
    let mut done = Vec::new();
    for t in threads {
        let (ni, seen) = t.join().unwrap();
        all.extend(seen);
        done.push(ni);
    }

    // Every prior value exactly once, and the final sum.
    all.sort_unstable();
    let expect: Vec<u64> = (0..200).collect();
    assert_eq!(all, expect);
    assert_eq!(*counter, 200);

    for ni in done {
        ni.fini().unwrap();
    }
    target.fini().unwrap();
}

/// CSWAP_LT and CSWAP_NE against equal operands must leave the
/// target untouched; CSWAP on equal operands must swap.
#[test]
fn conditional_swap_boundaries() {
    let (_gbl, nis) = setup(&[3, 4]);
    let (ini, tgt) = (&nis[0], &nis[1]);

    let word = Box::new(5u64);
    let word_ptr = &*word as *const u64 as usize;

    let pt = api::pt_alloc(tgt, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        tgt,
        pt,
        &LeInit {
            start: word_ptr,
            length: 8,
            options: LE_OP_PUT | LE_OP_GET,
            match_bits: 0x6,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let eq = api::eq_alloc(ini, 16).unwrap();
    let new_value = 9u64.to_le_bytes();
    let mut prior = [0u8; 8];
    let put_md = bind(ini, new_value.as_ptr() as usize, 8, Handle::NONE);
    let get_md = bind(ini, prior.as_mut_ptr() as usize, 8, eq);

    let do_swap = |op: AtomOp, operand: u64| {
        api::swap(
            ini,
            get_md,
            0,
            put_md,
            0,
            8,
            Peer::Rank(4),
            pt,
            0x6,
            0,
            0,
            0,
            &operand.to_le_bytes(),
            op,
            AtomType::Uint64,
        )
        .unwrap();
        loop {
            let (ev, _) = api::eq_wait(ini, eq).unwrap();
            if ev.kind == EventKind::Reply {
                break;
            }
        }
        u64::from_le_bytes(prior)
    };

    // Equal operand, strict less-than: no swap, prior comes back.
    assert_eq!(do_swap(AtomOp::CswapLt, 5), 5);
    assert_eq!(*word, 5);

    // Equal operand, not-equal: no swap.
    assert_eq!(do_swap(AtomOp::CswapNe, 5), 5);
    assert_eq!(*word, 5);

    // Equal operand, plain compare-and-swap: swaps.
    assert_eq!(do_swap(AtomOp::Cswap, 5), 5);
    assert_eq!(*word, 9);

    api::md_release(ini, put_md).unwrap();
    api::md_release(ini, get_md).unwrap();
    ini.fini().unwrap();
    tgt.fini().unwrap();
}

/// Atomics with an operation/type combination the algebra does not
/// define are rejected before anything is sent.
#[test]
fn invalid_atomic_combinations() {
    let (_gbl, nis) = setup(&[5, 6]);
    let ini = &nis[0];

    let buf = [0u8; 16];
    let md = bind(ini, buf.as_ptr() as usize, 16, Handle::NONE);

    assert_eq!(
        api::atomic(
            ini,
            md,
            0,
            8,
            AckReq::None,
            Peer::Rank(6),
            0,
            0,
            0,
            0,
            0,
            AtomOp::Band,
            AtomType::Double,
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    // The swap family must go through swap(), not atomic().
    assert_eq!(
        api::atomic(
            ini,
            md,
            0,
            8,
            AckReq::None,
            Peer::Rank(6),
            0,
            0,
            0,
            0,
            0,
            AtomOp::Cswap,
            AtomType::Uint64,
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    // A conditional swap is one element wide, no more.
    assert_eq!(
        api::swap(
            ini,
            md,
            0,
            md,
            8,
            16,
            Peer::Rank(6),
            0,
            0,
            0,
            0,
            0,
            &1u64.to_le_bytes(),
            AtomOp::Cswap,
            AtomType::Uint64,
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    nis[0].fini().unwrap();
    nis[1].fini().unwrap();
}

/// Plain (non-fetching) atomic: repeated SUMs accumulate at the
/// target.
#[test]
fn plain_atomic_sum() {
    let (_gbl, nis) = setup(&[7, 8]);
    let (ini, tgt) = (&nis[0], &nis[1]);

    let acc = Box::new(0u32);
    let acc_ptr = &*acc as *const u32 as usize;

    let pt = api::pt_alloc(tgt, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        tgt,
        pt,
        &LeInit {
            start: acc_ptr,
            length: 4,
            options: LE_OP_PUT,
            match_bits: 0x7,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let eq = api::eq_alloc(ini, 64).unwrap();
    let three = 3u32.to_le_bytes();
    let md = bind(ini, three.as_ptr() as usize, 4, eq);

    for _ in 0..10 {
        api::atomic(
            ini,
            md,
            0,
            4,
            AckReq::Ack,
            Peer::Rank(8),
            pt,
            0x7,
            0,
            0,
            0,
            AtomOp::Sum,
            AtomType::Uint32,
        )
        .unwrap();

        loop {
            let (ev, _) = api::eq_wait(ini, eq).unwrap();
            if ev.kind == EventKind::Ack {
                break;
            }
        }
    }

    assert_eq!(*acc, 30);

    api::md_release(ini, md).unwrap();
    ini.fini().unwrap();
    tgt.fini().unwrap();
}
