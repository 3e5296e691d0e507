// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end loopback traffic between two NIs in one process.

use std::sync::Arc;
use std::time::Duration;

use ptl_engine::api::{self, AckReq, LeInit};
use ptl_engine::event::EventKind;
use ptl_engine::le::{LE_EVENT_CT_BYTES, LE_EVENT_CT_COMM, LE_OP_GET, LE_OP_PUT};
use ptl_engine::md::MdState;
use ptl_engine::ni::{Ni, NiLimits, NiOptions};
use ptl_engine::pool::Handle;
use ptl_engine::pt::{ListPos, PT_ANY};
use ptl_engine::{init, Gbl, GblOptions, NiFail, Peer, PtlError};

/// Every test binary shares one comm pad; tests pick disjoint rank
/// pairs so they can run in parallel.
fn setup(rank_a: u32, rank_b: u32) -> (Arc<Gbl>, Arc<Ni>, Arc<Ni>) {
    let gbl = init(GblOptions {
        nranks: 16,
        shm_name: None,
    })
    .unwrap();

    let a = Ni::init(&gbl, NiOptions::matching_logical(rank_a), NiLimits::default()).unwrap();
    let b = Ni::init(&gbl, NiOptions::matching_logical(rank_b), NiLimits::default()).unwrap();
    (gbl, a, b)
}

/// A 1 KiB matching Put with a counting ack. The
/// target counts 1024 bytes, sees one PUT event with the header
/// data, and the initiator gets its ACK with `ni_fail = Ok`.
#[test]
fn loopback_put_1k_matching() {
    let (_gbl, ni0, ni1) = setup(0, 1);

    let mut target_buf = vec![0u8; 4096];
    let target_eq = api::eq_alloc(&ni1, 32).unwrap();
    let target_ct = api::ct_alloc(&ni1).unwrap();
    let pt = api::pt_alloc(&ni1, 0, target_eq, PT_ANY).unwrap();
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: target_buf.as_mut_ptr() as usize,
            length: 4096,
            options: LE_OP_PUT | LE_EVENT_CT_COMM | LE_EVENT_CT_BYTES,
            match_bits: 0xaa,
            ct: target_ct,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    let init_eq = api::eq_alloc(&ni0, 32).unwrap();
    let init_ct = api::ct_alloc(&ni0).unwrap();
    let md = api::md_bind(
        &ni0,
        MdState {
            start: payload.as_ptr() as usize,
            length: 1024,
            eq: init_eq,
            ct: init_ct,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap();

    api::put(
        &ni0,
        md,
        0,
        1024,
        AckReq::CtAck,
        Peer::Rank(1),
        pt,
        0xaa,
        0,
        7,
        0xbeef,
    )
    .unwrap();

    // Initiator: SEND then ACK.
    let (send_ev, _) = api::eq_wait(&ni0, init_eq).unwrap();
    assert_eq!(send_ev.kind, EventKind::Send);
    let (ack_ev, _) = api::eq_wait(&ni0, init_eq).unwrap();
    assert_eq!(ack_ev.kind, EventKind::Ack);
    assert_eq!(ack_ev.ni_fail, NiFail::Ok);
    assert_eq!(ack_ev.mlength, 1024);

    // Target: one PUT event carrying the header data.
    let (put_ev, _) = api::eq_poll(&ni1, target_eq, Duration::from_secs(2)).unwrap();
    assert_eq!(put_ev.kind, EventKind::Put);
    assert_eq!(put_ev.hdr_data, 0xbeef);
    assert_eq!(put_ev.mlength, 1024);
    assert_eq!(put_ev.ni_fail, NiFail::Ok);
    assert_eq!(api::eq_get(&ni1, target_eq).unwrap_err(), PtlError::EqEmpty);

    // The bytes actually landed, and the target counter saw them as
    // bytes.
    assert_eq!(&target_buf[..1024], payload.as_slice());
    let counted = api::ct_wait(&ni1, target_ct, 1024).unwrap();
    assert_eq!(counted.success, 1024);
    assert_eq!(counted.failure, 0);

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// Put then Get of the same region returns the bytes written, over
/// the interesting boundary lengths (the in-band/descriptor switch sits
/// between 7 and 4096 here).
#[test]
fn put_get_round_trip_boundaries() {
    let (_gbl, ni0, ni1) = setup(2, 3);

    let mut region = vec![0u8; 8192];
    let pt = api::pt_alloc(&ni1, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: region.as_mut_ptr() as usize,
            length: 8192,
            options: LE_OP_PUT | LE_OP_GET,
            match_bits: 0x1,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let init_eq = api::eq_alloc(&ni0, 64).unwrap();

    for &len in &[0u64, 1, 7, 8, 512, 4096, 8192] {
        let out: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
        let mut back = vec![0xffu8; len.max(1) as usize];

        let out_md = api::md_bind(
            &ni0,
            MdState {
                start: out.as_ptr() as usize,
                length: len,
                eq: init_eq,
                ct: Handle::NONE,
                options: 0,
                cookie: 0,
            },
        )
        .unwrap();
        let in_md = api::md_bind(
            &ni0,
            MdState {
                start: back.as_mut_ptr() as usize,
                length: len,
                eq: init_eq,
                ct: Handle::NONE,
                options: 0,
                cookie: 0,
            },
        )
        .unwrap();

        api::put(
            &ni0,
            out_md,
            0,
            len,
            AckReq::Ack,
            Peer::Rank(3),
            pt,
            0x1,
            0,
            0,
            0,
        )
        .unwrap();
        let (_, _) = api::eq_wait(&ni0, init_eq).unwrap(); // SEND
        let (ack, _) = api::eq_wait(&ni0, init_eq).unwrap(); // ACK
        assert_eq!(ack.kind, EventKind::Ack);
        assert_eq!(ack.mlength, len, "put mlength for len {len}");

        api::get(&ni0, in_md, 0, len, Peer::Rank(3), pt, 0x1, 0, 0).unwrap();
        let (_, _) = api::eq_wait(&ni0, init_eq).unwrap(); // SEND
        let (reply, _) = api::eq_wait(&ni0, init_eq).unwrap(); // REPLY
        assert_eq!(reply.kind, EventKind::Reply);
        assert_eq!(reply.mlength, len, "get mlength for len {len}");

        assert_eq!(&back[..len as usize], out.as_slice(), "payload for len {len}");

        api::md_release(&ni0, out_md).unwrap();
        api::md_release(&ni0, in_md).unwrap();
    }

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// Synchronous validation failures must have no side effects.
#[test]
fn validation_failures_are_synchronous() {
    let (_gbl, ni0, ni1) = setup(4, 5);

    let buf = [0u8; 64];
    let md_no_eq = api::md_bind(
        &ni0,
        MdState {
            start: buf.as_ptr() as usize,
            length: 64,
            eq: Handle::NONE,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap();

    // Put larger than max_msg_size:
    let too_big = ni0.limits.max_msg_size + 1;
    assert_eq!(
        api::put(
            &ni0,
            md_no_eq,
            0,
            too_big,
            AckReq::None,
            Peer::Rank(5),
            0,
            0,
            0,
            0,
            0
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    // Put with an ack requested against an MD with neither EQ nor
    // CT:
    assert_eq!(
        api::put(
            &ni0,
            md_no_eq,
            0,
            64,
            AckReq::Ack,
            Peer::Rank(5),
            0,
            0,
            0,
            0,
            0
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    // Length past the end of the MD:
    assert_eq!(
        api::put(
            &ni0,
            md_no_eq,
            32,
            64,
            AckReq::None,
            Peer::Rank(5),
            0,
            0,
            0,
            0,
            0
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    // Stale handle:
    api::md_release(&ni0, md_no_eq).unwrap();
    assert_eq!(
        api::put(
            &ni0,
            md_no_eq,
            0,
            64,
            AckReq::None,
            Peer::Rank(5),
            0,
            0,
            0,
            0,
            0
        )
        .unwrap_err(),
        PtlError::ArgInvalid
    );

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// A put with no ack requested still delivers its SEND event and
/// the data.
#[test]
fn put_without_ack() {
    let (_gbl, ni0, ni1) = setup(6, 7);

    let mut region = vec![0u8; 256];
    let target_ct = api::ct_alloc(&ni1).unwrap();
    let pt = api::pt_alloc(&ni1, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: region.as_mut_ptr() as usize,
            length: 256,
            options: LE_OP_PUT | LE_EVENT_CT_COMM,
            match_bits: 0x2,
            ct: target_ct,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let payload = [0x5au8; 128];
    let init_eq = api::eq_alloc(&ni0, 8).unwrap();
    let md = api::md_bind(
        &ni0,
        MdState {
            start: payload.as_ptr() as usize,
            length: 128,
            eq: init_eq,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap();

    api::put(
        &ni0,
        md,
        0,
        128,
        AckReq::None,
        Peer::Rank(7),
        pt,
        0x2,
        0,
        0,
        0,
    )
    .unwrap();

    let (ev, _) = api::eq_wait(&ni0, init_eq).unwrap();
    assert_eq!(ev.kind, EventKind::Send);

    // One operation lands on the target counter.
    let counted = api::ct_wait(&ni1, target_ct, 1).unwrap();
    assert_eq!(counted.success, 1);
    assert_eq!(&region[..128], &payload);

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}
