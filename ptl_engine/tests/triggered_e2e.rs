// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Counting events driving deferred operations.

use std::sync::Arc;
use std::time::Duration;

use ptl_engine::api::{self, AckReq, LeInit};
use ptl_engine::ct::CtEvent;
use ptl_engine::le::{LE_EVENT_CT_COMM, LE_OP_PUT};
use ptl_engine::md::MdState;
use ptl_engine::ni::{Ni, NiLimits, NiOptions};
use ptl_engine::pool::Handle;
use ptl_engine::pt::{ListPos, PT_ANY};
use ptl_engine::{init, Gbl, GblOptions, Peer, PtlError};

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

/// A put armed at threshold 3 goes out on exactly
/// the third increment, and delivers normally.
#[test]
fn triggered_put_fires_on_third_increment() {
    let (_gbl, ni0, ni1) = setup(0, 1);

    let mut space = vec![0u8; 64];
    let target_ct = api::ct_alloc(&ni1).unwrap();
    let pt = api::pt_alloc(&ni1, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: space.as_mut_ptr() as usize,
            length: 64,
            options: LE_OP_PUT | LE_EVENT_CT_COMM,
            match_bits: 0x1,
            ct: target_ct,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let payload = [0x77u8; 8];
    let md = api::md_bind(
        &ni0,
        MdState {
            start: payload.as_ptr() as usize,
            length: 8,
            eq: Handle::NONE,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap();

    let trigger = api::ct_alloc(&ni0).unwrap();
    api::triggered_put(
        &ni0,
        md,
        0,
        8,
        AckReq::None,
        Peer::Rank(1),
        pt,
        0x1,
        0,
        0,
        0,
        trigger,
        3,
    )
    .unwrap();

    // Two increments: nothing moves.
    for _ in 0..2 {
        api::ct_inc(
            &ni0,
            trigger,
            CtEvent {
                success: 1,
                failure: 0,
            },
        )
        .unwrap();
    }
    assert_eq!(
        api::ct_poll(&ni1, &[target_ct], &[1], Duration::from_millis(100)).unwrap_err(),
        PtlError::CtNoneReached
    );

    // The third fires it.
    api::ct_inc(
        &ni0,
        trigger,
        CtEvent {
            success: 1,
            failure: 0,
        },
    )
    .unwrap();

    let counted = api::ct_wait(&ni1, target_ct, 1).unwrap();
    assert_eq!(counted.success, 1);
    assert_eq!(&space[..8], &payload);

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// Arming at an already-reached threshold dispatches immediately,
/// exactly once.
#[test]
fn arming_past_threshold_fires_now() {
    let (_gbl, ni0, ni1) = setup(2, 3);

    let mut space = vec![0u8; 64];
    let target_ct = api::ct_alloc(&ni1).unwrap();
    let pt = api::pt_alloc(&ni1, 0, Handle::NONE, PT_ANY).unwrap();
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: space.as_mut_ptr() as usize,
            length: 64,
            options: LE_OP_PUT | LE_EVENT_CT_COMM,
            match_bits: 0x2,
            ct: target_ct,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )
    .unwrap();

    let payload = [1u8; 8];
    let md = api::md_bind(
        &ni0,
        MdState {
            start: payload.as_ptr() as usize,
            length: 8,
            eq: Handle::NONE,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )
    .unwrap();

    let trigger = api::ct_alloc(&ni0).unwrap();
    api::ct_inc(
        &ni0,
        trigger,
        CtEvent {
            success: 5,
            failure: 0,
        },
    )
    .unwrap();

    api::triggered_put(
        &ni0,
        md,
        0,
        8,
        AckReq::None,
        Peer::Rank(3),
        pt,
        0x2,
        0,
        0,
        0,
        trigger,
        3,
    )
    .unwrap();

    let counted = api::ct_wait(&ni1, target_ct, 1).unwrap();
    assert_eq!(counted.success, 1);

    // Further increments must not re-fire it.
    api::ct_inc(
        &ni0,
        trigger,
        CtEvent {
            success: 5,
            failure: 0,
        },
    )
    .unwrap();
    assert_eq!(
        api::ct_poll(&ni1, &[target_ct], &[2], Duration::from_millis(100)).unwrap_err(),
        PtlError::CtNoneReached
    );

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// Triggered CT increments chain: one counter reaching its
/// threshold bumps the next.
#[test]
fn triggered_ct_inc_chains() {
    let (_gbl, ni0, ni1) = setup(4, 5);

    let first = api::ct_alloc(&ni0).unwrap();
    let second = api::ct_alloc(&ni0).unwrap();
    let third = api::ct_alloc(&ni0).unwrap();

    // first@2 -> second += 10; second@10 -> third += 1.
    api::triggered_ct_inc(
        &ni0,
        second,
        CtEvent {
            success: 10,
            failure: 0,
        },
        first,
        2,
    )
    .unwrap();
    api::triggered_ct_inc(
        &ni0,
        third,
        CtEvent {
            success: 1,
            failure: 0,
        },
        second,
        10,
    )
    .unwrap();

    api::ct_inc(&ni0, first, CtEvent { success: 1, failure: 0 }).unwrap();
    assert_eq!(api::ct_get(&ni0, third).unwrap().success, 0);

    api::ct_inc(&ni0, first, CtEvent { success: 1, failure: 0 }).unwrap();

    // The whole chain has run synchronously on this thread.
    assert_eq!(api::ct_get(&ni0, second).unwrap().success, 10);
    assert_eq!(api::ct_get(&ni0, third).unwrap().success, 1);

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}

/// ct_set replays thresholds against the new value and fires in
/// threshold order.
#[test]
fn ct_set_fires_in_order() {
    let (_gbl, ni0, ni1) = setup(6, 7);

    let trigger = api::ct_alloc(&ni0).unwrap();
    let low = api::ct_alloc(&ni0).unwrap();
    let high = api::ct_alloc(&ni0).unwrap();

    api::triggered_ct_inc(
        &ni0,
        high,
        CtEvent {
            success: 1,
            failure: 0,
        },
        trigger,
        7,
    )
    .unwrap();
    api::triggered_ct_inc(
        &ni0,
        low,
        CtEvent {
            success: 1,
            failure: 0,
        },
        trigger,
        3,
    )
    .unwrap();

    api::ct_set(
        &ni0,
        trigger,
        CtEvent {
            success: 5,
            failure: 0,
        },
    )
    .unwrap();

    // Only the low threshold fired.
    assert_eq!(api::ct_get(&ni0, low).unwrap().success, 1);
    assert_eq!(api::ct_get(&ni0, high).unwrap().success, 0);

    ni0.fini().unwrap();
    ni1.fini().unwrap();
}
