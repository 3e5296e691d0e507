// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Loopback exerciser: two NIs in one process, rank 0 putting to
//! rank 1 and reading its own data back. Useful as a smoke test and
//! as a minimal example of driving the engine.

use clap::Parser;

use ptl_engine::api::{self, AckReq, LeInit};
use ptl_engine::ct::CtEvent;
use ptl_engine::le::{LE_EVENT_CT_BYTES, LE_EVENT_CT_COMM, LE_OP_GET, LE_OP_PUT};
use ptl_engine::md::MdState;
use ptl_engine::ni::{Ni, NiLimits, NiOptions};
use ptl_engine::pool::Handle;
use ptl_engine::pt::{ListPos, PT_ANY};
use ptl_engine::{init, GblOptions, Peer};

#[derive(Parser)]
struct Cli {
    /// Round trips to run.
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Payload size in bytes.
    #[arg(long, default_value_t = 1024)]
    size: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let gbl = init(GblOptions {
        nranks: 2,
        shm_name: None,
    })?;

    let ni0 = Ni::init(&gbl, NiOptions::matching_logical(0), NiLimits::default())?;
    let ni1 = Ni::init(&gbl, NiOptions::matching_logical(1), NiLimits::default())?;

    // Target side: one match entry over a scratch region, counting
    // received bytes.
    let mut target_buf = vec![0u8; args.size];
    let target_eq = api::eq_alloc(&ni1, 64)?;
    let target_ct = api::ct_alloc(&ni1)?;
    let pt = api::pt_alloc(&ni1, 0, target_eq, PT_ANY)?;
    api::append(
        &ni1,
        pt,
        &LeInit {
            start: target_buf.as_mut_ptr() as usize,
            length: args.size as u64,
            options: LE_OP_PUT | LE_OP_GET | LE_EVENT_CT_COMM | LE_EVENT_CT_BYTES,
            match_bits: 0x11,
            ct: target_ct,
            ..Default::default()
        },
        ListPos::Priority,
        0,
    )?;

    // Initiator side: a send region and a receive region.
    let send_buf: Vec<u8> = (0..args.size).map(|i| i as u8).collect();
    let mut recv_buf = vec![0u8; args.size];

    let init_eq = api::eq_alloc(&ni0, 64)?;
    let send_md = api::md_bind(
        &ni0,
        MdState {
            start: send_buf.as_ptr() as usize,
            length: args.size as u64,
            eq: init_eq,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )?;
    let recv_md = api::md_bind(
        &ni0,
        MdState {
            start: recv_buf.as_mut_ptr() as usize,
            length: args.size as u64,
            eq: init_eq,
            ct: Handle::NONE,
            options: 0,
            cookie: 0,
        },
    )?;

    let started = std::time::Instant::now();

    for i in 0..args.count {
        api::put(
            &ni0,
            send_md,
            0,
            args.size as u64,
            AckReq::Ack,
            Peer::Rank(1),
            pt,
            0x11,
            0,
            i as u64,
            0,
        )?;

        // SEND, then ACK.
        let _ = api::eq_wait(&ni0, init_eq)?;
        let _ = api::eq_wait(&ni0, init_eq)?;

        api::get(&ni0, recv_md, 0, args.size as u64, Peer::Rank(1), pt, 0x11, 0, i as u64)?;
        let _ = api::eq_wait(&ni0, init_eq)?; // SEND
        let _ = api::eq_wait(&ni0, init_eq)?; // REPLY

        assert_eq!(send_buf, recv_buf, "round {i}: payload mismatch");
        recv_buf.iter_mut().for_each(|b| *b = 0);
    }

    let elapsed = started.elapsed();
    let received = api::ct_get(&ni1, target_ct)?;
    assert_eq!(
        received,
        CtEvent {
            success: (args.count * args.size) as u64,
            failure: 0
        }
    );

    println!(
        "{} round trips of {} bytes in {:?} ({:.1} us/rt)",
        args.count,
        args.size,
        elapsed,
        elapsed.as_micros() as f64 / args.count as f64,
    );

    api::md_release(&ni0, send_md)?;
    api::md_release(&ni0, recv_md)?;
    api::eq_free(&ni0, init_eq)?;

    ni0.fini()?;
    ni1.fini()?;

    Ok(())
}
