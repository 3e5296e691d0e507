// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use ptl_protocol::*;

/// Compose a whole Put request the way the initiator does (common
/// header, request tail, descriptor) and take it back apart the way
/// the target does.
#[test]
fn whole_request_round_trip() {
    let payload = b"forty-two bytes of payload for the test...";

    let common = CommonHdr::new(
        Op::Put,
        NiKind::LogicalMatch,
        PktFmt::Inline,
        payload.len() as u64,
    );
    let req = ReqHdr {
        src_nid: 1,
        src_pid: 4,
        uid: 501,
        pt_index: 0,
        match_bits: 0xaa,
        hdr_data: 0xbeef,
        rlength: payload.len() as u64,
        roffset: 0,
        ack_req: hdr::ACK_REQ_ACK,
        ..Default::default()
    };

    let mut msg = Vec::new();
    common.serialize(&mut msg);
    req.serialize(&mut msg);
    Data::Inline(payload.to_vec()).serialize(&mut msg);

    let mut rest = msg.as_slice();
    let common2 = CommonHdr::deserialize(&mut rest).unwrap();
    assert_eq!(common, common2);
    assert!(common2.op.is_request());

    let req2 = ReqHdr::deserialize(&mut rest).unwrap();
    assert_eq!(req, req2);

    let Data::Inline(bytes) = Data::deserialize(&mut rest).unwrap() else {
        panic!("expected inline data");
    };
    assert_eq!(bytes.as_slice(), payload);
    assert!(rest.is_empty());
}

/// A reply travels the other way: common header, ack tail, then the
/// fetched bytes.
#[test]
fn whole_reply_round_trip() {
    let common = CommonHdr::new(Op::Reply, NiKind::LogicalMatch, PktFmt::Inline, 8);
    let ack = AckHdr {
        handle: 7,
        mlength: 8,
        moffset: 0,
        ni_fail: 0,
        overflow: 0,
    };

    let mut msg = Vec::new();
    common.serialize(&mut msg);
    ack.serialize(&mut msg);
    msg.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());

    let mut rest = msg.as_slice();
    let common2 = CommonHdr::deserialize(&mut rest).unwrap();
    assert!(common2.op.is_response());

    let ack2 = AckHdr::deserialize(&mut rest).unwrap();
    assert_eq!(ack, ack2);
    assert_eq!(rest.len(), 8);
}
