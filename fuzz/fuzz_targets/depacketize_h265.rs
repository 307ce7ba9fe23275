// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rtpdepay::codec::{h265::Depacketizer, PayloadMeta};

fuzz_target!(|data: &[u8]| {
    let mut data = data;
    let mut depacketizer = Depacketizer::new();
    let mut out = BytesMut::new();
    loop {
        let Some((hdr, rest)) = data.split_first() else {
            return;
        };
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            return;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        let meta = PayloadMeta {
            timestamp: 0,
            discontinuity: loss,
        };
        let _ = depacketizer.push(meta, payload, &mut out);
        assert!(out.is_empty() || out.starts_with(b"\x00\x00\x00\x01"));
    }
});
