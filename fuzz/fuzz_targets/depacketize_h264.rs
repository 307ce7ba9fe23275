// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rtpdepay::codec::{h264::Depacketizer, PayloadMeta};

fuzz_target!(|data: &[u8]| {
    let mut data = data;
    let mut depacketizer = Depacketizer::new();
    let mut timestamp = 0u32;
    let mut out = BytesMut::new();
    loop {
        let Some((hdr, rest)) = data.split_first() else {
            return;
        };
        let ts_change = (hdr & 0b001) != 0;
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            return;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        if ts_change {
            timestamp = timestamp.wrapping_add(1);
        }
        let meta = PayloadMeta {
            timestamp,
            discontinuity: loss,
        };
        let _ = depacketizer.push(meta, payload, &mut out);
        assert!(out.is_empty() || out.starts_with(b"\x00\x00\x00\x01"));
    }
});
