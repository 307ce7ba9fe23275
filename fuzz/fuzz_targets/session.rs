// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feeds arbitrary RTP and RTCP packets through a session.
//!
//! Input is a sequence of `<flags> <len_hi> <len_lo> <packet>` records. Bit 0
//! of the flags selects RTCP; the remaining bits advance the receive clock
//! in milliseconds.

#![no_main]
use std::io::{self, Write};

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rtpdepay::{PacketKind, Session, SessionOptions};

fuzz_target!(|data: &[u8]| {
    let factory = |_: u32, _: u8| -> io::Result<Box<dyn Write>> { Ok(Box::new(io::sink())) };
    let mut session = Session::new(
        ["96:90000:h264", "97:90000:h265", "98:8000:def", "99:8000:hpvc"]
            .iter()
            .map(|d| d.parse().unwrap())
            .collect(),
        SessionOptions::default().max_dropout(100).max_misorder(100),
        Box::new(factory),
    )
    .unwrap();
    let mut data = data;
    let mut received = 0i64;
    let mut number = 0u64;
    while let Some((&[flags, len_hi, len_lo], rest)) = data.split_first_chunk::<3>() {
        let len = usize::from(u16::from_be_bytes([len_hi, len_lo]));
        if rest.len() < len {
            break;
        }
        let (pkt, rest) = rest.split_at(len);
        data = rest;
        received += i64::from(flags >> 1) * 1_000;
        let kind = if flags & 1 != 0 {
            PacketKind::Rtcp
        } else {
            PacketKind::Rtp
        };
        if let Err(e) = session.process(number, received, Bytes::copy_from_slice(pkt), kind) {
            assert!(e.is_packet_error(), "{e}");
        }
        number += 1;
    }
    session.flush().unwrap();
});
