// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! with RTP encoding as in [RFC 6184](https://tools.ietf.org/html/rfc6184).

use bytes::{BufMut, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};
use log::{debug, trace};

use super::{PayloadMeta, START_CODE};
use crate::bitstream;

/// UUID of the `user_data_unregistered` SEI carrying each slice's RTP timestamp.
const TIMESTAMP_SEI_UUID: [u8; 16] = [
    0xdc, 0x45, 0xe9, 0xbd, 0xe6, 0xd9, 0x48, 0xb7, 0x96, 0x2c, 0xd8, 0x20, 0xd9, 0x23, 0xee, 0xef,
];

/// Room for the NAL header, SEI header, UUID, a `u32` in decimal with its
/// NUL terminator, and the trailing bits.
const TIMESTAMP_SEI_CAPACITY: usize = 64;

/// `payloadType` of `user_data_unregistered`, H.264 Annex D.
const SEI_USER_DATA_UNREGISTERED: u32 = 5;

/// A depacketizer which writes unfragmented NAL units as an Annex B byte
/// stream.
///
/// It handles all the packetization modes of RFC 6184: single NAL unit
/// packets, STAP-A/B, MTAP16/24, and FU-A/B. The contents of NAL units aren't
/// inspected beyond their headers, and NAL units are written in transmission
/// order even in interleaved mode.
///
/// Before each slice (NAL types 1-5), a synthetic SEI NAL unit is written which
/// carries the slice's RTP timestamp as a decimal string; see
/// [`timestamp_sei`].
#[derive(Debug)]
pub struct Depacketizer {
    state: State,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    /// Between NAL units.
    AwaitingStart,

    /// A FU-A/FU-B start fragment has been written; its continuation
    /// fragments append to it. Holds the reconstructed NAL header.
    InFragment(u8),
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            state: State::AwaitingStart,
        }
    }

    /// Appends the output completed by this packet's `payload` to `out`.
    pub fn push(
        &mut self,
        meta: PayloadMeta,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), String> {
        let Some(&indicator) = payload.first() else {
            return Err("empty H.264 payload".into());
        };
        if meta.discontinuity {
            if let State::InFragment(hdr) = self.state {
                debug!("loss within fragmented NAL with header {hdr:02x}; abandoning it");
                self.state = State::AwaitingStart;
            }
        }
        match indicator & 0b0001_1111 {
            24 => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                self.end_fragment("STAP-A");
                self.aggregate(meta, &payload[1..], 0, out)
            }
            25 => {
                // STAP-B: the aggregation header is followed by a 16-bit DON.
                self.end_fragment("STAP-B");
                let data = payload
                    .get(3..)
                    .ok_or_else(|| format!("STAP-B too short: {} bytes", payload.len()))?;
                self.aggregate(meta, data, 0, out)
            }
            t @ (26 | 27) => {
                // MTAP16/MTAP24. https://tools.ietf.org/html/rfc6184#section-5.7.2
                // A 16-bit DONB, then per unit an 8-bit DOND and a 16- or
                // 24-bit timestamp offset between the size and the NAL.
                let name = if t == 26 { "MTAP16" } else { "MTAP24" };
                self.end_fragment(name);
                let data = payload
                    .get(3..)
                    .ok_or_else(|| format!("{name} too short: {} bytes", payload.len()))?;
                let extra = if t == 26 { 3 } else { 4 };
                self.aggregate(meta, data, extra, out)
            }
            28 => self.fragment(meta, payload, false, out),
            29 => self.fragment(meta, payload, true, out),
            _ => {
                // Single NAL unit packet. Types 0, 30, and 31 are undefined
                // but passed through as well.
                self.end_fragment("single NAL unit");
                write_nal(meta, payload, out)
            }
        }
    }

    /// Abandons any fragment in progress before a non-fragment packet.
    fn end_fragment(&mut self, what: &str) {
        if let State::InFragment(hdr) = self.state {
            debug!("{what} while fragmented NAL with header {hdr:02x} in progress; ending it");
            self.state = State::AwaitingStart;
        }
    }

    /// Splits STAP/MTAP aggregation units, each a 16-bit size, `extra`
    /// bytes of per-unit fields, and the NAL unit.
    fn aggregate(
        &mut self,
        meta: PayloadMeta,
        mut data: &[u8],
        extra: usize,
        out: &mut BytesMut,
    ) -> Result<(), String> {
        if data.is_empty() {
            return Err("aggregation packet has no units".into());
        }
        while !data.is_empty() {
            if data.len() < 2 + extra {
                return Err(format!(
                    "aggregation packet has {} remaining bytes; expecting {}-byte unit header",
                    data.len(),
                    2 + extra
                ));
            }
            let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
            data = &data[2 + extra..];
            if len == 0 {
                return Err("zero length NAL in aggregation packet".into());
            }
            if data.len() < len {
                return Err(format!(
                    "aggregation packet too short: {} bytes remaining, expecting {}-byte NAL",
                    data.len(),
                    len
                ));
            }
            let (nal, rest) = data.split_at(len);
            write_nal(meta, nal, out)?;
            data = rest;
        }
        Ok(())
    }

    /// Handles a FU-A (RFC 6184 section 5.8) or FU-B fragment.
    ///
    /// ```text
    /// FU indicator    FU header
    /// +---------------+---------------+
    /// |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |F|NRI|  Type   |S|E|R|  Type   |
    /// +---------------+---------------+
    /// ```
    ///
    /// A FU-B has a 16-bit DON after the FU header and may only be used for
    /// the first fragment.
    fn fragment(
        &mut self,
        meta: PayloadMeta,
        payload: &[u8],
        fu_b: bool,
        out: &mut BytesMut,
    ) -> Result<(), String> {
        let kind = if fu_b { "FU-B" } else { "FU-A" };
        let header_len = if fu_b { 4 } else { 2 };
        if payload.len() < header_len {
            return Err(format!("{kind} too short: {} bytes", payload.len()));
        }
        let fu_header = payload[1];
        let start = (fu_header & 0b1000_0000) != 0;
        let end = (fu_header & 0b0100_0000) != 0;
        let nal_header = (payload[0] & 0b1110_0000) | (fu_header & 0b0001_1111);
        let data = &payload[header_len..];
        if start && end {
            self.state = State::AwaitingStart;
            return Err(format!(
                "{kind} with both start and end bits set, header {nal_header:02x}"
            ));
        }
        if start {
            self.end_fragment(kind);
            if is_slice(nal_header) {
                write_timestamp_sei(meta.timestamp, out)?;
            }
            out.put_slice(&START_CODE);
            out.put_u8(nal_header);
            out.put_slice(data);
            self.state = State::InFragment(nal_header);
            return Ok(());
        }
        if fu_b {
            self.state = State::AwaitingStart;
            return Err("FU-B without start bit".into());
        }
        match self.state {
            State::AwaitingStart => {
                Err(format!("FU-A continuation of {nal_header:02x} without start; dropping"))
            }
            State::InFragment(hdr) => {
                if hdr != nal_header {
                    trace!("FU-A header changed mid-NAL from {hdr:02x} to {nal_header:02x}");
                }
                out.put_slice(data);
                if end {
                    self.state = State::AwaitingStart;
                }
                Ok(())
            }
        }
    }
}

/// Returns true iff `nal_header` is a slice type's (1-5).
///
/// A header with the forbidden zero bit set is not a slice.
fn is_slice(nal_header: u8) -> bool {
    match NalHeader::new(nal_header) {
        Ok(h) => matches!(
            h.nal_unit_type(),
            UnitType::SliceLayerWithoutPartitioningNonIdr
                | UnitType::SliceDataPartitionALayer
                | UnitType::SliceDataPartitionBLayer
                | UnitType::SliceDataPartitionCLayer
                | UnitType::SliceLayerWithoutPartitioningIdr
        ),
        Err(_) => false,
    }
}

/// Writes a complete NAL unit, preceded by a timestamp SEI if it's a slice.
fn write_nal(meta: PayloadMeta, nal: &[u8], out: &mut BytesMut) -> Result<(), String> {
    if is_slice(nal[0]) {
        write_timestamp_sei(meta.timestamp, out)?;
    }
    out.put_slice(&START_CODE);
    out.put_slice(nal);
    Ok(())
}

fn write_timestamp_sei(timestamp: u32, out: &mut BytesMut) -> Result<(), String> {
    let sei = timestamp_sei(timestamp)
        .map_err(|e| format!("unable to build timestamp SEI: {e}"))?;
    out.put_slice(&START_CODE);
    out.put_slice(&sei);
    Ok(())
}

/// Builds the SEI NAL unit (without start code) which carries `timestamp`.
///
/// It holds one `user_data_unregistered` message: the 16-byte
/// [`TIMESTAMP_SEI_UUID`] then the timestamp as a NUL-terminated decimal
/// string.
pub fn timestamp_sei(timestamp: u32) -> Result<Vec<u8>, bitstream::Error> {
    let text = timestamp.to_string();
    let mut w = bitstream::Writer::with_capacity(TIMESTAMP_SEI_CAPACITY);
    w.write(8, 0x06)?; // nal_ref_idc=0, nal_unit_type=6 (SEI)
    write_sei_value(&mut w, SEI_USER_DATA_UNREGISTERED as usize)?;
    write_sei_value(&mut w, TIMESTAMP_SEI_UUID.len() + text.len() + 1)?;
    for &b in TIMESTAMP_SEI_UUID.iter().chain(text.as_bytes()) {
        w.write(8, b.into())?;
    }
    w.write(8, 0)?;
    w.rbsp_trailing_bits()?;
    w.finish()
}

/// Writes an SEI `payloadType` or `payloadSize`: a run of `0xff` bytes for
/// each full 255, then the remainder.
fn write_sei_value(w: &mut bitstream::Writer, mut value: usize) -> Result<(), bitstream::Error> {
    while value >= 255 {
        w.write(8, 0xff)?;
        value -= 255;
    }
    w.write(8, value as u32)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::testutil::{assert_eq_hex, init_logging};

    const META: PayloadMeta = PayloadMeta {
        timestamp: 1000,
        discontinuity: false,
    };

    /// Timestamp SEI for `META`, including start code.
    const SEI_1000: &[u8] = b"\x00\x00\x00\x01\x06\x05\x15\
                              \xdc\x45\xe9\xbd\xe6\xd9\x48\xb7\
                              \x96\x2c\xd8\x20\xd9\x23\xee\xef\
                              1000\x00\x80";

    fn push(
        d: &mut Depacketizer,
        meta: PayloadMeta,
        payload: &[u8],
    ) -> (Result<(), String>, Vec<u8>) {
        let mut out = BytesMut::new();
        let r = d.push(meta, payload, &mut out);
        (r, out.to_vec())
    }

    #[test]
    fn sei_bytes() {
        assert_eq_hex!(timestamp_sei(1000).unwrap(), SEI_1000[4..]);
        let max = timestamp_sei(u32::MAX).unwrap();
        assert_eq!(max[2], 16 + 10 + 1);
        assert_eq!(&max[19..30], b"4294967295\x00");
        assert_eq!(max.last(), Some(&0x80));
    }

    #[test]
    fn sei_size_quanta() {
        for (value, expected) in [
            (0, &b"\x00"[..]),
            (254, &b"\xfe"[..]),
            (255, &b"\xff\x00"[..]),
            (300, &b"\xff\x2d"[..]),
            (510, &b"\xff\xff\x00"[..]),
        ] {
            let mut w = bitstream::Writer::with_capacity(4);
            write_sei_value(&mut w, value).unwrap();
            assert_eq!(w.finish().unwrap(), expected, "value={value}");
        }
    }

    #[test]
    fn single_nal() {
        init_logging();
        let mut d = Depacketizer::new();

        // Non-slice: written as-is.
        let (r, out) = push(&mut d, META, b"\x67sps");
        r.unwrap();
        assert_eq_hex!(out, b"\x00\x00\x00\x01\x67sps");

        // Slice: preceded by the timestamp SEI.
        let (r, out) = push(&mut d, META, b"\x65idr slice");
        r.unwrap();
        let mut expected = SEI_1000.to_vec();
        expected.extend_from_slice(b"\x00\x00\x00\x01\x65idr slice");
        assert_eq_hex!(out, expected);

        // Forbidden bit set: passed through without SEI.
        let (r, out) = push(&mut d, META, b"\xe1bad");
        r.unwrap();
        assert_eq_hex!(out, b"\x00\x00\x00\x01\xe1bad");

        let (r, out) = push(&mut d, META, b"");
        assert!(r.is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn stap_a() {
        init_logging();
        let mut d = Depacketizer::new();
        let mut payload = vec![0x18, 0x00, 0x0a];
        payload.extend_from_slice(b"\x67sps-12345");
        payload.extend_from_slice(b"\x00\x14");
        payload.extend_from_slice(b"\x68pps-123456789012345");
        let (r, out) = push(&mut d, META, &payload);
        r.unwrap();
        assert_eq_hex!(
            out,
            b"\x00\x00\x00\x01\x67sps-12345\
              \x00\x00\x00\x01\x68pps-123456789012345"
        );
        assert_eq!(out.len(), 4 + 10 + 4 + 20);
    }

    #[test]
    fn stap_a_truncated() {
        init_logging();
        let mut d = Depacketizer::new();

        // The second unit claims 0x20 bytes but has 4.
        let (r, out) = push(&mut d, META, b"\x18\x00\x04\x67sps\x00\x20\x68pps");
        assert!(r.is_err());
        assert_eq_hex!(out, b"\x00\x00\x00\x01\x67sps");

        // A lone size byte.
        let (r, _) = push(&mut d, META, b"\x18\x00\x04\x67sps\x00");
        assert!(r.is_err());
        let (r, _) = push(&mut d, META, b"\x18");
        assert!(r.is_err());
    }

    #[test]
    fn stap_b() {
        let mut d = Depacketizer::new();
        let (r, out) = push(&mut d, META, b"\x19\x12\x34\x00\x04\x67sps\x00\x04\x41abc");
        r.unwrap();
        let mut expected = b"\x00\x00\x00\x01\x67sps".to_vec();
        expected.extend_from_slice(SEI_1000);
        expected.extend_from_slice(b"\x00\x00\x00\x01\x41abc");
        assert_eq_hex!(out, expected);
    }

    #[test]
    fn mtap() {
        let mut d = Depacketizer::new();

        // MTAP16: DONB, then size, DOND, 16-bit TS offset.
        let (r, out) = push(
            &mut d,
            META,
            b"\x1a\x00\x01\x00\x03\x07\x00\x10\x67ab\x00\x02\x08\x00\x20\x68c",
        );
        r.unwrap();
        assert_eq_hex!(out, b"\x00\x00\x00\x01\x67ab\x00\x00\x00\x01\x68c");

        // MTAP24: 24-bit TS offset.
        let (r, out) = push(
            &mut d,
            META,
            b"\x1b\x00\x01\x00\x03\x07\x00\x00\x10\x67ab",
        );
        r.unwrap();
        assert_eq_hex!(out, b"\x00\x00\x00\x01\x67ab");

        let (r, _) = push(&mut d, META, b"\x1b\x00\x01\x00\x03\x07\x00\x00");
        assert!(r.is_err());
    }

    #[test]
    fn fu_a() {
        init_logging();
        let mut d = Depacketizer::new();

        // NRI=3, type=28; S=1, type=5.
        let (r, out1) = push(&mut d, META, b"\x7c\x85first ");
        r.unwrap();
        let (r, out2) = push(&mut d, META, b"\x7c\x05middle ");
        r.unwrap();
        let (r, out3) = push(&mut d, META, b"\x7c\x45last");
        r.unwrap();
        let mut expected = SEI_1000.to_vec();
        expected.extend_from_slice(b"\x00\x00\x00\x01\x65first middle last");
        assert_eq_hex!([out1, out2, out3].concat(), expected);
        assert_eq!(d.state, State::AwaitingStart);
    }

    #[test]
    fn fu_a_without_start() {
        init_logging();
        let mut d = Depacketizer::new();
        let (r, out) = push(&mut d, META, b"\x7c\x05middle");
        assert!(r.is_err());
        assert!(out.is_empty());
        let (r, out) = push(&mut d, META, b"\x7c\x45end");
        assert!(r.is_err());
        assert!(out.is_empty());

        // A new start recovers.
        let (r, out) = push(&mut d, META, b"\x7c\x81start");
        r.unwrap();
        assert!(out.ends_with(b"\x00\x00\x00\x01\x61start"));
    }

    #[test]
    fn fu_a_after_loss() {
        init_logging();
        let mut d = Depacketizer::new();
        let (r, _) = push(&mut d, META, b"\x5c\x81start");
        r.unwrap();
        let lossy = PayloadMeta {
            discontinuity: true,
            ..META
        };
        let (r, out) = push(&mut d, lossy, b"\x5c\x41end");
        assert!(r.is_err());
        assert!(out.is_empty());
        assert_eq!(d.state, State::AwaitingStart);
    }

    #[test]
    fn fu_start_and_end() {
        let mut d = Depacketizer::new();
        let (r, out) = push(&mut d, META, b"\x7c\xc5both");
        assert!(r.is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn fu_b() {
        init_logging();
        let mut d = Depacketizer::new();

        // FU-B must start a fragmented NAL.
        let (r, out) = push(&mut d, META, b"\x7d\x05\x00\x01middle");
        assert!(r.is_err());
        assert!(out.is_empty());

        // Start (with DON), then FU-A continuation.
        let (r, out1) = push(&mut d, META, b"\x7d\x87\x00\x01sps ");
        r.unwrap();
        let (r, out2) = push(&mut d, META, b"\x7c\x47end");
        r.unwrap();
        assert_eq_hex!([out1, out2].concat(), b"\x00\x00\x00\x01\x67sps end");
    }

    #[test]
    fn single_nal_ends_fragment() {
        init_logging();
        let mut d = Depacketizer::new();
        push(&mut d, META, b"\x7c\x87start").0.unwrap();
        let (r, out) = push(&mut d, META, b"\x68pps");
        r.unwrap();
        assert_eq_hex!(out, b"\x00\x00\x00\x01\x68pps");
        let (r, _) = push(&mut d, META, b"\x7c\x47end");
        assert!(r.is_err());
    }
}
