// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video,
//! with RTP encoding as in [RFC 7798](https://tools.ietf.org/html/rfc7798).

use bytes::{BufMut, BytesMut};
use log::debug;

use super::{PayloadMeta, START_CODE};

/// Aggregation Packet, RFC 7798 section 4.4.2.
const AP: u8 = 48;

/// Fragmentation Unit, RFC 7798 section 4.4.3.
const FU: u8 = 49;

/// PAyload Content Information, RFC 7798 section 4.4.4.
const PACI: u8 = 50;

/// `nal_unit_header` as in T.REC H.265 section 7.3.1.2.
///
/// ```text
/// +---------------+---------------+
/// |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |F|   Type    |  LayerId  | TID |
/// +-------------+-----------------+
/// ```
#[derive(Copy, Clone, PartialEq, Eq)]
struct Header([u8; 2]);

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x} (type {})", self.0[0], self.0[1], self.unit_type())
    }
}

impl Header {
    fn unit_type(self) -> u8 {
        (self.0[0] >> 1) & 0b11_1111
    }

    /// Returns a new header of the given unit type, as when reconstructing a
    /// fragmented NAL's header from the FU payload header.
    fn with_unit_type(self, t: u8) -> Self {
        let mut out = self.0;
        out[0] = (out[0] & 0b1000_0001) | ((t & 0b11_1111) << 1);
        Self(out)
    }
}

/// A depacketizer which writes unfragmented NAL units as an Annex B byte
/// stream.
///
/// Handles single NAL unit packets, Aggregation Packets, and Fragmentation
/// Units. DONL/DOND fields (present only when `sprop-max-don-diff` is
/// non-zero, which can't be signalled here) aren't supported. PACI packets
/// are skipped.
#[derive(Debug)]
pub struct Depacketizer {
    state: State,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    AwaitingStart,

    /// Within a fragmented NAL whose reconstructed header has been written.
    InFragment(Header),
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
        let Some((&hdr, data)) = payload.split_first_chunk::<2>() else {
            return Err(format!("H.265 payload too short: {} bytes", payload.len()));
        };
        let hdr = Header(hdr);
        if meta.discontinuity {
            if let State::InFragment(h) = self.state {
                debug!("loss within fragmented NAL {h:?}; abandoning it");
                self.state = State::AwaitingStart;
            }
        }
        match hdr.unit_type() {
            AP => {
                self.end_fragment(hdr);
                if data.is_empty() {
                    return Err("AP has no units".into());
                }
                let mut data = data;
                while !data.is_empty() {
                    let Some((&len, rest)) = data.split_first_chunk::<2>() else {
                        return Err(format!(
                            "AP has {} remaining bytes; expecting 2-byte length",
                            data.len()
                        ));
                    };
                    let len = usize::from(u16::from_be_bytes(len));
                    if len < 2 || rest.len() < len {
                        return Err(format!(
                            "AP unit length {len} invalid with {} bytes remaining",
                            rest.len()
                        ));
                    }
                    let (nal, rest) = rest.split_at(len);
                    out.put_slice(&START_CODE);
                    out.put_slice(nal);
                    data = rest;
                }
                Ok(())
            }
            FU => {
                // https://datatracker.ietf.org/doc/html/rfc7798#section-4.4.3
                //  +---------------+
                //  |0|1|2|3|4|5|6|7|
                //  +-+-+-+-+-+-+-+-+
                //  |S|E|  FuType   |
                //  +---------------+
                let Some((&fu_header, data)) = data.split_first() else {
                    return Err("FU has no header".into());
                };
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let nal_hdr = hdr.with_unit_type(fu_header & 0b11_1111);
                if start && end {
                    self.state = State::AwaitingStart;
                    return Err(format!("FU {nal_hdr:?} with both start and end bits set"));
                }
                if start {
                    self.end_fragment(nal_hdr);
                    out.put_slice(&START_CODE);
                    out.put_slice(&nal_hdr.0);
                    out.put_slice(data);
                    self.state = State::InFragment(nal_hdr);
                    return Ok(());
                }
                match self.state {
                    State::AwaitingStart => {
                        Err(format!("FU continuation of {nal_hdr:?} without start; dropping"))
                    }
                    State::InFragment(h) => {
                        if h != nal_hdr {
                            debug!("FU header changed mid-NAL from {h:?} to {nal_hdr:?}");
                        }
                        out.put_slice(data);
                        if end {
                            self.state = State::AwaitingStart;
                        }
                        Ok(())
                    }
                }
            }
            PACI => {
                self.end_fragment(hdr);
                debug!("skipping PACI packet {hdr:?}");
                Ok(())
            }
            _ => {
                self.end_fragment(hdr);
                out.put_slice(&START_CODE);
                out.put_slice(payload);
                Ok(())
            }
        }
    }

    fn end_fragment(&mut self, next: Header) {
        if let State::InFragment(h) = self.state {
            debug!("{next:?} while fragmented NAL {h:?} in progress; ending it");
            self.state = State::AwaitingStart;
        }
    }
}
