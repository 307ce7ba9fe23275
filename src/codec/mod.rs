// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: payload type resolution and depacketization.
//!
//! Each RTP source is bound to exactly one [`PayloadBinding`] when its first
//! packet arrives. Static payload types (0-33) are resolved from the RTP/AVP
//! profile table of [RFC 3551](https://datatracker.ietf.org/doc/html/rfc3551#section-6);
//! dynamic ones need a caller-supplied [`PayloadDescriptor`].
//!
//! Depacketizers consume one RTP payload at a time, in sequence order, and
//! append whatever output it completes to a buffer:
//!
//! *   [`h264`]: Annex B byte stream per [RFC 6184](https://tools.ietf.org/html/rfc6184),
//!     with a timestamp SEI before each slice.
//! *   [`h265`]: Annex B byte stream per [RFC 7798](https://tools.ietf.org/html/rfc7798).
//! *   raw ("def"): payloads concatenated unchanged.
//! *   length-prefixed ("hpvc"): each payload behind its 4-byte little-endian length.

use std::num::NonZeroU32;
use std::str::FromStr;

use bytes::BytesMut;

use crate::error::ErrorInt;
use crate::Error;

pub mod h264;
pub mod h265;
mod simple;

/// The Annex B start code written before every NAL unit.
pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Clock rate assumed when a payload type can't be resolved.
const DEFAULT_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90_000) {
    Some(r) => r,
    None => unreachable!(),
};

/// Highest payload type with a static assignment in the RTP/AVP profile.
const MAX_STATIC_PAYLOAD_TYPE: u8 = 33;

/// Depacketizer selected by name in a [`PayloadDescriptor`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecName {
    /// `h264`
    H264,

    /// `h265`
    H265,

    /// `def`: the payload is written unchanged.
    Raw,

    /// `hpvc`: the payload is written behind a 4-byte little-endian length.
    LengthPrefixed,
}

impl CodecName {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecName::H264 => "h264",
            CodecName::H265 => "h265",
            CodecName::Raw => "def",
            CodecName::LengthPrefixed => "hpvc",
        }
    }
}

impl std::fmt::Display for CodecName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "h264" => CodecName::H264,
            "h265" => CodecName::H265,
            "def" => CodecName::Raw,
            "hpvc" => CodecName::LengthPrefixed,
            _ => bail!(ErrorInt::InvalidArgument(format!(
                "unknown codec name {s:?}; expected one of h264, h265, def, hpvc"
            ))),
        })
    }
}

/// Caller-supplied resolution of a dynamic payload type, as would otherwise
/// come from an SDP `a=rtpmap` line.
///
/// Parses from `<payload_type>:<frequency_hz>:<codec_name>`, e.g. `96:90000:h264`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PayloadDescriptor {
    pub payload_type: u8,
    pub clock_rate: NonZeroU32,
    pub codec: CodecName,
}

impl FromStr for PayloadDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(pt), Some(freq), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            bail!(ErrorInt::InvalidArgument(format!(
                "payload descriptor {s:?} isn't of the form pt:freq:codec"
            )));
        };
        let payload_type = match u8::from_str_radix(pt, 10) {
            Ok(p) if p > MAX_STATIC_PAYLOAD_TYPE && p < 128 => p,
            _ => bail!(ErrorInt::InvalidArgument(format!(
                "payload descriptor {s:?} has bad payload type {pt:?}; \
                 expected dynamic type {}-127",
                MAX_STATIC_PAYLOAD_TYPE + 1
            ))),
        };
        let clock_rate = match u32::from_str_radix(freq, 10).ok().and_then(NonZeroU32::new) {
            Some(c) => c,
            None => bail!(ErrorInt::InvalidArgument(format!(
                "payload descriptor {s:?} has bad frequency {freq:?}"
            ))),
        };
        Ok(PayloadDescriptor {
            payload_type,
            clock_rate,
            codec: name.parse()?,
        })
    }
}

impl std::fmt::Display for PayloadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.payload_type, self.clock_rate, self.codec)
    }
}

/// Static payload types of RFC 3551 section 6 which are recognized.
///
/// Only PCMU has a depacketizer; the others are sequenced at their nominal
/// clock rate but never written.
const STATIC_PAYLOAD_TYPES: [(u8, &str, u32, Option<CodecName>); 9] = [
    (0, "PCMU", 8_000, Some(CodecName::Raw)),
    (3, "GSM", 8_000, None),
    (8, "PCMA", 8_000, None),
    (10, "L16/2", 44_100, None),
    (11, "L16/1", 44_100, None),
    (12, "QCELP", 8_000, None),
    (14, "MPA", 90_000, None),
    (32, "MPV", 90_000, None),
    (33, "MP2T", 90_000, None),
];

/// A source's payload format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PayloadBinding {
    pub payload_type: u8,

    /// Human-readable encoding name, for logs.
    pub encoding_name: &'static str,

    pub clock_rate: NonZeroU32,

    /// The depacketizer, or `None` if packets are to be discarded after sequencing.
    pub codec: Option<CodecName>,
}

impl PayloadBinding {
    /// Resolves `payload_type` from the static table or `descriptors`.
    ///
    /// Returns `None` if neither knows it.
    pub fn autodetect(payload_type: u8, descriptors: &[PayloadDescriptor]) -> Option<Self> {
        if payload_type <= MAX_STATIC_PAYLOAD_TYPE {
            return STATIC_PAYLOAD_TYPES
                .iter()
                .find(|&&(pt, ..)| pt == payload_type)
                .map(|&(payload_type, encoding_name, clock_rate, codec)| PayloadBinding {
                    payload_type,
                    encoding_name,
                    clock_rate: NonZeroU32::new(clock_rate).unwrap_or(DEFAULT_CLOCK_RATE),
                    codec,
                });
        }
        descriptors
            .iter()
            .find(|d| d.payload_type == payload_type)
            .map(|d| PayloadBinding {
                payload_type,
                encoding_name: d.codec.as_str(),
                clock_rate: d.clock_rate,
                codec: Some(d.codec),
            })
    }

    /// The no-op binding used when autodetection fails.
    pub fn unknown(payload_type: u8) -> Self {
        PayloadBinding {
            payload_type,
            encoding_name: "unknown",
            clock_rate: DEFAULT_CLOCK_RATE,
            codec: None,
        }
    }
}

/// What a depacketizer needs to know about a packet besides its payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PayloadMeta {
    /// The RTP timestamp.
    pub timestamp: u32,

    /// True iff one or more packets immediately before this one were lost.
    pub discontinuity: bool,
}

/// A source's depacketizer, chosen by its [`PayloadBinding`].
#[derive(Debug)]
pub(crate) enum Depacketizer {
    None,
    H264(h264::Depacketizer),
    H265(h265::Depacketizer),
    Simple(simple::Depacketizer),
}

impl Depacketizer {
    pub(crate) fn new(codec: Option<CodecName>) -> Self {
        match codec {
            None => Depacketizer::None,
            Some(CodecName::H264) => Depacketizer::H264(h264::Depacketizer::new()),
            Some(CodecName::H265) => Depacketizer::H265(h265::Depacketizer::new()),
            Some(CodecName::Raw) => Depacketizer::Simple(simple::Depacketizer::new(false)),
            Some(CodecName::LengthPrefixed) => {
                Depacketizer::Simple(simple::Depacketizer::new(true))
            }
        }
    }

    /// Returns false for the no-op depacketizer, which needs no output sink.
    pub(crate) fn produces_output(&self) -> bool {
        !matches!(self, Depacketizer::None)
    }

    /// Appends the output completed by this packet to `out`.
    ///
    /// On error, the packet (or the part of it not yet appended) is dropped;
    /// the depacketizer remains usable.
    pub(crate) fn push(
        &mut self,
        meta: PayloadMeta,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), String> {
        match self {
            Depacketizer::None => Ok(()),
            Depacketizer::H264(d) => d.push(meta, payload, out),
            Depacketizer::H265(d) => d.push(meta, payload, out),
            Depacketizer::Simple(d) => {
                d.push(payload, out);
                Ok(())
            }
        }
    }
}
