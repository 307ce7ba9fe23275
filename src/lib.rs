// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP/RTCP session engine which turns captured packets back into
//! elementary streams.
//!
//! A [`Session`] takes RTP and RTCP packets one at a time, in arrival order,
//! each tagged with its receive time. It tracks each synchronization source
//! (SSRC) separately: sequence numbers, interarrival jitter, and the
//! relationship between RTP timestamps and the sender's wallclock as
//! announced by RTCP sender reports. Packets are reordered in a small jitter
//! buffer and handed to a per-source depacketizer which writes an Annex B
//! byte stream (for H.264 and H.265) or raw payloads to a caller-supplied
//! sink.
//!
//! See [`codec`] for the supported payload formats.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use std::fmt::{Debug, Display};

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod bitstream;
pub mod codec;
mod error;
mod hex;
pub mod rtcp;
pub mod rtp;
pub mod session;

#[cfg(test)]
mod testutil;

pub use codec::{CodecName, PayloadDescriptor};
pub use error::Error;
pub use session::{PacketKind, PacketReport, Session, SessionOptions, SinkFactory};

/// Ticks per second of the local receive clock: times are in microseconds.
pub const CLOCK_FREQ: i64 = 1_000_000;

/// Context for an RTP or RTCP packet: enough to pick it out of the capture
/// it was read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketContext {
    /// The caller-assigned packet number, typically its index in the capture.
    pub number: u64,

    /// Receive time, in [`CLOCK_FREQ`] units from an arbitrary origin.
    pub received: i64,
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.received.div_euclid(CLOCK_FREQ);
        let micros = self.received.rem_euclid(CLOCK_FREQ);
        write!(f, "pkt #{}@{}.{:06}", self.number, secs, micros)
    }
}

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
///
/// NTP timestamps are in a fixed-point representation of seconds since
/// 0h UTC on 1 January 1900. The top 32 bits represent the integer part
/// (wrapping around every 68 years) and the bottom 32 bits represent the
/// fractional part.
///
/// This is a simple wrapper around a `u64` in that format, with a `Display`
/// impl that writes the timestamp as a human-readable string. Currently this
/// assumes the time is within 68 years of 1970; the string will be incorrect
/// after `2038-01-19T03:14:07Z`.
///
/// Reported NTP timestamps are allowed to jump backwards and/or be complete
/// nonsense; they are only ever used as opaque references.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Returns the time in [`CLOCK_FREQ`] units since the NTP epoch.
    pub fn to_clock(self) -> i64 {
        let secs = (self.0 >> 32) as i64;
        let frac = ((self.0 & 0xFFFF_FFFF) * CLOCK_FREQ as u64) >> 32;
        secs * CLOCK_FREQ + frac as i64
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let date_time: chrono::DateTime<chrono::Utc> = (*self).into();
        write!(f, "{}", date_time.format("%FT%T%.6f%:z"))
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl<TZ> From<NtpTimestamp> for chrono::DateTime<TZ>
where
    TZ: chrono::TimeZone,
    chrono::DateTime<TZ>: From<chrono::DateTime<chrono::Utc>>,
{
    fn from(orig: NtpTimestamp) -> Self {
        let since_epoch = orig.0.wrapping_sub(UNIX_EPOCH.0);
        let sec_since_epoch = (since_epoch >> 32) as u32;
        let frac_int = (since_epoch & 0xFFFF_FFFF) as u32;
        let frac = frac_int as f64 / f64::from(u32::MAX);
        let nanos = (frac * 1e9).round() as u32;
        let timedelta = chrono::Duration::seconds(sec_since_epoch.into())
            + chrono::Duration::nanoseconds(nanos.into());
        let date_time = chrono::DateTime::UNIX_EPOCH + timedelta;
        date_time.into()
    }
}
