// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session's RTCP clock reference.

use std::num::NonZeroU32;

use crate::{NtpTimestamp, CLOCK_FREQ};

/// The most recent RTCP Sender Report of the session's reporting source.
///
/// It maps the sender's RTP clock onto the local receive clock: at local time
/// `received`, the sender's media clock read `rtp_timestamp` and its
/// wallclock read `ntp_timestamp`.
#[derive(Clone, Debug)]
pub struct RtcpSource {
    ssrc: u32,
    ntp_timestamp: NtpTimestamp,
    rtp_timestamp: u32,
    received: i64,
    reports: u64,
}

impl RtcpSource {
    pub(crate) fn new(
        ssrc: u32,
        ntp_timestamp: NtpTimestamp,
        rtp_timestamp: u32,
        received: i64,
    ) -> Self {
        RtcpSource {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            received,
            reports: 1,
        }
    }

    /// Replaces the reference with a newer Sender Report from the same SSRC.
    pub(crate) fn update(&mut self, ntp_timestamp: NtpTimestamp, rtp_timestamp: u32, received: i64) {
        self.ntp_timestamp = ntp_timestamp;
        self.rtp_timestamp = rtp_timestamp;
        self.received = received;
        self.reports += 1;
    }

    /// The SSRC whose Sender Reports are used.
    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[inline]
    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        self.ntp_timestamp
    }

    #[inline]
    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    /// Local receive time of the latest Sender Report.
    #[inline]
    pub fn received(&self) -> i64 {
        self.received
    }

    /// Number of Sender Reports applied.
    #[inline]
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// Projects the sender's RTP clock (at `clock_rate`) to local time `now`,
    /// assuming it advanced in step with the local clock since the report.
    pub(crate) fn rtp_timestamp_at(&self, now: i64, clock_rate: NonZeroU32) -> u32 {
        let elapsed = now.saturating_sub(self.received);
        let advance = elapsed.saturating_mul(i64::from(clock_rate.get())) / CLOCK_FREQ;
        self.rtp_timestamp.wrapping_add(advance as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection() {
        let freq = NonZeroU32::new(90_000).unwrap();
        let mut c = RtcpSource::new(1, NtpTimestamp(0), 9_000, 100_000);
        assert_eq!(c.rtp_timestamp_at(100_000, freq), 9_000);
        assert_eq!(c.rtp_timestamp_at(200_000, freq), 18_000);
        assert_eq!(c.rtp_timestamp_at(0, freq), 0);

        // Wraps like the RTP timestamp itself.
        c.update(NtpTimestamp(1), u32::MAX - 8_999, 100_000);
        assert_eq!(c.rtp_timestamp_at(200_000, freq), 0);
        assert_eq!(c.reports(), 2);
        assert_eq!(c.ntp_timestamp(), NtpTimestamp(1));
    }
}
