// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP/RTCP session: demultiplexing by SSRC, jitter buffering, and output.

use std::fmt::Display;
use std::io::{self, Write};

use bytes::Bytes;
use log::{debug, info, log_enabled, trace, warn, Level};

use crate::codec::{Depacketizer, PayloadBinding, PayloadDescriptor};
use crate::error::ErrorInt;
use crate::rtp::{Block, RawPacket};
use crate::{rtcp, Error, NtpTimestamp, PacketContext, CLOCK_FREQ};

mod control;
mod source;

pub use control::RtcpSource;
pub use source::RtpSource;

/// Target of the per-packet report rows logged when
/// [`SessionOptions::report_packets`] is set.
pub const REPORT_TARGET: &str = "rtpdepay::report";

/// Largest sequence number distance which is unambiguously ahead or behind.
/// Released packets half the sequence space or more behind are late.
const MAX_SEQUENCE_WINDOW: u16 = 0x7fff;

/// Whether a packet arrived on the RTP or RTCP port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    /// Classifies a packet by UDP port, following the RTP convention of an
    /// even port for media and the next (odd) port for control.
    pub fn for_port(port: u16) -> Self {
        if port % 2 == 1 {
            PacketKind::Rtcp
        } else {
            PacketKind::Rtp
        }
    }
}

impl Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketKind::Rtp => "RTP",
            PacketKind::Rtcp => "RTCP",
        })
    }
}

/// Options which apply to all sources in a [`Session`].
#[derive(Copy, Clone, Debug)]
pub struct SessionOptions {
    max_dropout: u16,
    max_misorder: u16,
    min_playout_delay: i64,
    report_packets: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_dropout: 1000,
            max_misorder: 1000,
            min_playout_delay: CLOCK_FREQ / 40,
            report_packets: false,
        }
    }
}

impl SessionOptions {
    /// Sets the largest forward jump in sequence numbers accepted without
    /// confirmation. Defaults to 1000; values above 0x7fff are clamped.
    pub fn max_dropout(self, max_dropout: u16) -> Self {
        Self {
            max_dropout: max_dropout.min(MAX_SEQUENCE_WINDOW),
            ..self
        }
    }

    /// Sets the largest backward jump in sequence numbers accepted without
    /// confirmation. Defaults to 1000; values above 0x7fff are clamped.
    pub fn max_misorder(self, max_misorder: u16) -> Self {
        Self {
            max_misorder: max_misorder.min(MAX_SEQUENCE_WINDOW),
            ..self
        }
    }

    /// Sets the minimum time, in [`CLOCK_FREQ`] units, a packet waits for
    /// missing predecessors before being released. Defaults to 25 ms.
    pub fn min_playout_delay(self, min_playout_delay: i64) -> Self {
        Self {
            min_playout_delay,
            ..self
        }
    }

    /// Logs a [`PacketReport`] row for each accepted packet at info level
    /// with target [`REPORT_TARGET`] (rather than at trace level).
    pub fn report_packets(self, report_packets: bool) -> Self {
        Self {
            report_packets,
            ..self
        }
    }
}

/// Opens the output sink for a newly discovered source.
///
/// Called at most once per SSRC, and only for sources whose payload type has
/// a depacketizer. Implemented for closures of the same signature.
pub trait SinkFactory {
    fn open(&mut self, ssrc: u32, payload_type: u8) -> io::Result<Box<dyn Write>>;
}

impl<F> SinkFactory for F
where
    F: FnMut(u32, u8) -> io::Result<Box<dyn Write>>,
{
    fn open(&mut self, ssrc: u32, payload_type: u8) -> io::Result<Box<dyn Write>> {
        self(ssrc, payload_type)
    }
}

/// Per-packet measurements, as returned from [`Session::process`].
///
/// Displays as one row of a comma-separated table with
/// [`PacketReport::HEADER`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketReport {
    pub ctx: PacketContext,
    pub kind: PacketKind,
    pub ssrc: u32,

    /// The transit time deviation from the previous packet of this source,
    /// in clock-rate units. Always 0 for RTCP.
    pub jitter: i32,

    pub payload_type: u8,

    /// The RTP timestamp, or for a Sender Report the RTP timestamp it maps.
    pub timestamp: u32,

    /// Media time of this packet relative to the session's clock reference,
    /// in [`CLOCK_FREQ`] units. `None` for RTCP.
    pub pts_pcr: Option<i64>,

    /// Sender wallclock of the clock reference. `Some` only for RTCP.
    pub ntp_timestamp: Option<NtpTimestamp>,
}

impl PacketReport {
    pub const HEADER: &'static str = "num, rtcp, jitter(us), pt, timestamp, pts-pcr(us), ntp";
}

impl Display for PacketReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pts_pcr = match self.pts_pcr {
            Some(p) => p.to_string(),
            None => "-".to_owned(),
        };
        let ntp = match self.ntp_timestamp {
            Some(n) => n.to_string(),
            None => "-".to_owned(),
        };
        write!(
            f,
            "{:5}, {:1}, {:11}, {}, {:>10}, {:>9}, {}",
            self.ctx.number,
            if self.kind == PacketKind::Rtcp { "+" } else { " " },
            self.jitter,
            self.payload_type,
            self.timestamp,
            pts_pcr,
            ntp
        )
    }
}

/// An RTP session: a set of sources sharing one RTCP clock reference.
///
/// Packets must be supplied in arrival order with non-decreasing receive
/// times. Every packet error is non-fatal; the offending packet is dropped.
pub struct Session {
    options: SessionOptions,
    descriptors: Vec<PayloadDescriptor>,
    sink_factory: Box<dyn SinkFactory>,
    sources: Vec<RtpSource>,
    control: Option<RtcpSource>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.options)
            .field("descriptors", &self.descriptors)
            .field("sources", &self.sources)
            .field("control", &self.control)
            .finish()
    }
}

impl Session {
    /// Creates a session.
    ///
    /// `descriptors` resolve dynamic payload types; each payload type may
    /// appear at most once. `sink_factory` opens the output of each source
    /// with a known codec.
    pub fn new(
        descriptors: Vec<PayloadDescriptor>,
        options: SessionOptions,
        sink_factory: Box<dyn SinkFactory>,
    ) -> Result<Self, Error> {
        for (i, d) in descriptors.iter().enumerate() {
            if let Some(dup) = descriptors[..i]
                .iter()
                .find(|o| o.payload_type == d.payload_type)
            {
                bail!(ErrorInt::InvalidArgument(format!(
                    "payload type {} described twice: {} and {}",
                    d.payload_type, dup, d
                )));
            }
        }
        Ok(Session {
            options,
            descriptors,
            sink_factory,
            sources: Vec::new(),
            control: None,
        })
    }

    /// Processes a single RTP or RTCP packet received at `received` (in
    /// [`CLOCK_FREQ`] units), then releases any queued packets which are due.
    ///
    /// On error the packet is dropped and nothing is released; the next call
    /// catches up.
    pub fn process(
        &mut self,
        number: u64,
        received: i64,
        data: Bytes,
        kind: PacketKind,
    ) -> Result<PacketReport, Error> {
        let ctx = PacketContext { number, received };
        let report = match kind {
            PacketKind::Rtp => self.process_rtp(ctx, data)?,
            PacketKind::Rtcp => self.process_rtcp(ctx, data)?,
        };
        let level = if self.options.report_packets {
            Level::Info
        } else {
            Level::Trace
        };
        if log_enabled!(target: REPORT_TARGET, level) {
            log::log!(target: REPORT_TARGET, level, "{report}");
        }
        self.dequeue(received)?;
        Ok(report)
    }

    /// Releases every queued packet regardless of gaps, then flushes sinks.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.dequeue(i64::MAX)?;
        for s in &mut self.sources {
            s.flush_sink()?;
        }
        Ok(())
    }

    /// Returns the sources in order of discovery.
    pub fn sources(&self) -> &[RtpSource] {
        &self.sources
    }

    /// Returns the RTCP clock reference, if a Sender Report has been applied.
    pub fn control(&self) -> Option<&RtcpSource> {
        self.control.as_ref()
    }

    fn dequeue(&mut self, now: i64) -> Result<(), Error> {
        for s in &mut self.sources {
            s.dequeue(now, self.options.min_playout_delay)?;
        }
        Ok(())
    }

    fn process_rtp(&mut self, ctx: PacketContext, data: Bytes) -> Result<PacketReport, Error> {
        let (raw, payload_range) = match RawPacket::new(data) {
            Ok(r) => r,
            Err(e) => bail!(ErrorInt::MalformedPacket {
                pkt_ctx: ctx,
                kind: PacketKind::Rtp,
                description: e.reason.to_owned(),
                data: e.data,
            }),
        };
        let ssrc = raw.ssrc();
        let sequence_number = raw.sequence_number();
        let payload_type = raw.payload_type();

        // RFC 5761 section 4: these would collide with RTCP packet types.
        if (72..=76).contains(&payload_type) {
            bail!(ErrorInt::RtpPacketError {
                pkt_ctx: ctx,
                ssrc,
                sequence_number,
                description: format!(
                    "payload type {payload_type} is reserved for RTCP; not an RTP packet"
                ),
            });
        }

        let i = match self.sources.iter().position(|s| s.ssrc() == ssrc) {
            Some(i) => i,
            None => {
                let source = self.new_source(ctx, ssrc, sequence_number, payload_type)?;
                self.sources.push(source);
                self.sources.len() - 1
            }
        };
        let source = &mut self.sources[i];
        if source.binding().payload_type != payload_type {
            debug!(
                "[{ctx}] ssrc={ssrc:08x} payload type changed from {} to {}; \
                 treating as {}",
                source.binding().payload_type,
                payload_type,
                source.binding().encoding_name
            );
        }
        let timestamp = raw.timestamp();
        let (jitter, pts_pcr) = source.queue(
            &self.options,
            self.control.as_ref(),
            Block::new(ctx, raw, payload_range),
        )?;
        Ok(PacketReport {
            ctx,
            kind: PacketKind::Rtp,
            ssrc,
            jitter,
            payload_type,
            timestamp,
            pts_pcr: Some(pts_pcr),
            ntp_timestamp: None,
        })
    }

    fn new_source(
        &mut self,
        ctx: PacketContext,
        ssrc: u32,
        sequence_number: u16,
        payload_type: u8,
    ) -> Result<RtpSource, Error> {
        let binding = match PayloadBinding::autodetect(payload_type, &self.descriptors) {
            Some(b) => b,
            None => {
                warn!(
                    "[{ctx}] ssrc={ssrc:08x} has unknown payload type {payload_type}; \
                     its packets will be sequenced but not written"
                );
                PayloadBinding::unknown(payload_type)
            }
        };
        let depacketizer = Depacketizer::new(binding.codec);
        let sink = if depacketizer.produces_output() {
            Some(
                self.sink_factory
                    .open(ssrc, payload_type)
                    .map_err(|source| {
                        wrap!(ErrorInt::SinkOpenError {
                            ssrc,
                            payload_type,
                            source,
                        })
                    })?,
            )
        } else {
            None
        };
        info!(
            "[{ctx}] new source ssrc={ssrc:08x} pt={payload_type} ({} at {} Hz)",
            binding.encoding_name, binding.clock_rate
        );
        Ok(RtpSource::new(
            ssrc,
            sequence_number,
            binding,
            depacketizer,
            sink,
        ))
    }

    fn process_rtcp(&mut self, ctx: PacketContext, data: Bytes) -> Result<PacketReport, Error> {
        let sr = match rtcp::parse_sender_report(&data) {
            Ok(sr) => sr,
            Err(description) => bail!(ErrorInt::MalformedPacket {
                pkt_ctx: ctx,
                kind: PacketKind::Rtcp,
                description,
                data: data.clone(),
            }),
        };
        let ssrc = sr.ssrc();
        let ntp_timestamp = sr.ntp_timestamp();
        let rtp_timestamp = sr.rtp_timestamp();
        trace!(
            "[{ctx}] sender report ssrc={ssrc:08x} ntp={ntp_timestamp:?} rtp={rtp_timestamp} \
             packets={} octets={}",
            sr.packet_count(),
            sr.octet_count()
        );
        if !self.sources.iter().any(|s| s.ssrc() == ssrc) {
            bail!(ErrorInt::RtcpError {
                pkt_ctx: ctx,
                ssrc,
                description: "sender report for a source with no RTP packets yet".to_owned(),
            });
        }
        match self.control.as_mut() {
            Some(c) if c.ssrc() != ssrc => bail!(ErrorInt::RtcpError {
                pkt_ctx: ctx,
                ssrc,
                description: format!(
                    "sender report ignored; clock reference is ssrc={:08x}",
                    c.ssrc()
                ),
            }),
            Some(c) => c.update(ntp_timestamp, rtp_timestamp, ctx.received),
            None => {
                info!(
                    "[{ctx}] clock reference from ssrc={ssrc:08x}: \
                     ntp={ntp_timestamp} rtp={rtp_timestamp}"
                );
                self.control = Some(RtcpSource::new(
                    ssrc,
                    ntp_timestamp,
                    rtp_timestamp,
                    ctx.received,
                ));
            }
        }
        Ok(PacketReport {
            ctx,
            kind: PacketKind::Rtcp,
            ssrc,
            jitter: 0,
            payload_type: rtcp::SENDER_REPORT,
            timestamp: rtp_timestamp,
            pts_pcr: None,
            ntp_timestamp: Some(ntp_timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::rtp::RawPacketBuilder;
    use crate::testutil::{assert_eq_hex, init_logging, SharedSink};

    const SSRC: u32 = 0x4cac_c3d1;

    /// Sinks opened so far, as `(ssrc, payload_type, sink)`.
    type Opened = Arc<Mutex<Vec<(u32, u8, SharedSink)>>>;

    fn session(descriptors: &[&str], options: SessionOptions) -> (Session, Opened) {
        init_logging();
        let opened = Opened::default();
        let opened_clone = opened.clone();
        let factory = move |ssrc: u32, pt: u8| -> io::Result<Box<dyn Write>> {
            let sink = SharedSink::default();
            opened_clone.lock().unwrap().push((ssrc, pt, sink.clone()));
            Ok(Box::new(sink))
        };
        let descriptors = descriptors.iter().map(|d| d.parse().unwrap()).collect();
        let session = Session::new(descriptors, options, Box::new(factory)).unwrap();
        (session, opened)
    }

    fn output(opened: &Opened, ssrc: u32) -> Vec<u8> {
        let opened = opened.lock().unwrap();
        let (_, _, sink) = opened.iter().find(|(s, _, _)| *s == ssrc).unwrap();
        sink.contents()
    }

    fn rtp(ssrc: u32, payload_type: u8, sequence_number: u16, timestamp: u32, payload: &[u8]) -> Bytes {
        RawPacketBuilder {
            sequence_number,
            timestamp,
            payload_type,
            ssrc,
            mark: false,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    fn sender_report(ssrc: u32, ntp: u64, rtp_timestamp: u32) -> Bytes {
        let mut b = vec![0x80, 200, 0x00, 0x06];
        b.extend_from_slice(&ssrc.to_be_bytes());
        b.extend_from_slice(&ntp.to_be_bytes());
        b.extend_from_slice(&rtp_timestamp.to_be_bytes());
        b.extend_from_slice(&[0; 8]);
        Bytes::from(b)
    }

    /// Sends a raw (`def`) packet whose payload is its sequence number's low byte.
    fn send(s: &mut Session, number: u64, received: i64, seq: u16) -> Result<PacketReport, Error> {
        s.process(
            number,
            received,
            rtp(SSRC, 96, seq, u32::from(seq) * 3_000, &[seq as u8]),
            PacketKind::Rtp,
        )
    }

    #[test]
    fn reorders_within_deadline() {
        const PERMUTATIONS: [[u16; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for perm in PERMUTATIONS {
            let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
            send(&mut s, 0, 0, 10).unwrap();
            for (i, &p) in perm.iter().enumerate() {
                let i = i as u64 + 1;
                send(&mut s, i, i as i64 * 1_000, 11 + p).unwrap();
            }
            assert_eq!(output(&opened, SSRC), [10, 11, 12, 13], "{perm:?}");
            assert_eq!(s.sources()[0].queue_len(), 0);
            assert_eq!(s.sources()[0].packets_lost(), 0);
        }
    }

    #[test]
    fn gap_released_at_deadline() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        send(&mut s, 0, 0, 1).unwrap();
        send(&mut s, 1, 1_000, 3).unwrap();
        assert_eq!(output(&opened, SSRC), [1]);

        // Just before 3's deadline: still waiting for 2.
        send(&mut s, 2, 25_999, 4).unwrap();
        assert_eq!(output(&opened, SSRC), [1]);
        assert_eq!(s.sources()[0].queue_len(), 2);

        send(&mut s, 3, 26_000, 5).unwrap();
        assert_eq!(output(&opened, SSRC), [1, 3, 4, 5]);
        assert_eq!(s.sources()[0].packets_lost(), 1);

        // 2 finally shows up; it's queued but discarded as late.
        send(&mut s, 4, 40_000, 2).unwrap();
        assert_eq!(output(&opened, SSRC), [1, 3, 4, 5]);
        assert_eq!(s.sources()[0].queue_len(), 0);
    }

    #[test]
    fn duplicate() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        send(&mut s, 0, 0, 1).unwrap();
        send(&mut s, 1, 1_000, 3).unwrap();
        let e = send(&mut s, 2, 2_000, 3).unwrap_err();
        assert!(e.is_packet_error());
        assert!(e.to_string().contains("duplicate"), "{e}");
        assert_eq!(s.sources()[0].queue_len(), 1);
        s.flush().unwrap();
        assert_eq!(output(&opened, SSRC), [1, 3]);
    }

    #[test]
    fn resync_after_consecutive() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        send(&mut s, 0, 0, 100).unwrap();
        send(&mut s, 1, 1_000, 102).unwrap(); // waits for 101.

        // A jump of more than max_dropout is dropped until confirmed.
        send(&mut s, 2, 2_000, 5_000).unwrap_err();
        assert_eq!(s.sources()[0].queue_len(), 1);
        send(&mut s, 3, 3_000, 5_001).unwrap();

        // The queue was discarded; decoding resumes at the confirming packet.
        assert_eq!(s.sources()[0].queue_len(), 0);
        send(&mut s, 4, 4_000, 5_002).unwrap();
        s.flush().unwrap();
        assert_eq!(output(&opened, SSRC), [100, 5_001u16 as u8, 5_002u16 as u8]);
    }

    #[test]
    fn resync_after_repeat() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        send(&mut s, 0, 0, 60_000).unwrap();
        send(&mut s, 1, 1_000, 7).unwrap_err();
        send(&mut s, 2, 2_000, 7).unwrap();
        send(&mut s, 3, 3_000, 8).unwrap();
        assert_eq!(output(&opened, SSRC), [60_000u16 as u8, 7, 8]);
    }

    #[test]
    fn unconfirmed_jumps() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        send(&mut s, 0, 0, 100).unwrap();
        send(&mut s, 1, 1_000, 5_000).unwrap_err();
        send(&mut s, 2, 2_000, 9_000).unwrap_err();

        // The established sequence continues undisturbed.
        send(&mut s, 3, 3_000, 101).unwrap();
        assert_eq!(output(&opened, SSRC), [100, 101]);
    }

    #[test]
    fn narrow_misorder() {
        let options = SessionOptions::default().max_dropout(10).max_misorder(5);
        let (mut s, _opened) = session(&["96:90000:def"], options);
        send(&mut s, 0, 0, 100).unwrap();
        send(&mut s, 1, 1_000, 110).unwrap(); // 9 ahead of the expected 101.
        send(&mut s, 2, 2_000, 122).unwrap_err(); // 11 ahead of the expected 111.
        send(&mut s, 3, 3_000, 106).unwrap(); // 5 behind the expected 111.
        send(&mut s, 4, 4_000, 105).unwrap_err(); // 6 behind.
    }

    #[test]
    fn rtcp_reserved_payload_types() {
        let (mut s, opened) = session(&[], SessionOptions::default());
        for pt in 72..=76 {
            let e = s
                .process(0, 0, rtp(SSRC, pt, 1, 0, b"x"), PacketKind::Rtp)
                .unwrap_err();
            assert!(e.to_string().contains("reserved for RTCP"), "{e}");
        }
        assert!(s.sources().is_empty());
        assert!(opened.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_payload_type() {
        let (mut s, opened) = session(&["96:90000:def"], SessionOptions::default());
        s.process(0, 0, rtp(SSRC, 97, 1, 0, b"x"), PacketKind::Rtp)
            .unwrap();
        s.process(1, 1_000, rtp(SSRC, 97, 2, 0, b"y"), PacketKind::Rtp)
            .unwrap();
        s.flush().unwrap();
        assert_eq!(s.sources().len(), 1);
        assert_eq!(s.sources()[0].binding().codec, None);
        assert_eq!(s.sources()[0].packets_received(), 2);
        assert!(opened.lock().unwrap().is_empty());
    }

    #[test]
    fn sink_open_failure() {
        init_logging();
        let factory = |_: u32, _: u8| -> io::Result<Box<dyn Write>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
        };
        let mut s = Session::new(
            vec!["96:90000:def".parse().unwrap()],
            SessionOptions::default(),
            Box::new(factory),
        )
        .unwrap();
        let e = s
            .process(0, 0, rtp(SSRC, 96, 1, 0, b"x"), PacketKind::Rtp)
            .unwrap_err();
        assert!(!e.is_packet_error());
        assert!(s.sources().is_empty());
    }

    #[test]
    fn duplicate_descriptors() {
        let factory = |_: u32, _: u8| -> io::Result<Box<dyn Write>> { Ok(Box::new(io::sink())) };
        let e = Session::new(
            vec![
                "96:90000:h264".parse().unwrap(),
                "96:8000:def".parse().unwrap(),
            ],
            SessionOptions::default(),
            Box::new(factory),
        )
        .unwrap_err();
        assert!(e.to_string().contains("described twice"), "{e}");
    }

    #[test]
    fn malformed() {
        let (mut s, _opened) = session(&[], SessionOptions::default());
        let e = s
            .process(0, 0, Bytes::from_static(b"\x80\x60\x00"), PacketKind::Rtp)
            .unwrap_err();
        assert!(e.is_packet_error());
        assert!(e.to_string().contains("Malformed RTP"), "{e}");
        let e = s
            .process(1, 0, Bytes::from_static(b"\x80\xc8\x00\x00"), PacketKind::Rtcp)
            .unwrap_err();
        assert!(e.to_string().contains("Malformed RTCP"), "{e}");
    }

    #[test]
    fn jitter_and_report() {
        let (mut s, _opened) = session(&["96:90000:def"], SessionOptions::default());
        let r = s
            .process(7, 0, rtp(SSRC, 96, 1, 0, b"a"), PacketKind::Rtp)
            .unwrap();
        assert_eq!(r.jitter, 0);
        assert_eq!(r.pts_pcr, Some(0));
        let r = s
            .process(8, 11_111, rtp(SSRC, 96, 2, 1_000, b"b"), PacketKind::Rtp)
            .unwrap();
        assert_eq!(r.jitter, -1);
        assert_eq!(r.pts_pcr, Some(11_111));
        assert_eq!(
            r.to_string(),
            "    8,  ,          -1, 96,       1000,     11111, -"
        );

        // A second packet of the same frame contributes no jitter sample.
        let r = s
            .process(9, 50_000, rtp(SSRC, 96, 3, 1_000, b"c"), PacketKind::Rtp)
            .unwrap();
        assert_eq!(r.jitter, 0);
        assert_eq!(r.pts_pcr, Some(0));
        assert_eq!(s.sources()[0].avg_jitter(), 0);
    }

    #[test]
    fn rtcp_clock_reference() {
        let (mut s, _opened) = session(&["96:90000:def"], SessionOptions::default());

        // Sender reports need a known source.
        let e = s
            .process(0, 0, sender_report(SSRC, 1 << 32, 0), PacketKind::Rtcp)
            .unwrap_err();
        assert!(e.is_packet_error());
        assert!(s.control().is_none());

        s.process(1, 0, rtp(SSRC, 96, 1, 0, b"a"), PacketKind::Rtp)
            .unwrap();
        let ntp = crate::UNIX_EPOCH.0 + (10 << 32);
        let r = s
            .process(2, 100_000, sender_report(SSRC, ntp, 9_000), PacketKind::Rtcp)
            .unwrap();
        assert_eq!(r.kind, PacketKind::Rtcp);
        assert_eq!(r.timestamp, 9_000);
        assert_eq!(r.pts_pcr, None);
        assert_eq!(
            r.to_string(),
            "    2, +,           0, 200,       9000,         -, \
             1970-01-01T00:00:10.000000+00:00"
        );
        let c = s.control().unwrap();
        assert_eq!(c.ssrc(), SSRC);
        assert_eq!(c.received(), 100_000);

        // At 200 ms the sender's clock should read 18000; this packet is
        // 900 ticks (10 ms) ahead of that.
        let r = s
            .process(3, 200_000, rtp(SSRC, 96, 2, 18_900, b"b"), PacketKind::Rtp)
            .unwrap();
        assert_eq!(r.pts_pcr, Some(10_000));

        // Other sources use the same reference, at their own clock rate.
        let (mut s2, _opened) = session(&["96:90000:def", "97:8000:def"], SessionOptions::default());
        s2.process(0, 0, rtp(SSRC, 96, 1, 0, b"a"), PacketKind::Rtp)
            .unwrap();
        s2.process(1, 0, rtp(2, 97, 1, 0, b"a"), PacketKind::Rtp)
            .unwrap();
        s2.process(2, 0, sender_report(SSRC, ntp, 0), PacketKind::Rtcp)
            .unwrap();
        let r = s2
            .process(3, 1_000_000, rtp(2, 97, 2, 8_400, b"b"), PacketKind::Rtp)
            .unwrap();
        assert_eq!(r.pts_pcr, Some(50_000));

        // Reports from another SSRC don't move the reference.
        s2.process(4, 2_000_000, sender_report(2, ntp + 1, 0), PacketKind::Rtcp)
            .unwrap_err();
        let c = s2.control().unwrap();
        assert_eq!(c.ssrc(), SSRC);
        assert_eq!(c.reports(), 1);
    }

    #[test]
    fn h264_stream() {
        let (mut s, opened) = session(&["96:90000:h264"], SessionOptions::default());
        let packets: [&[u8]; 3] = [
            b"\x7c\x85slice ",
            b"\x7c\x05con",
            b"\x7c\x45tinued",
        ];
        for (i, p) in packets.iter().enumerate() {
            s.process(
                i as u64,
                i as i64 * 100,
                rtp(SSRC, 96, i as u16, 1234, p),
                PacketKind::Rtp,
            )
            .unwrap();
        }
        s.flush().unwrap();
        let mut expected = b"\x00\x00\x00\x01".to_vec();
        expected.extend_from_slice(&crate::codec::h264::timestamp_sei(1234).unwrap());
        expected.extend_from_slice(b"\x00\x00\x00\x01\x65slice continued");
        assert_eq_hex!(output(&opened, SSRC), expected);
        assert_eq!(s.sources()[0].bytes_written(), expected.len() as u64);
    }

    #[test]
    fn sink_write_failure() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        init_logging();
        let factory = |_: u32, _: u8| -> io::Result<Box<dyn Write>> { Ok(Box::new(Broken)) };
        let mut s = Session::new(
            vec!["96:90000:def".parse().unwrap()],
            SessionOptions::default(),
            Box::new(factory),
        )
        .unwrap();
        let e = send(&mut s, 0, 0, 1).unwrap_err();
        assert!(!e.is_packet_error());
        assert!(e.to_string().contains("disk full"), "{e}");
    }

    #[test]
    fn sequence_window_clamped() {
        let o = SessionOptions::default()
            .max_dropout(u16::MAX)
            .max_misorder(0x8000);
        assert_eq!(o.max_dropout, 0x7fff);
        assert_eq!(o.max_misorder, 0x7fff);

        // A forward jump just inside the widest window is released, not
        // mistaken for a late packet.
        let (mut s, opened) = session(&["96:90000:def"], o);
        send(&mut s, 0, 0, 0).unwrap();
        send(&mut s, 1, 1_000, 1).unwrap();
        send(&mut s, 2, 2_000, 0x7fff).unwrap();
        s.flush().unwrap();
        assert_eq!(output(&opened, SSRC), [0, 1, 0xff]);
        assert_eq!(s.sources()[0].packets_lost(), 0x7ffd);
    }

    #[test]
    fn port_kind() {
        assert_eq!(PacketKind::for_port(1234), PacketKind::Rtp);
        assert_eq!(PacketKind::for_port(1235), PacketKind::Rtcp);
    }
}
