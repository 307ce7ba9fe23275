// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-SSRC state: sequencing, jitter, clock derivation, and the reorder queue.

use std::collections::VecDeque;
use std::io::Write;

use bytes::BytesMut;
use log::{debug, info, trace, warn};

use super::control::RtcpSource;
use super::SessionOptions;
use crate::codec::{Depacketizer, PayloadBinding, PayloadMeta};
use crate::error::ErrorInt;
use crate::rtp::Block;
use crate::{Error, CLOCK_FREQ};

/// Returns the signed deviation of a packet's transit time from the previous
/// packet's, in clock-rate units: `D(i-1, i)` of
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
///
/// The receive interval is converted to clock-rate units with truncating
/// integer division. RTP timestamps are compared modulo 2^32.
pub(crate) fn transit_deviation(
    now: i64,
    last_rx: i64,
    timestamp: u32,
    last_timestamp: u32,
    clock_rate: u32,
) -> i64 {
    let rx_interval = now.saturating_sub(last_rx).saturating_mul(i64::from(clock_rate)) / CLOCK_FREQ;
    rx_interval - i64::from(timestamp.wrapping_sub(last_timestamp) as i32)
}

/// Folds `|d|` into the jitter estimate: `J += (|D| - J) / 16`, rounded.
pub(crate) fn update_jitter(avg_jitter: u32, d: i64) -> u32 {
    let avg = i64::from(avg_jitter);
    let next = avg + ((d.saturating_abs() - avg + 8) >> 4);
    next.clamp(0, i64::from(u32::MAX)) as u32
}

/// State of a single synchronization source.
///
/// Created on the first RTP packet with a new SSRC and kept for the lifetime
/// of the session.
pub struct RtpSource {
    ssrc: u32,
    binding: PayloadBinding,

    /// Interarrival jitter estimate, in clock-rate units.
    avg_jitter: u32,

    /// Receive time and RTP timestamp of the previous packet.
    last_arrival: Option<(i64, u32)>,

    /// RTP timestamp of the provisional clock reference, used until the
    /// session has an RTCP Sender Report.
    ref_rtp: Option<u32>,

    /// Next sequence number not yet seen in order.
    max_seq: u16,

    /// Sequence number which would confirm a discontinuity, if one is pending.
    bad_seq: Option<u16>,

    /// Sequence number of the last released packet.
    last_seq: u16,

    /// Queued packets in ascending sequence number order, without duplicates.
    queue: VecDeque<Block>,

    depacketizer: Depacketizer,
    sink: Option<Box<dyn Write>>,

    /// Depacketizer output, reused across packets.
    buf: BytesMut,

    packets_received: u64,
    packets_lost: u64,
    bytes_written: u64,
}

impl std::fmt::Debug for RtpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSource")
            .field("ssrc", &format_args!("{:08x}", self.ssrc))
            .field("binding", &self.binding)
            .field("avg_jitter", &self.avg_jitter)
            .field("max_seq", &self.max_seq)
            .field("bad_seq", &self.bad_seq)
            .field("last_seq", &self.last_seq)
            .field("queued", &self.queue.len())
            .field("depacketizer", &self.depacketizer)
            .finish()
    }
}

impl RtpSource {
    pub(crate) fn new(
        ssrc: u32,
        init_seq: u16,
        binding: PayloadBinding,
        depacketizer: Depacketizer,
        sink: Option<Box<dyn Write>>,
    ) -> Self {
        RtpSource {
            ssrc,
            binding,
            avg_jitter: 0,
            last_arrival: None,
            ref_rtp: None,
            max_seq: init_seq,
            bad_seq: None,
            last_seq: init_seq.wrapping_sub(1),
            queue: VecDeque::new(),
            depacketizer,
            sink,
            buf: BytesMut::new(),
            packets_received: 0,
            packets_lost: 0,
            bytes_written: 0,
        }
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[inline]
    pub fn binding(&self) -> &PayloadBinding {
        &self.binding
    }

    /// Returns the interarrival jitter estimate, in clock-rate units.
    #[inline]
    pub fn avg_jitter(&self) -> u32 {
        self.avg_jitter
    }

    /// Packets accepted into the queue.
    #[inline]
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Sequence numbers skipped when releasing packets.
    #[inline]
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    /// Bytes written to this source's output sink.
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Packets waiting in the reorder queue.
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns the local time after which a packet received at `received`
    /// is released even if earlier sequence numbers are still missing.
    ///
    /// Waits three times the jitter estimate (about 99.7% of arrivals for
    /// Gaussian jitter) but at least `min_playout_delay`.
    pub(crate) fn playout_deadline(&self, received: i64, min_playout_delay: i64) -> i64 {
        let jitter_delay = CLOCK_FREQ * 3 * i64::from(self.avg_jitter)
            / i64::from(self.binding.clock_rate.get());
        received.saturating_add(jitter_delay.max(min_playout_delay))
    }

    /// Measures, checks, and enqueues a packet.
    ///
    /// On success, returns the packet's jitter sample and PTS-PCR offset.
    pub(crate) fn queue(
        &mut self,
        options: &SessionOptions,
        control: Option<&RtcpSource>,
        mut block: Block,
    ) -> Result<(i32, i64), Error> {
        let now = block.ctx.received;
        let timestamp = block.timestamp();
        let sequence_number = block.sequence_number();
        let clock_rate = self.binding.clock_rate;
        let freq = i64::from(clock_rate.get());

        // Jitter is independent of sequencing. Packets sharing a timestamp
        // are pieces of one frame sent back to back, so don't count them.
        if let Some((last_rx, last_ts)) = self.last_arrival {
            if timestamp != last_ts {
                let d = transit_deviation(now, last_rx, timestamp, last_ts, clock_rate.get());
                block.jitter = d.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                self.avg_jitter = update_jitter(self.avg_jitter, d);
            }
        }
        self.last_arrival = Some((now, timestamp));

        let ref_rtp = match control {
            Some(c) => c.rtp_timestamp_at(now, clock_rate),
            None => {
                let r = *self.ref_rtp.get_or_insert(timestamp);
                self.ref_rtp = Some(timestamp);
                r
            }
        };
        block.pts_pcr = CLOCK_FREQ * i64::from(timestamp.wrapping_sub(ref_rtp) as i32) / freq;

        let delta = sequence_number.wrapping_sub(self.max_seq) as i16;
        let out_of_range = if delta > 0 {
            delta.unsigned_abs() > options.max_dropout
        } else {
            delta.unsigned_abs() > options.max_misorder
        };
        if out_of_range {
            let confirmed = self.bad_seq.is_some_and(|bad| {
                sequence_number == bad || sequence_number.wrapping_add(1) == bad
            });
            if !confirmed {
                self.bad_seq = Some(sequence_number.wrapping_add(1));
                bail!(ErrorInt::RtpPacketError {
                    pkt_ctx: block.ctx,
                    ssrc: self.ssrc,
                    sequence_number,
                    description: format!(
                        "sequence discontinuity; expected seq={:04x}. Dropping until confirmed.",
                        self.max_seq
                    ),
                });
            }
            info!(
                "[{}] ssrc={:08x} sequence resynchronized at seq={:04x}; \
                 discarding {} queued packets",
                block.ctx,
                self.ssrc,
                sequence_number,
                self.queue.len()
            );
            self.queue.clear();
            self.max_seq = sequence_number.wrapping_add(1);
            self.bad_seq = None;
            self.last_seq = sequence_number.wrapping_sub(1);
        } else if delta >= 0 {
            self.max_seq = sequence_number.wrapping_add(1);
        }

        let mut pos = self.queue.len();
        for (i, queued) in self.queue.iter().enumerate() {
            let d = sequence_number.wrapping_sub(queued.sequence_number()) as i16;
            if d < 0 {
                pos = i;
                break;
            } else if d == 0 {
                bail!(ErrorInt::RtpPacketError {
                    pkt_ctx: block.ctx,
                    ssrc: self.ssrc,
                    sequence_number,
                    description: format!(
                        "duplicate packet; first received as {}",
                        queued.ctx
                    ),
                });
            }
        }
        trace!("queueing {:?}", &block);
        let r = (block.jitter, block.pts_pcr);
        self.queue.insert(pos, block);
        self.packets_received += 1;
        Ok(r)
    }

    /// Releases every queued packet which is next in sequence or whose
    /// playout deadline is at or before `now`.
    pub(crate) fn dequeue(&mut self, now: i64, min_playout_delay: i64) -> Result<(), Error> {
        while let Some(head) = self.queue.front() {
            let gap = head.sequence_number().wrapping_sub(self.last_seq.wrapping_add(1)) as i16;
            if gap > 0 && now < self.playout_deadline(head.ctx.received, min_playout_delay) {
                break;
            }
            self.release_head()?;
        }
        Ok(())
    }

    /// Pops the head of the queue and hands it to the depacketizer.
    fn release_head(&mut self) -> Result<(), Error> {
        let Some(mut block) = self.queue.pop_front() else {
            return Ok(());
        };
        let sequence_number = block.sequence_number();
        let gap = sequence_number.wrapping_sub(self.last_seq.wrapping_add(1));
        if gap >= 0x8000 {
            debug!(
                "[{}] ssrc={:08x} ignoring late packet seq={:04x}",
                block.ctx, self.ssrc, sequence_number
            );
            return Ok(());
        }
        if gap > 0 {
            warn!(
                "[{}] ssrc={:08x} {} packet(s) lost before seq={:04x}",
                block.ctx, self.ssrc, gap, sequence_number
            );
            block.discontinuity = true;
            self.packets_lost += u64::from(gap);
        }
        self.last_seq = sequence_number;

        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        self.buf.clear();
        let meta = PayloadMeta {
            timestamp: block.timestamp(),
            discontinuity: block.discontinuity,
        };
        if let Err(description) = self.depacketizer.push(meta, block.payload(), &mut self.buf) {
            debug!(
                "[{}] ssrc={:08x} seq={:04x} dropping {} payload: {}\n{:?}",
                block.ctx,
                self.ssrc,
                sequence_number,
                self.binding.encoding_name,
                description,
                crate::hex::LimitedHex::new(block.payload(), 64),
            );
        }
        if !self.buf.is_empty() {
            sink.write_all(&self.buf).map_err(|source| {
                wrap!(ErrorInt::SinkWriteError {
                    ssrc: self.ssrc,
                    source,
                })
            })?;
            self.bytes_written += self.buf.len() as u64;
        }
        Ok(())
    }

    pub(crate) fn flush_sink(&mut self) -> Result<(), Error> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush().map_err(|source| {
                wrap!(ErrorInt::SinkWriteError {
                    ssrc: self.ssrc,
                    source,
                })
            })?;
        }
        Ok(())
    }
}
