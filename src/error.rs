// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{session::PacketKind, PacketContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Currently the focus is on providing detailed human-readable error messages.
/// Packet-level errors carry the packet number and receive time, which is
/// enough to find the offending packet in the capture.
///
/// Apart from errors returned by [`crate::Session::new`], every error is
/// non-fatal: the session drops the offending packet and stays usable.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns true iff this error describes a single bad or unwanted packet,
    /// as opposed to a failure of the output sink or caller configuration.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            *self.0,
            ErrorInt::MalformedPacket { .. }
                | ErrorInt::RtpPacketError { .. }
                | ErrorInt::RtcpError { .. }
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable RTP or RTCP packet.
    #[error(
        "[{pkt_ctx}] Malformed {kind} packet: {description}\n{:?}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    MalformedPacket {
        pkt_ctx: PacketContext,
        kind: PacketKind,
        description: String,
        data: Bytes,
    },

    /// A well-formed RTP packet that the session won't queue.
    #[error("[{pkt_ctx}, ssrc={ssrc:08x}, seq={sequence_number:04x}] {description}")]
    RtpPacketError {
        pkt_ctx: PacketContext,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    /// A well-formed RTCP packet that the session won't use.
    #[error("[{pkt_ctx}, ssrc={ssrc:08x}] {description}")]
    RtcpError {
        pkt_ctx: PacketContext,
        ssrc: u32,
        description: String,
    },

    #[error("Unable to open output for ssrc={ssrc:08x} pt={payload_type}: {source}")]
    SinkOpenError {
        ssrc: u32,
        payload_type: u8,
        source: std::io::Error,
    },

    #[error("Error writing output for ssrc={ssrc:08x}: {source}")]
    SinkWriteError { ssrc: u32, source: std::io::Error },
}
