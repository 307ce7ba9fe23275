// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parses the hex-text capture dump: one UDP datagram per line, as
//! `<number>, <HH:MM:SS.ffffff>, <dst port>, <hex bytes>`.

use anyhow::{anyhow, bail, Context, Error};
use bytes::Bytes;
use chrono::{NaiveTime, Timelike};

/// A single captured datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct Datagram {
    pub number: u64,

    /// Time of day, in µs since midnight.
    pub received: i64,

    pub port: u16,
    pub data: Bytes,
}

pub fn parse_line(line: &str) -> Result<Datagram, Error> {
    let mut fields = line.splitn(4, ',').map(str::trim);
    let (Some(number), Some(time), Some(port), Some(payload)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        bail!("expected 4 comma-separated fields");
    };
    let number = u64::from_str_radix(number, 10)
        .with_context(|| format!("bad packet number {number:?}"))?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f")
        .with_context(|| format!("bad time of day {time:?}"))?;
    let received = i64::from(time.num_seconds_from_midnight()) * 1_000_000
        + i64::from(time.nanosecond() / 1_000);
    let port = u16::from_str_radix(port, 10).with_context(|| format!("bad port {port:?}"))?;
    let digits: String = payload.split_ascii_whitespace().collect();
    let data = hex::decode(&digits).map_err(|e| anyhow!("bad packet bytes: {e}"))?;
    if data.is_empty() {
        bail!("no packet bytes");
    }
    Ok(Datagram {
        number,
        received,
        port,
        data: Bytes::from(data),
    })
}
