// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Depacketizes the RTP streams of a hex-text packet capture into
//! elementary stream files, one per SSRC.

mod input;

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, warn};
use rtpdepay::{PacketKind, PacketReport, PayloadDescriptor, Session, SessionOptions};

#[derive(Parser)]
struct Opts {
    /// UDP destination port of the RTP stream; RTCP is read from the next port.
    #[arg(long, default_value_t = 1234)]
    port: u16,

    /// Describes a dynamic payload type as `pt:freq:codec`, where codec is one
    /// of h264, h265, def, or hpvc. May be repeated.
    #[arg(short = 'd', long = "descriptor")]
    descriptors: Vec<PayloadDescriptor>,

    /// Prints a row per packet on stdout.
    #[arg(short = 'r', long)]
    result: bool,

    /// Directory in which to write `pt<pt>_0x<ssrc>.es` files.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Capture to read; defaults to stdin.
    input: Option<PathBuf>,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    init_logging();
    if let Err(e) = main_inner() {
        error!("Fatal: {}", itertools::join(e.chain(), "\ncaused by: "));
        std::process::exit(1);
    }
    info!("Done");
}

fn main_inner() -> Result<(), Error> {
    let opts = Opts::parse();
    let out_dir = opts.out_dir.clone();
    let sink_factory = move |ssrc: u32, payload_type: u8| -> io::Result<Box<dyn Write>> {
        let path = out_dir.join(format!("pt{payload_type}_0x{ssrc:x}.es"));
        info!("writing ssrc={ssrc:08x} to {}", path.display());
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    };
    let mut session = Session::new(
        opts.descriptors,
        SessionOptions::default(),
        Box::new(sink_factory),
    )?;

    let input: Box<dyn BufRead> = match &opts.input {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("unable to open {}", p.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };
    let mut stdout = io::stdout().lock();
    if opts.result {
        writeln!(stdout, "{}", PacketReport::HEADER)?;
    }
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        let datagram = match input::parse_line(&line) {
            Ok(d) => d,
            Err(e) => {
                info!("stopping at line {}: {e}", i + 1);
                break;
            }
        };
        if datagram.port != opts.port && Some(datagram.port) != opts.port.checked_add(1) {
            continue;
        }
        let kind = PacketKind::for_port(datagram.port);
        match session.process(datagram.number, datagram.received, datagram.data, kind) {
            Ok(report) => {
                if opts.result {
                    writeln!(stdout, "{report}")?;
                }
            }
            Err(e) if e.is_packet_error() => {
                warn!("{e}");
                if opts.result {
                    writeln!(stdout, "{:5}, ----", datagram.number)?;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    session.flush()?;
    stdout.flush()?;

    for s in session.sources() {
        let b = s.binding();
        info!(
            "ssrc={:08x} pt={} ({} at {} Hz): {} packets received, {} lost, \
             {} bytes written, jitter {}",
            s.ssrc(),
            b.payload_type,
            b.encoding_name,
            b.clock_rate,
            s.packets_received(),
            s.packets_lost(),
            s.bytes_written(),
            s.avg_jitter()
        );
    }
    if let Some(c) = session.control() {
        info!(
            "clock reference ssrc={:08x}: {} sender reports, last ntp={}",
            c.ssrc(),
            c.reports(),
            c.ntp_timestamp()
        );
    }
    Ok(())
}
