// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Depacketizers which don't interpret the payload at all.

use bytes::{BufMut, BytesMut};

/// Writes each payload unchanged (`def`), or behind its length as a 4-byte
/// little-endian integer (`hpvc`) so payload boundaries can be recovered.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    length_prefixed: bool,
}

impl Depacketizer {
    pub(super) fn new(length_prefixed: bool) -> Self {
        Depacketizer { length_prefixed }
    }

    pub(super) fn push(&mut self, payload: &[u8], out: &mut BytesMut) {
        if self.length_prefixed {
            // RTP payloads are under 64 KiB, so this can't truncate.
            out.put_u32_le(payload.len() as u32);
        }
        out.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw() {
        let mut d = Depacketizer::new(false);
        let mut out = BytesMut::new();
        d.push(b"\x01\x02", &mut out);
        d.push(b"", &mut out);
        d.push(b"\x03", &mut out);
        assert_eq!(&out[..], b"\x01\x02\x03");
    }

    #[test]
    fn length_prefixed() {
        let mut d = Depacketizer::new(true);
        let mut out = BytesMut::new();
        d.push(b"abc", &mut out);
        d.push(b"", &mut out);
        assert_eq!(&out[..], b"\x03\x00\x00\x00abc\x00\x00\x00\x00");
    }
}
