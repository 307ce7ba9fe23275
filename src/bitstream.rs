// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MSB-first bit writer with the Exp-Golomb codes of
//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) section 9.1.
//!
//! This is the writing counterpart of `h264_reader::rbsp::BitReader`. It's
//! used to serialize small synthetic NAL units such as the timestamp SEI in
//! [`crate::codec::h264`].

use bitstream_io::{BigEndian, BitWrite, BitWriter};

/// Number of bits in the `ue(v)` encoding of each value below 256.
const UE_SIZE: [u8; 256] = ue_size_table();

const fn ue_size_table() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut v = 0;
    while v < 256 {
        let x = (v + 1) as u32;
        t[v] = (2 * (31 - x.leading_zeros()) + 1) as u8;
        v += 1;
    }
    t
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "{requested}-bit write at bit position {position} overflows \
         {capacity}-byte buffer"
    )]
    Overflow {
        position: usize,
        requested: u32,
        capacity: usize,
    },

    #[error("value {value:#x} doesn't fit in {bits} bits")]
    ValueTooLarge { bits: u32, value: u64 },

    #[error("te(v) value {value} exceeds range max {max}")]
    TruncatedRange { max: u32, value: u32 },
}

/// A bounded big-endian bit writer.
///
/// Writes never exceed the capacity supplied to [`Writer::with_capacity`];
/// an attempt to do so fails with [`Error::Overflow`] and leaves the
/// writer unchanged.
pub struct Writer {
    inner: BitWriter<Vec<u8>, BigEndian>,

    /// Bits written so far.
    pos: usize,

    capacity_bytes: usize,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("pos", &self.pos)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}

impl Writer {
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Writer {
            inner: BitWriter::endian(Vec::with_capacity(capacity_bytes), BigEndian),
            pos: 0,
            capacity_bytes,
        }
    }

    /// Returns the number of bits written so far.
    #[inline]
    pub fn position_in_bits(&self) -> usize {
        self.pos
    }

    fn reserve(&self, bits: u32) -> Result<(), Error> {
        if self.pos + bits as usize > self.capacity_bytes * 8 {
            return Err(Error::Overflow {
                position: self.pos,
                requested: bits,
                capacity: self.capacity_bytes,
            });
        }
        Ok(())
    }

    /// Writes the low `bits` bits of `value`, most significant first.
    /// `bits` must be at most 64.
    fn put(&mut self, bits: u32, value: u64) -> Result<(), Error> {
        if bits == 0 {
            return Ok(());
        }
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(Error::ValueTooLarge { bits, value });
        }
        self.reserve(bits)?;

        // Writes to a `Vec` can't fail; the only errors bitstream_io reports
        // are for bit counts and values already checked above.
        self.inner
            .write(bits, value)
            .map_err(|_| Error::ValueTooLarge { bits, value })?;
        self.pos += bits as usize;
        Ok(())
    }

    /// Writes `value` as an unsigned integer of `bits` bits, `0 <= bits <= 32`.
    pub fn write(&mut self, bits: u32, value: u32) -> Result<(), Error> {
        if bits > 32 {
            return Err(Error::ValueTooLarge {
                bits,
                value: value.into(),
            });
        }
        self.put(bits, value.into())
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<(), Error> {
        self.put(1, u64::from(bit))
    }

    /// Writes `ue(v)`: unsigned Exp-Golomb.
    pub fn write_ue(&mut self, value: u32) -> Result<(), Error> {
        if let Some(&size) = UE_SIZE.get(value as usize) {
            return self.put(u32::from(size), u64::from(value) + 1);
        }
        self.write_ue_wide(u64::from(value))
    }

    /// General path for `ue(v)` of values that may need more than 32 bits
    /// of code, as `se(i32::MIN)` does.
    fn write_ue_wide(&mut self, value: u64) -> Result<(), Error> {
        let x = value + 1;
        let leading_zeros = x.ilog2();
        self.reserve(2 * leading_zeros + 1)?;
        self.put(leading_zeros, 0)?;
        self.put(leading_zeros + 1, x)
    }

    /// Writes `se(v)`: signed Exp-Golomb.
    pub fn write_se(&mut self, value: i32) -> Result<(), Error> {
        let mapped = if value > 0 {
            2 * u64::from(value.unsigned_abs()) - 1
        } else {
            2 * u64::from(value.unsigned_abs())
        };
        match u32::try_from(mapped) {
            Ok(m) => self.write_ue(m),
            Err(_) => self.write_ue_wide(mapped),
        }
    }

    /// Writes `te(v)` for a syntax element with range `0..=max`.
    pub fn write_te(&mut self, max: u32, value: u32) -> Result<(), Error> {
        if value > max {
            return Err(Error::TruncatedRange { max, value });
        }
        if max > 1 {
            self.write_ue(value)
        } else {
            self.write_bit(value == 0)
        }
    }

    /// Pads with zero bits to the next byte boundary.
    pub fn align_to_byte(&mut self) -> Result<(), Error> {
        let pad = (8 - self.pos % 8) % 8;
        self.put(pad as u32, 0)
    }

    /// Writes `rbsp_trailing_bits()`: a stop bit and zero bits to alignment.
    pub fn rbsp_trailing_bits(&mut self) -> Result<(), Error> {
        self.write_bit(true)?;
        self.align_to_byte()
    }

    /// Flushes any partial byte (zero-padded) and returns the written bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        self.align_to_byte()?;
        debug_assert!(self.inner.byte_aligned());
        Ok(self.inner.into_writer())
    }
}
