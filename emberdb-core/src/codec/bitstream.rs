//! Bit-level I/O over a segment [`Buffer`].
//!
//! Unlike a streaming bit writer, this one keeps the buffer byte-complete
//! after every bit: the partial tail byte is poked back on each write, so a
//! concurrent reader or a post-crash replay always sees the full bitstream
//! up to the published record count. A writer can be resumed at any bit
//! cursor recovered by replaying with a [`BitReader`].

use crate::buffer::Buffer;
use crate::error::Result;

/// Cursor-poking bit writer.
pub struct BitWriter {
    byte_off: usize,
    bit_off: u8,
    cur: u8,
}

impl BitWriter {
    /// Fresh stream starting at `byte_off`
    pub fn new(byte_off: usize) -> Self {
        Self {
            byte_off,
            bit_off: 0,
            cur: 0,
        }
    }

    /// Resume at a bit cursor; reloads the partial tail byte from the buffer
    pub fn resume(buf: &Buffer, byte_off: usize, bit_off: u8) -> Result<Self> {
        let cur = if bit_off > 0 { buf.get_u8_at(byte_off)? } else { 0 };
        Ok(Self {
            byte_off,
            bit_off,
            cur,
        })
    }

    pub fn write_bit(&mut self, buf: &mut Buffer, bit: bool) -> Result<()> {
        if bit {
            self.cur |= 0x80 >> self.bit_off;
        }
        buf.put_u8_at(self.byte_off, self.cur)?;
        self.bit_off += 1;
        if self.bit_off == 8 {
            self.byte_off += 1;
            self.bit_off = 0;
            self.cur = 0;
        }
        Ok(())
    }

    /// Write the low `count` bits of `value`, most significant first
    pub fn write_bits(&mut self, buf: &mut Buffer, value: u64, count: u8) -> Result<()> {
        for i in (0..count).rev() {
            self.write_bit(buf, (value >> i) & 1 == 1)?;
        }
        Ok(())
    }

    /// Bytes of the buffer this stream has touched
    pub fn bytes_used(&self) -> usize {
        self.byte_off + usize::from(self.bit_off > 0)
    }
}

/// Bit reader over the same layout.
pub struct BitReader {
    byte_off: usize,
    bit_off: u8,
}

impl BitReader {
    pub fn new(byte_off: usize) -> Self {
        Self {
            byte_off,
            bit_off: 0,
        }
    }

    pub fn read_bit(&mut self, buf: &Buffer) -> Result<bool> {
        let byte = buf.get_u8_at(self.byte_off)?;
        let bit = byte & (0x80 >> self.bit_off) != 0;
        self.bit_off += 1;
        if self.bit_off == 8 {
            self.byte_off += 1;
            self.bit_off = 0;
        }
        Ok(bit)
    }

    /// Read `count` bits, most significant first
    pub fn read_bits(&mut self, buf: &Buffer, count: u8) -> Result<u64> {
        let mut v = 0u64;
        for _ in 0..count {
            v = (v << 1) | u64::from(self.read_bit(buf)?);
        }
        Ok(v)
    }

    /// Current cursor, for handing off to [`BitWriter::resume`]
    pub fn cursor(&self) -> (usize, u8) {
        (self.byte_off, self.bit_off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_roundtrip() {
        let mut buf = Buffer::heap(64);
        let mut w = BitWriter::new(0);
        w.write_bits(&mut buf, 0b1011, 4).unwrap();
        w.write_bits(&mut buf, 0xDEAD_BEEF, 32).unwrap();
        w.write_bit(&mut buf, true).unwrap();

        let mut r = BitReader::new(0);
        assert_eq!(r.read_bits(&buf, 4).unwrap(), 0b1011);
        assert_eq!(r.read_bits(&buf, 32).unwrap(), 0xDEAD_BEEF);
        assert!(r.read_bit(&buf).unwrap());
    }

    #[test]
    fn test_partial_byte_visible_before_alignment() {
        let mut buf = Buffer::heap(8);
        let mut w = BitWriter::new(0);
        w.write_bits(&mut buf, 0b101, 3).unwrap();
        // the tail byte already holds the three bits
        assert_eq!(buf.get_u8_at(0).unwrap(), 0b1010_0000);
        assert_eq!(w.bytes_used(), 1);
    }

    #[test]
    fn test_resume_continues_stream() {
        let mut buf = Buffer::heap(8);
        let mut w = BitWriter::new(0);
        w.write_bits(&mut buf, 0b11001, 5).unwrap();

        let mut r = BitReader::new(0);
        r.read_bits(&buf, 5).unwrap();
        let (byte_off, bit_off) = r.cursor();

        let mut w2 = BitWriter::resume(&buf, byte_off, bit_off).unwrap();
        w2.write_bits(&mut buf, 0b010, 3).unwrap();

        let mut r2 = BitReader::new(0);
        assert_eq!(r2.read_bits(&buf, 8).unwrap(), 0b1100_1010);
    }
}
