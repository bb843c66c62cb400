//! Bit-packed gorilla codec, used for compacted segments.
//!
//! Time payload: `[count:i32][header-ts:i64]` then a bitstream of
//! delta-of-delta records with variable-width prefix codes. Value payload:
//! `[count:i32]` then XOR records reusing the previous leading/trailing-zero
//! window when it still fits.
//!
//! Appends stay crash- and reader-safe the same way the byte codec does:
//! every bit lands in the buffer immediately (see
//! [`bitstream`](super::bitstream)) and the count word is bumped last.

use crate::buffer::Buffer;
use crate::codec::bitstream::{BitReader, BitWriter};
use crate::codec::{SegmentReader, SegmentWriter};
use crate::error::{EmberError, Result};
use crate::types::Predicate;

/// Worst-case time record: 4 prefix bits + 64 payload bits
const TIME_RECORD_MAX: usize = 10;
/// Worst-case value record: 2 control + 6 leading + 6 length + 64 bits
const VALUE_RECORD_MAX: usize = 11;

/// Sentinel: no XOR window established yet
const NO_WINDOW: u8 = u8::MAX;

fn encode_dod(bits: &mut BitWriter, buf: &mut Buffer, dod: i64) -> Result<()> {
    if dod == 0 {
        bits.write_bit(buf, false)
    } else if (-63..=64).contains(&dod) {
        bits.write_bits(buf, 0b10, 2)?;
        bits.write_bits(buf, (dod + 63) as u64, 7)
    } else if (-255..=256).contains(&dod) {
        bits.write_bits(buf, 0b110, 3)?;
        bits.write_bits(buf, (dod + 255) as u64, 9)
    } else if (-2047..=2048).contains(&dod) {
        bits.write_bits(buf, 0b1110, 4)?;
        bits.write_bits(buf, (dod + 2047) as u64, 12)
    } else {
        bits.write_bits(buf, 0b1111, 4)?;
        bits.write_bits(buf, dod as u64, 64)
    }
}

fn decode_dod(bits: &mut BitReader, buf: &Buffer) -> Result<i64> {
    if !bits.read_bit(buf)? {
        return Ok(0);
    }
    if !bits.read_bit(buf)? {
        return Ok(bits.read_bits(buf, 7)? as i64 - 63);
    }
    if !bits.read_bit(buf)? {
        return Ok(bits.read_bits(buf, 9)? as i64 - 255);
    }
    if !bits.read_bit(buf)? {
        return Ok(bits.read_bits(buf, 12)? as i64 - 2047);
    }
    Ok(bits.read_bits(buf, 64)? as i64)
}

/// Time-family writer.
pub struct GorillaTimeWriter {
    buf: Buffer,
    start: usize,
    bits: BitWriter,
    count: usize,
    header_ts: i64,
    prev_ts: i64,
    prev_delta: i64,
    read_only: bool,
}

impl GorillaTimeWriter {
    pub fn new(mut buf: Buffer, existing: bool) -> Result<Self> {
        let start = buf.position();
        if existing {
            let count = buf.get_i32_volatile_at(start)? as usize;
            buf.set_position(start + 4)?;
            let header_ts = buf.get_i64()?;
            let mut bits = BitReader::new(start + 12);
            let mut prev_ts = header_ts;
            let mut prev_delta = 0i64;
            for _ in 0..count {
                let dod = decode_dod(&mut bits, &buf)?;
                prev_delta += dod;
                prev_ts += prev_delta;
            }
            let (byte_off, bit_off) = bits.cursor();
            let bits = BitWriter::resume(&buf, byte_off, bit_off)?;
            Ok(Self {
                buf,
                start,
                bits,
                count,
                header_ts,
                prev_ts,
                prev_delta,
                read_only: false,
            })
        } else {
            buf.put_i32(0)?;
            buf.put_i64(0)?;
            Ok(Self {
                buf,
                start,
                bits: BitWriter::new(start + 12),
                count: 0,
                header_ts: 0,
                prev_ts: 0,
                prev_delta: 0,
                read_only: false,
            })
        }
    }
}

impl SegmentWriter for GorillaTimeWriter {
    fn add(&mut self, value: i64) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if self.buf.limit().saturating_sub(self.bits.bytes_used()) < TIME_RECORD_MAX {
            return Err(EmberError::SegmentFull);
        }
        let delta = value - self.prev_ts;
        let dod = delta - self.prev_delta;
        encode_dod(&mut self.bits, &mut self.buf, dod)?;
        self.prev_ts = value;
        self.prev_delta = delta;
        self.count += 1;
        self.buf.put_i32_volatile_at(self.start, self.count as i32)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn position(&self) -> usize {
        self.bits.bytes_used()
    }

    fn set_header_timestamp(&mut self, ts: i64) -> Result<()> {
        if self.count != 0 {
            return Err(EmberError::Corruption(
                "header timestamp set after first record".to_string(),
            ));
        }
        let pos = self.buf.position();
        self.buf.set_position(self.start + 4)?;
        self.buf.put_i64(ts)?;
        self.buf.set_position(pos)?;
        self.header_ts = ts;
        self.prev_ts = ts;
        Ok(())
    }

    fn header_timestamp(&self) -> i64 {
        self.header_ts
    }

    fn make_read_only(&mut self) {
        self.read_only = true;
        self.buf.mark_read_only();
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        let snapshot = self.buf.get_i32_volatile_at(self.start)? as usize;
        let mut buf = self.buf.duplicate();
        buf.set_position(self.start + 4)?;
        let header_ts = buf.get_i64()?;
        Ok(Box::new(GorillaTimeReader {
            buf,
            bits: BitReader::new(self.start + 12),
            count: snapshot,
            read: 0,
            prev_ts: header_ts,
            prev_delta: 0,
            predicate: None,
        }))
    }
}

pub struct GorillaTimeReader {
    buf: Buffer,
    bits: BitReader,
    count: usize,
    read: usize,
    prev_ts: i64,
    prev_delta: i64,
    predicate: Option<Predicate>,
}

impl SegmentReader for GorillaTimeReader {
    fn read(&mut self) -> Result<i64> {
        if self.read >= self.count {
            return Err(EmberError::EndOfSegment);
        }
        let dod = decode_dod(&mut self.bits, &self.buf)?;
        self.prev_delta += dod;
        self.prev_ts += self.prev_delta;
        self.read += 1;
        if let Some(p) = &self.predicate {
            if !p(self.prev_ts) {
                return Err(EmberError::ValueFiltered);
            }
        }
        Ok(self.prev_ts)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn set_predicate(&mut self, predicate: Predicate) {
        self.predicate = Some(predicate);
    }
}

/// Value-family writer.
pub struct GorillaValueWriter {
    buf: Buffer,
    start: usize,
    bits: BitWriter,
    count: usize,
    prev: i64,
    leading: u8,
    trailing: u8,
    read_only: bool,
}

impl GorillaValueWriter {
    pub fn new(mut buf: Buffer, existing: bool) -> Result<Self> {
        let start = buf.position();
        if existing {
            let count = buf.get_i32_volatile_at(start)? as usize;
            let mut bits = BitReader::new(start + 4);
            let mut state = XorState::new();
            for _ in 0..count {
                state.decode(&mut bits, &buf)?;
            }
            let (byte_off, bit_off) = bits.cursor();
            let bits = BitWriter::resume(&buf, byte_off, bit_off)?;
            Ok(Self {
                buf,
                start,
                bits,
                count,
                prev: state.prev,
                leading: state.leading,
                trailing: state.trailing,
                read_only: false,
            })
        } else {
            buf.put_i32(0)?;
            Ok(Self {
                buf,
                start,
                bits: BitWriter::new(start + 4),
                count: 0,
                prev: 0,
                leading: NO_WINDOW,
                trailing: 0,
                read_only: false,
            })
        }
    }
}

impl SegmentWriter for GorillaValueWriter {
    fn add(&mut self, value: i64) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if self.buf.limit().saturating_sub(self.bits.bytes_used()) < VALUE_RECORD_MAX {
            return Err(EmberError::SegmentFull);
        }
        let xor = (self.prev ^ value) as u64;
        if xor == 0 {
            self.bits.write_bit(&mut self.buf, false)?;
        } else {
            self.bits.write_bit(&mut self.buf, true)?;
            let lead = (xor.leading_zeros() as u8).min(63);
            let trail = xor.trailing_zeros() as u8;
            if self.leading != NO_WINDOW && lead >= self.leading && trail >= self.trailing {
                // previous window still covers the meaningful bits
                let len = 64 - self.leading - self.trailing;
                self.bits.write_bit(&mut self.buf, false)?;
                self.bits
                    .write_bits(&mut self.buf, xor >> self.trailing, len)?;
            } else {
                let len = 64 - lead - trail;
                self.bits.write_bit(&mut self.buf, true)?;
                self.bits.write_bits(&mut self.buf, lead as u64, 6)?;
                // len is 1..=64, stored biased by one to fit 6 bits
                self.bits.write_bits(&mut self.buf, (len - 1) as u64, 6)?;
                self.bits.write_bits(&mut self.buf, xor >> trail, len)?;
                self.leading = lead;
                self.trailing = trail;
            }
        }
        self.prev = value;
        self.count += 1;
        self.buf.put_i32_volatile_at(self.start, self.count as i32)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn position(&self) -> usize {
        self.bits.bytes_used()
    }

    fn set_header_timestamp(&mut self, _ts: i64) -> Result<()> {
        Ok(())
    }

    fn header_timestamp(&self) -> i64 {
        0
    }

    fn make_read_only(&mut self) {
        self.read_only = true;
        self.buf.mark_read_only();
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        let snapshot = self.buf.get_i32_volatile_at(self.start)? as usize;
        Ok(Box::new(GorillaValueReader {
            buf: self.buf.duplicate(),
            bits: BitReader::new(self.start + 4),
            count: snapshot,
            read: 0,
            state: XorState::new(),
            predicate: None,
        }))
    }
}

/// Shared XOR decode state (reader and recovery replay)
struct XorState {
    prev: i64,
    leading: u8,
    trailing: u8,
}

impl XorState {
    fn new() -> Self {
        Self {
            prev: 0,
            leading: NO_WINDOW,
            trailing: 0,
        }
    }

    fn decode(&mut self, bits: &mut BitReader, buf: &Buffer) -> Result<i64> {
        if bits.read_bit(buf)? {
            if bits.read_bit(buf)? {
                self.leading = bits.read_bits(buf, 6)? as u8;
                let len = bits.read_bits(buf, 6)? as u8 + 1;
                self.trailing = 64 - self.leading - len;
                let xor = bits.read_bits(buf, len)? << self.trailing;
                self.prev ^= xor as i64;
            } else {
                if self.leading == NO_WINDOW {
                    return Err(EmberError::Corruption(
                        "window reuse before any window was set".to_string(),
                    ));
                }
                let len = 64 - self.leading - self.trailing;
                let xor = bits.read_bits(buf, len)? << self.trailing;
                self.prev ^= xor as i64;
            }
        }
        Ok(self.prev)
    }
}

pub struct GorillaValueReader {
    buf: Buffer,
    bits: BitReader,
    count: usize,
    read: usize,
    state: XorState,
    predicate: Option<Predicate>,
}

impl SegmentReader for GorillaValueReader {
    fn read(&mut self) -> Result<i64> {
        if self.read >= self.count {
            return Err(EmberError::EndOfSegment);
        }
        let v = self.state.decode(&mut self.bits, &self.buf)?;
        self.read += 1;
        if let Some(p) = &self.predicate {
            if !p(v) {
                return Err(EmberError::ValueFiltered);
            }
        }
        Ok(v)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn set_predicate(&mut self, predicate: Predicate) {
        self.predicate = Some(predicate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn drain(reader: &mut dyn SegmentReader) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            match reader.read() {
                Ok(v) => out.push(v),
                Err(EmberError::EndOfSegment) => break,
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }
        out
    }

    #[test]
    fn test_time_roundtrip_regular_interval() {
        let mut w = GorillaTimeWriter::new(Buffer::heap(4096), false).unwrap();
        let base = 1_700_000_000_000i64;
        w.set_header_timestamp(base).unwrap();
        let expected: Vec<i64> = (1..=500).map(|i| base + i * 1000).collect();
        for &ts in &expected {
            w.add(ts).unwrap();
        }
        // steady interval compresses to roughly a bit per record
        assert!(w.position() < 12 + 100);
        let mut r = w.reader().unwrap();
        assert_eq!(drain(r.as_mut()), expected);
    }

    #[test]
    fn test_time_roundtrip_random_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut w = GorillaTimeWriter::new(Buffer::heap(8192), false).unwrap();
        let mut ts = 1_700_000_000_000i64;
        w.set_header_timestamp(ts).unwrap();
        let mut expected = Vec::new();
        for _ in 0..300 {
            ts += rng.gen_range(1..=120_000);
            w.add(ts).unwrap();
            expected.push(ts);
        }
        let mut r = w.reader().unwrap();
        assert_eq!(drain(r.as_mut()), expected);
    }

    #[test]
    fn test_value_roundtrip_floats() {
        let mut w = GorillaValueWriter::new(Buffer::heap(8192), false).unwrap();
        let values: Vec<i64> = [1.5f64, 1.5, 2.25, 2.5, -19.75, 0.0, 1e300]
            .iter()
            .map(|v| v.to_bits() as i64)
            .collect();
        for &v in &values {
            w.add(v).unwrap();
        }
        let mut r = w.reader().unwrap();
        assert_eq!(drain(r.as_mut()), values);
    }

    #[test]
    fn test_value_recovery_restores_window() {
        let buf = Buffer::heap(8192);
        let shared = buf.duplicate();
        let mut w = GorillaValueWriter::new(buf, false).unwrap();
        let first: Vec<i64> = (0..100).map(|i| i * 31 + 7).collect();
        for &v in &first {
            w.add(v).unwrap();
        }
        drop(w);

        let mut w2 = GorillaValueWriter::new(shared, true).unwrap();
        assert_eq!(w2.count(), 100);
        for v in [12345i64, -98765, 0] {
            w2.add(v).unwrap();
        }
        let mut r = w2.reader().unwrap();
        let all = drain(r.as_mut());
        assert_eq!(all.len(), 103);
        assert_eq!(&all[..100], &first[..]);
        assert_eq!(&all[100..], &[12345, -98765, 0]);
    }

    #[test]
    fn test_time_recovery_resumes_mid_byte() {
        let buf = Buffer::heap(4096);
        let shared = buf.duplicate();
        let mut w = GorillaTimeWriter::new(buf, false).unwrap();
        w.set_header_timestamp(1000).unwrap();
        // these records leave the bit cursor mid-byte
        for ts in [2000, 3000, 4000] {
            w.add(ts).unwrap();
        }
        drop(w);

        let mut w2 = GorillaTimeWriter::new(shared, true).unwrap();
        w2.add(5000).unwrap();
        let mut r = w2.reader().unwrap();
        assert_eq!(drain(r.as_mut()), vec![2000, 3000, 4000, 5000]);
    }

    #[test]
    fn test_segment_full_signal() {
        let mut w = GorillaTimeWriter::new(Buffer::heap(12 + TIME_RECORD_MAX), false).unwrap();
        w.set_header_timestamp(0).unwrap();
        w.add(1_000_000_000).unwrap();
        assert!(w.add(2_000_000_000).unwrap_err().is_rollover());
    }
}
